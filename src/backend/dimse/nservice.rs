//! Normalized services used for Modality Performed Procedure Step.
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_10.html>

use crate::backend::dimse::{DicomMessage, ReadError, DATA_SET_EXISTS};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_NORMALIZED_SET_REQUEST: US = 0x0120;
pub const COMMAND_FIELD_NORMALIZED_SET_RESPONSE: US = 0x8120;
pub const COMMAND_FIELD_NORMALIZED_CREATE_REQUEST: US = 0x0140;
pub const COMMAND_FIELD_NORMALIZED_CREATE_RESPONSE: US = 0x8140;

/// N-CREATE-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_10.3.5.html#table_10.3-9>
pub struct NormalizedCreateRequest {
	pub message_id: US,
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub data_set: InMemDicomObject,
}

impl From<NormalizedCreateRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: NormalizedCreateRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_NORMALIZED_CREATE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
		]);

		Self {
			command,
			data: Some(request.data_set),
			presentation_context_id: None,
		}
	}
}

/// N-SET-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_10.3.3.html#table_10.3-5>
pub struct NormalizedSetRequest {
	pub message_id: US,
	pub requested_sop_class_uid: UI,
	pub requested_sop_instance_uid: UI,
	pub data_set: InMemDicomObject,
}

impl From<NormalizedSetRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: NormalizedSetRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::REQUESTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.requested_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_NORMALIZED_SET_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::REQUESTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.requested_sop_instance_uid)),
		]);

		Self {
			command,
			data: Some(request.data_set),
			presentation_context_id: None,
		}
	}
}

/// N-CREATE-RSP
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_10.3.5.html#table_10.3-10>
#[derive(Debug)]
pub struct NormalizedCreateResponse {
	pub status: US,
}

impl TryFrom<DicomMessage> for NormalizedCreateResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		message.expect_command_field(COMMAND_FIELD_NORMALIZED_CREATE_RESPONSE)?;
		Ok(Self {
			status: message.status()?,
		})
	}
}

/// N-SET-RSP
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_10.3.3.html#table_10.3-6>
#[derive(Debug)]
pub struct NormalizedSetResponse {
	pub status: US,
}

impl TryFrom<DicomMessage> for NormalizedSetResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		message.expect_command_field(COMMAND_FIELD_NORMALIZED_SET_RESPONSE)?;
		Ok(Self {
			status: message.status()?,
		})
	}
}
