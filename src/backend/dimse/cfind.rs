use crate::backend::dimse::{DicomMessage, ReadError, DATA_SET_EXISTS};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_FIND_REQUEST: US = 0x0020;
pub const COMMAND_FIELD_COMPOSITE_FIND_RESPONSE: US = 0x8020;

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
pub struct CompositeFindRequest {
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
}

impl From<CompositeFindRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeFindRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
		]);

		Self {
			command,
			data: Some(request.identifier),
			presentation_context_id: None,
		}
	}
}

/// C-FIND-RSP
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-3>
#[derive(Debug)]
pub struct CompositeFindResponse {
	pub status: US,
	pub data: Option<InMemDicomObject>,
}

impl TryFrom<DicomMessage> for CompositeFindResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		message.expect_command_field(COMMAND_FIELD_COMPOSITE_FIND_RESPONSE)?;
		let status = message.status()?;
		Ok(Self {
			status,
			data: message.data,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::object::mem::InMemElement;

	#[test]
	fn request_carries_identifier_and_command_field() {
		let identifier = InMemDicomObject::from_element_iter([DataElement::new(
			tags::ACCESSION_NUMBER,
			VR::SH,
			dicom_value!(Str, "ACC1"),
		)]);
		let message = DicomMessage::from(CompositeFindRequest {
			message_id: 7,
			priority: 0,
			affected_sop_class_uid: UI::from("1.2.840.10008.5.1.4.31"),
			identifier,
		});

		let command_field = message
			.command
			.get(tags::COMMAND_FIELD)
			.map(InMemElement::to_int::<US>);
		assert_eq!(
			command_field.and_then(Result::ok),
			Some(COMMAND_FIELD_COMPOSITE_FIND_REQUEST)
		);
		assert!(message.data.is_some());
	}

	#[test]
	fn response_without_status_is_rejected() {
		let message = DicomMessage {
			command: InMemDicomObject::command_from_element_iter([DataElement::new(
				tags::COMMAND_FIELD,
				VR::US,
				dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_FIND_RESPONSE]),
			)]),
			data: None,
			presentation_context_id: None,
		};
		assert!(matches!(
			CompositeFindResponse::try_from(message),
			Err(ReadError::MissingAttribute(tag)) if tag == tags::STATUS
		));
	}

	#[test]
	fn response_of_another_primitive_is_rejected() {
		let message = DicomMessage {
			command: InMemDicomObject::command_from_element_iter([
				DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8001])),
				DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
			]),
			data: None,
			presentation_context_id: None,
		};
		assert!(matches!(
			CompositeFindResponse::try_from(message),
			Err(ReadError::UnexpectedCommand {
				expected: COMMAND_FIELD_COMPOSITE_FIND_RESPONSE,
				received: 0x8001,
			})
		));
	}
}
