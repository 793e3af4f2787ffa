//! This module contains the DIMSE implementation of the [`NetworkService`].
//! - Worklist queries are sent as C-FIND requests (Modality Worklist Information Model).
//! - Procedure steps are created with N-CREATE and updated with N-SET (MPPS SOP class).
//! - Acquired instances are sent as C-STORE requests.
//!

mod cfind;
mod cstore;
mod nservice;

pub mod association;

use crate::backend::{
	FindMatch, NetworkService, PresentationParameter, RemotePeer, ServiceError, Session,
	StoreInstance,
};
use crate::types::{Priority, UI, US};
use association::client::{ClientAssociation, ClientAssociationOptions};
use association::tls::TlsLoader;
use association::{Association, AssociationError};
use async_stream::try_stream;
use async_trait::async_trait;
use cfind::{CompositeFindRequest, CompositeFindResponse};
use cstore::{CompositeStoreRequest, CompositeStoreResponse};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use futures::{Stream, TryStreamExt};
use nservice::{
	NormalizedCreateRequest, NormalizedCreateResponse, NormalizedSetRequest, NormalizedSetResponse,
};
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message contains a data set.
/// This is the recommended value when creating new [`InMemDicomObject`]s for compatibility reasons.
/// For reading DICOM messages, prefer checking if (command_data_set_type != DATA_SET_MISSING) as
/// AEs are free to choose another value for a truthy state.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message has no data set.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

/// Represents a DICOM message composed of a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	/// The command set.
	pub command: InMemDicomObject,
	/// The data set.
	pub data: Option<InMemDicomObject>,
	/// The presentation context id
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

impl DicomMessage {
	/// Reads the mandatory Status (0000,0900) attribute of a response command set.
	pub fn status(&self) -> Result<US, ReadError> {
		self.command
			.get(tags::STATUS)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.ok_or(ReadError::MissingAttribute(tags::STATUS))
	}

	/// Checks that the Command Field (0000,0100) names the `expected` primitive.
	pub fn expect_command_field(&self, expected: US) -> Result<(), ReadError> {
		let received = self
			.command
			.get(tags::COMMAND_FIELD)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.ok_or(ReadError::MissingAttribute(tags::COMMAND_FIELD))?;
		if received != expected {
			return Err(ReadError::UnexpectedCommand { expected, received });
		}
		Ok(())
	}
}

/// Status types supported by the DIMSE services.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF => Ok(Self::Failure),
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

pub trait DicomMessageReader {
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError>;
}

pub trait DicomMessageWriter {
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError>;
}

impl<A: Association> DicomMessageWriter for A {
	#[instrument(skip_all)]
	async fn write_message(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let message: DicomMessage = Into::into(message);

		let presentation_context = match presentation_context_id.or(message.presentation_context_id) {
			None => self.presentation_contexts().first(),
			Some(presentation_context_id) => self
				.presentation_contexts()
				.iter()
				.find(|pctx| pctx.id == presentation_context_id),
		}
		.ok_or(NegotiationError::NoPresentationContext)?;

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

		let command_pdu = Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Command,
				presentation_context_id: presentation_context.id,
				is_last: true,
				data: command_buf,
			}],
		};
		self.send(command_pdu, timeout).await?;

		if let Some(data) = message.data {
			let transfer_syntax = TransferSyntaxRegistry
				.get(&presentation_context.transfer_syntax)
				.ok_or_else(|| {
					NegotiationError::UnknownTransferSyntax(UI::from(
						&presentation_context.transfer_syntax,
					))
				})?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;

			let data_pdu = Pdu::PData {
				data: vec![PDataValue {
					value_type: PDataValueType::Data,
					presentation_context_id: presentation_context.id,
					is_last: true,
					data: data_buf,
				}],
			};

			self.send(data_pdu, timeout).await?;
		}

		Ok(())
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Box<Pdu>),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute {0} is missing")]
	MissingAttribute(Tag),
	#[error("Expected command field 0x{expected:04x}, received 0x{received:04x}")]
	UnexpectedCommand { expected: US, received: US },
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Failed to negotiate a presentation context")]
	NoPresentationContext,
}

impl<A: Association> DicomMessageReader for A {
	#[instrument(skip_all)]
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut message_command: Option<InMemDicomObject> = None;

		loop {
			let pdu = self.receive(timeout).await?;
			if let Pdu::PData { data } = pdu {
				for mut pdv in data {
					match pdv.value_type {
						PDataValueType::Command => {
							trace!("Received command fragment (last={})", pdv.is_last);
							if message_command.is_some() {
								// Already received the full command set.
								// Receiving another command fragment is not expected.
								return Err(ReadError::OutOfOrder);
							}
							command_fragments.append(&mut pdv.data);
							if pdv.is_last {
								let command = InMemDicomObject::read_dataset_with_ts(
									command_fragments.as_slice(),
									&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
								)?;
								let has_data_set = command
									.get(tags::COMMAND_DATA_SET_TYPE)
									.map(InMemElement::to_int::<US>)
									.and_then(Result::ok)
									.is_some_and(|value| value != DATA_SET_MISSING);

								if has_data_set {
									message_command = Some(command);
								} else {
									return Ok(DicomMessage {
										command,
										data: None,
										presentation_context_id: Some(pdv.presentation_context_id),
									});
								}
							}
						}
						PDataValueType::Data => {
							trace!("Received data fragment (last={})", pdv.is_last);
							data_fragments.append(&mut pdv.data);
							if pdv.is_last {
								let presentation_context = self
									.presentation_contexts()
									.iter()
									.find(|pctx| pctx.id == pdv.presentation_context_id)
									.ok_or(NegotiationError::NoPresentationContext)?;
								let transfer_syntax = TransferSyntaxRegistry
									.get(&presentation_context.transfer_syntax)
									.ok_or_else(|| {
										NegotiationError::UnknownTransferSyntax(UI::from(
											&presentation_context.transfer_syntax,
										))
									})?;
								let data = InMemDicomObject::read_dataset_with_ts(
									data_fragments.as_slice(),
									transfer_syntax,
								)?;

								// Cannot handle data fragments before the entire command set is received.
								let command = message_command.ok_or(ReadError::OutOfOrder)?;
								return Ok(DicomMessage {
									command,
									data: Some(data),
									presentation_context_id: Some(pdv.presentation_context_id),
								});
							}
						}
					}
				}
			} else {
				return Err(ReadError::UnexpectedPdu(Box::new(pdu)));
			}
		}
	}
}

/// Returns a new message id by incrementing a global counter.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(1);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}

/// [`NetworkService`] backed by DICOM Upper Layer associations.
pub struct DimseNetworkService {
	timeout: Duration,
	tls: TlsLoader,
}

impl DimseNetworkService {
	pub fn new(timeout: Duration, certs_dir: impl Into<PathBuf>) -> Self {
		Self {
			timeout,
			tls: TlsLoader::new(certs_dir),
		}
	}
}

#[async_trait]
impl NetworkService for DimseNetworkService {
	#[instrument(skip_all, fields(peer = %peer))]
	async fn associate(
		&self,
		peer: &RemotePeer,
		presentation: PresentationParameter,
	) -> Result<Box<dyn Session>, AssociationError> {
		let address = tokio::net::lookup_host((peer.host.as_str(), peer.port))
			.await
			.map_err(AssociationError::Resolve)?
			.next()
			.ok_or_else(|| AssociationError::Resolve(std::io::ErrorKind::NotFound.into()))?;

		let tls = if peer.tls {
			Some(self.tls.client_config()?)
		} else {
			None
		};

		let options = ClientAssociationOptions {
			calling_aet: peer.calling_aet.clone(),
			called_aet: peer.called_aet.clone(),
			abstract_syntax: presentation.abstract_syntax_uid,
			transfer_syntaxes: presentation.transfer_syntax_uids,
			address,
			server_name: peer.host.clone(),
			tls,
		};
		let association = ClientAssociation::new(options).await?;
		debug!(
			backend_uuid = association.uuid().to_string(),
			"Established client association"
		);

		Ok(Box::new(DimseSession {
			association,
			timeout: self.timeout,
		}))
	}
}

/// A [`Session`] over one client association.
pub struct DimseSession {
	association: ClientAssociation,
	timeout: Duration,
}

impl DimseSession {
	fn find_stream(
		&self,
		sop_class_uid: &str,
		identifier: InMemDicomObject,
	) -> impl Stream<Item = Result<FindMatch, ServiceError>> + '_ {
		let request = CompositeFindRequest {
			message_id: next_message_id(),
			priority: Priority::Medium as US,
			affected_sop_class_uid: UI::from(sop_class_uid),
			identifier,
		};

		try_stream! {
			self.association.write_message(request, None, self.timeout).await?;
			trace!("Sent C-FIND-RQ");

			loop {
				let response = self.association.read_message(self.timeout).await?;
				let response = CompositeFindResponse::try_from(response)?;
				trace!(status = response.status, "Received C-FIND-RSP");

				let status_type = StatusType::try_from(response.status)
					.unwrap_or(StatusType::Failure);

				if let Some(identifier) = response.data {
					yield FindMatch { status: response.status, identifier };
				}

				if status_type != StatusType::Pending {
					if status_type != StatusType::Success {
						warn!(status = response.status, "C-FIND finished with {status_type:?}");
					}
					break;
				}
			}
		}
	}
}

#[async_trait]
impl Session for DimseSession {
	#[instrument(skip_all)]
	async fn find(
		&mut self,
		sop_class_uid: &str,
		identifier: InMemDicomObject,
	) -> Result<Vec<FindMatch>, ServiceError> {
		self.find_stream(sop_class_uid, identifier)
			.try_collect()
			.await
	}

	#[instrument(skip_all, fields(sop_instance_uid = sop_instance_uid))]
	async fn create(
		&mut self,
		sop_class_uid: &str,
		sop_instance_uid: &str,
		data_set: InMemDicomObject,
	) -> Result<US, ServiceError> {
		let request = NormalizedCreateRequest {
			message_id: next_message_id(),
			affected_sop_class_uid: UI::from(sop_class_uid),
			affected_sop_instance_uid: UI::from(sop_instance_uid),
			data_set,
		};
		self.association
			.write_message(request, None, self.timeout)
			.await?;
		trace!("Sent N-CREATE-RQ");

		let response = self.association.read_message(self.timeout).await?;
		let response = NormalizedCreateResponse::try_from(response)?;
		debug!(status = response.status, "Received N-CREATE-RSP");
		Ok(response.status)
	}

	#[instrument(skip_all, fields(sop_instance_uid = sop_instance_uid))]
	async fn set(
		&mut self,
		sop_class_uid: &str,
		sop_instance_uid: &str,
		data_set: InMemDicomObject,
	) -> Result<US, ServiceError> {
		let request = NormalizedSetRequest {
			message_id: next_message_id(),
			requested_sop_class_uid: UI::from(sop_class_uid),
			requested_sop_instance_uid: UI::from(sop_instance_uid),
			data_set,
		};
		self.association
			.write_message(request, None, self.timeout)
			.await?;
		trace!("Sent N-SET-RQ");

		let response = self.association.read_message(self.timeout).await?;
		let response = NormalizedSetResponse::try_from(response)?;
		debug!(status = response.status, "Received N-SET-RSP");
		Ok(response.status)
	}

	#[instrument(skip_all, fields(sop_instance_uid = %instance.sop_instance_uid))]
	async fn store(&mut self, instance: StoreInstance) -> Result<US, ServiceError> {
		let request = CompositeStoreRequest {
			affected_sop_class_uid: instance.sop_class_uid,
			affected_sop_instance_uid: instance.sop_instance_uid,
			priority: Priority::Medium as US,
			message_id: next_message_id(),
			data_set: instance.data_set,
		};
		self.association
			.write_message(request, None, self.timeout)
			.await?;

		let response = self.association.read_message(self.timeout).await?;
		let response = CompositeStoreResponse::try_from(response)?;
		debug!(status = response.status, "Received C-STORE-RSP");
		Ok(response.status)
	}

	async fn release(self: Box<Self>) {
		let Self {
			association,
			timeout,
		} = *self;
		let uuid = association.uuid().to_string();
		if let Err(err) = association.release(timeout).await {
			warn!(backend_uuid = uuid, "Failed to release association: {err}");
		} else {
			debug!(backend_uuid = uuid, "Released client association");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_classification() {
		assert_eq!(StatusType::try_from(0x0000), Ok(StatusType::Success));
		assert_eq!(StatusType::try_from(0xFF00), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(0xFF01), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(0xB000), Ok(StatusType::Warning));
		assert_eq!(StatusType::try_from(0xA700), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0x0110), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0xFE00), Ok(StatusType::Cancel));
		assert_eq!(StatusType::try_from(0xC123), Err(0xC123));
	}

	#[test]
	fn message_ids_increase() {
		let first = next_message_id();
		let second = next_message_id();
		assert_ne!(first, second);
	}
}
