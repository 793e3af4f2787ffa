//! Network primitives the workflow engine drives against its peers.
//!
//! The engine only talks to [`NetworkService`] and [`Session`]. Every unit of work (one query
//! pair, one create, one set, one store group) opens a session, issues its primitives and
//! releases the session before returning.

pub mod dimse;

#[cfg(test)]
pub mod mock;

use crate::types::{AE, UI, US};
use async_trait::async_trait;
use dicom::object::InMemDicomObject;
use dimse::association::AssociationError;
use dimse::{ReadError, StatusType, WriteError};
use thiserror::Error;

/// Status code of a successful DIMSE operation. Every other code is passed through verbatim.
pub const STATUS_SUCCESS: US = 0x0000;

/// Connection identity of a remote application entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
	pub calling_aet: AE,
	pub called_aet: AE,
	pub host: String,
	pub port: u16,
	pub tls: bool,
}

impl std::fmt::Display for RemotePeer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}@{}:{}", self.called_aet, self.host, self.port)
	}
}

/// The presentation context proposed for an association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationParameter {
	pub abstract_syntax_uid: UI,
	pub transfer_syntax_uids: Vec<UI>,
}

/// One identifier returned by a C-FIND, together with the status of its response.
#[derive(Debug, Clone)]
pub struct FindMatch {
	pub status: US,
	pub identifier: InMemDicomObject,
}

impl FindMatch {
	/// Only pending responses carry matches. An identifier on a final response is not a match.
	pub fn is_pending(&self) -> bool {
		matches!(StatusType::try_from(self.status), Ok(StatusType::Pending))
	}
}

/// A composite instance ready to be sent with C-STORE.
#[derive(Debug, Clone)]
pub struct StoreInstance {
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub data_set: InMemDicomObject,
}

#[derive(Debug, Error)]
pub enum ServiceError {
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
}

/// Opens associations with remote peers.
#[async_trait]
pub trait NetworkService: Send + Sync {
	async fn associate(
		&self,
		peer: &RemotePeer,
		presentation: PresentationParameter,
	) -> Result<Box<dyn Session>, AssociationError>;
}

/// An established association. Primitives block until the peer answered or the
/// configured timeout elapsed.
#[async_trait]
pub trait Session: Send {
	/// C-FIND. Returns the identifiers carried by the pending responses in the order the peer
	/// sent them.
	async fn find(
		&mut self,
		sop_class_uid: &str,
		identifier: InMemDicomObject,
	) -> Result<Vec<FindMatch>, ServiceError>;

	/// N-CREATE.
	async fn create(
		&mut self,
		sop_class_uid: &str,
		sop_instance_uid: &str,
		data_set: InMemDicomObject,
	) -> Result<US, ServiceError>;

	/// N-SET.
	async fn set(
		&mut self,
		sop_class_uid: &str,
		sop_instance_uid: &str,
		data_set: InMemDicomObject,
	) -> Result<US, ServiceError>;

	/// C-STORE.
	async fn store(&mut self, instance: StoreInstance) -> Result<US, ServiceError>;

	/// Gracefully releases the association.
	async fn release(self: Box<Self>);
}
