//! The procedure-step lifecycle and transfer orchestration engine.
//!
//! Leaf components first:
//! - [`template`] binds workflow fields onto prototype datasets.
//! - [`aggregate`] groups acquired files into series.
//! - [`worklist`] queries the scheduling peer.
//! - [`mpps`] drives the Modality Performed Procedure Step state machine.
//! - [`rewrite`] relinks structured objects to freshly aggregated instances.
//! - [`transfer`] stores files and series on a storage peer.
//!
//! [`service::WorkflowService`] ties them to configuration and converts every outcome into a
//! [`model::WorkflowResponse`].

pub mod aggregate;
pub mod dataset;
pub mod model;
pub mod mpps;
pub mod rewrite;
pub mod service;
pub mod template;
pub mod transfer;
pub mod worklist;

use crate::backend::dimse::association::AssociationError;
use crate::backend::ServiceError;
use crate::types::US;
use model::StepStatus;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
	#[error("Failed to establish association: {0}")]
	Association(#[from] AssociationError),
	#[error("Peer rejected the request with status 0x{0:04x}")]
	PeerRejected(US),
	#[error("Failed to store file {}", path.display())]
	StoreRejected { path: PathBuf, status: US },
	#[error("No SOP Instance UIDs found.")]
	NoInstancesFound,
	#[error("Unsupported input: {0}")]
	Unsupported(String),
	#[error("ROIContourSequence does not have enough items for index {0}")]
	IndexOutOfRange(usize),
	#[error("Found {instances} SOP instances for {references} contour image references")]
	LengthMismatch { instances: usize, references: usize },
	#[error("Failed to read {}: {source}", path.display())]
	MissingFile {
		path: PathBuf,
		source: dicom::object::ReadError,
	},
	#[error("Path does not exist: {}", .0.display())]
	PathNotFound(PathBuf),
	#[error("Malformed payload: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("Cannot transition procedure step from {from} to {to}")]
	InvalidTransition { from: StepStatus, to: StepStatus },
	#[error("Procedure step has no MPPS instance UID")]
	MissingStepInstance,
	#[error("Invalid dataset: {0}")]
	Dataset(String),
	#[error(transparent)]
	Service(#[from] ServiceError),
	#[error("Transfer was cancelled")]
	Cancelled,
	#[error("No endpoint named '{0}' is configured")]
	UnknownEndpoint(String),
}
