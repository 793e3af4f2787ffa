//! Drives the radiology workflow of an imaging modality: Modality Worklist queries, the Modality
//! Performed Procedure Step lifecycle and the transfer of acquired instances to an archive.

pub mod api;
pub mod backend;
pub mod config;
pub mod types;
pub mod workflow;

use std::sync::Arc;
use workflow::service::WorkflowService;

#[derive(Clone)]
pub struct AppState {
	pub service: Arc<WorkflowService>,
}
