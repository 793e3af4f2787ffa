//! The boundary facade. Every operation resolves its endpoint by name, runs one component and
//! reports the outcome as a [`WorkflowResponse`]; none of them fail.

use crate::backend::{NetworkService, RemotePeer};
use crate::config::AppConfig;
use crate::types::UI;
use crate::workflow::dataset::{put_str, update_item};
use crate::workflow::model::{
	serialize_groups, DiscontinueRequest, HeadlessStoreRequest, ProcedureStep, WorkflowResponse,
	WorklistEndpoint, WorklistQuery,
};
use crate::workflow::mpps::ProcedureStepLifecycle;
use crate::workflow::template::DatasetTemplate;
use crate::workflow::transfer::TransferPipeline;
use crate::workflow::worklist::WorklistQueryEngine;
use crate::workflow::WorkflowError;
use dicom::core::VR;
use dicom::dictionary_std::tags;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

/// Parses a request body. An empty body reads as the default request.
fn parse<T: DeserializeOwned + Default>(body: &str) -> Result<T, WorkflowError> {
	if body.trim().is_empty() {
		return Ok(T::default());
	}
	Ok(serde_json::from_str(body)?)
}

fn load_template(
	path: Option<&Path>,
	builtin: impl FnOnce() -> DatasetTemplate,
) -> Result<DatasetTemplate, WorkflowError> {
	path.map_or_else(|| Ok(builtin()), DatasetTemplate::load)
}

fn respond<T>(
	result: Result<T, WorkflowError>,
	success: impl FnOnce(T) -> WorkflowResponse,
) -> WorkflowResponse {
	match result {
		Ok(value) => success(value),
		Err(err) => {
			warn!("Workflow operation failed: {err}");
			WorkflowResponse::failure(err.to_string())
		}
	}
}

pub struct WorkflowService {
	config: AppConfig,
	worklists: WorklistQueryEngine,
	lifecycle: ProcedureStepLifecycle,
	transfer: TransferPipeline,
}

impl WorkflowService {
	pub fn new(network: Arc<dyn NetworkService>, config: AppConfig) -> Self {
		Self {
			worklists: WorklistQueryEngine::new(Arc::clone(&network)),
			lifecycle: ProcedureStepLifecycle::new(Arc::clone(&network)),
			transfer: TransferPipeline::new(network, config.storage.extra_sop_classes.clone()),
			config,
		}
	}

	/// Running transfers stop before their next store once `cancellation` is cancelled.
	#[must_use]
	pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
		self.transfer = self.transfer.with_cancellation(cancellation);
		self
	}

	pub fn worklist_names(&self) -> Vec<String> {
		self.config
			.worklists
			.iter()
			.map(|endpoint| endpoint.name.clone())
			.collect()
	}

	pub fn peer_names(&self) -> Vec<String> {
		self.config
			.peers
			.iter()
			.map(|peer| peer.name.clone())
			.collect()
	}

	fn endpoint(&self, name: &str) -> Result<&WorklistEndpoint, WorkflowError> {
		self.config
			.worklist(name)
			.ok_or_else(|| WorkflowError::UnknownEndpoint(name.to_owned()))
	}

	fn storage_peer(&self, name: &str) -> Result<RemotePeer, WorkflowError> {
		self.config
			.peer(name)
			.map(|peer| peer.peer())
			.ok_or_else(|| WorkflowError::UnknownEndpoint(name.to_owned()))
	}

	/// The primary worklist filter. A requested modality replaces the one of the template.
	fn primary_filter(&self, modality: Option<&str>) -> Result<DatasetTemplate, WorkflowError> {
		let Some(path) = self.config.templates.worklist_modality.as_deref() else {
			let modality = modality.or(self.config.worklist.modality.as_deref());
			return Ok(DatasetTemplate::worklist_filter(modality));
		};
		let template = DatasetTemplate::load(path)?;
		let Some(modality) = modality else {
			return Ok(template);
		};
		let mut filter = template.prototype().clone();
		update_item(&mut filter, tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE, 0, |step| {
			put_str(step, tags::MODALITY, VR::CS, modality);
			Ok(())
		})?;
		Ok(DatasetTemplate::new(filter))
	}

	async fn try_query_worklist(&self, name: &str, body: &str) -> Result<String, WorkflowError> {
		let query: WorklistQuery = parse(body)?;
		let endpoint = self.endpoint(name)?;
		let primary = self.primary_filter(query.modality.as_deref())?;
		let secondary = load_template(self.config.templates.worklist.as_deref(), || {
			DatasetTemplate::worklist_filter(None)
		})?;
		let items = self
			.worklists
			.fetch_worklist(endpoint, &primary, &secondary)
			.await?;
		Ok(serde_json::to_string(&items)?)
	}

	/// Queries the worklist; `result` is the JSON list of worklist items.
	#[instrument(skip_all, fields(worklist = name))]
	pub async fn query_worklist(&self, name: &str, body: &str) -> WorkflowResponse {
		respond(self.try_query_worklist(name, body).await, |items| {
			WorkflowResponse::success("Worklist query completed successfully.", items)
		})
	}

	async fn try_begin(&self, name: &str, body: &str) -> Result<UI, WorkflowError> {
		let step: ProcedureStep = parse(body)?;
		let endpoint = self.endpoint(name)?;
		let template = load_template(
			self.config.templates.in_progress.as_deref(),
			DatasetTemplate::in_progress,
		)?;
		self.lifecycle.begin(endpoint, &step, &template).await
	}

	/// Creates the procedure step; `result` is its MPPS instance UID.
	#[instrument(skip_all, fields(worklist = name))]
	pub async fn begin(&self, name: &str, body: &str) -> WorkflowResponse {
		respond(self.try_begin(name, body).await, |uid| {
			WorkflowResponse::success("MPPS started successfully.", uid)
		})
	}

	async fn try_complete(&self, name: &str, body: &str) -> Result<String, WorkflowError> {
		let step: ProcedureStep = parse(body)?;
		let endpoint = self.endpoint(name)?;
		let template = load_template(
			self.config.templates.completed.as_deref(),
			DatasetTemplate::completed,
		)?;
		let acquired_path = PathBuf::from(step.dcm_file.as_deref().unwrap_or_default());
		let groups = self
			.lifecycle
			.complete(endpoint, &step, &acquired_path, &template)
			.await?;
		Ok(serialize_groups(&groups)?)
	}

	/// Completes the procedure step with the instances acquired below its `DcmFile`;
	/// `result` is the embedded JSON of the aggregated series.
	#[instrument(skip_all, fields(worklist = name))]
	pub async fn complete(&self, name: &str, body: &str) -> WorkflowResponse {
		respond(self.try_complete(name, body).await, |groups| {
			WorkflowResponse::success("MPPS completed successfully.", groups)
		})
	}

	async fn try_discontinue(&self, name: &str, body: &str) -> Result<UI, WorkflowError> {
		let request: DiscontinueRequest = parse(body)?;
		let endpoint = self.endpoint(name)?;
		let template = load_template(
			self.config.templates.discontinued.as_deref(),
			DatasetTemplate::discontinued,
		)?;
		self.lifecycle
			.discontinue(
				endpoint,
				request.mpps_instance_uid.as_deref(),
				request.current_state,
				&template,
			)
			.await
	}

	/// Discontinues the procedure step; `result` is its MPPS instance UID.
	#[instrument(skip_all, fields(worklist = name))]
	pub async fn discontinue(&self, name: &str, body: &str) -> WorkflowResponse {
		respond(self.try_discontinue(name, body).await, |uid| {
			WorkflowResponse::success("MPPS discontinued successfully.", uid)
		})
	}

	async fn try_store_series(&self, name: &str, body: &str) -> Result<UI, WorkflowError> {
		let step: ProcedureStep = parse(body)?;
		let peer = self.storage_peer(name)?;
		self.transfer
			.send(&peer, &step, step.series_groups())
			.await?;
		Ok(step.mpps_instance_uid.unwrap_or_default())
	}

	/// Stores the series of a completed step; `result` is its MPPS instance UID.
	#[instrument(skip_all, fields(peer = name))]
	pub async fn store_series(&self, name: &str, body: &str) -> WorkflowResponse {
		respond(self.try_store_series(name, body).await, |uid| {
			WorkflowResponse::success("C-STORE requests completed successfully.", uid)
		})
	}

	async fn try_store_structured(&self, name: &str, body: &str) -> Result<UI, WorkflowError> {
		let step: ProcedureStep = parse(body)?;
		let peer = self.storage_peer(name)?;
		let file = step
			.dcm_file
			.as_deref()
			.filter(|file| !file.is_empty())
			.ok_or_else(|| {
				WorkflowError::Unsupported(String::from("DcmFile names no structured object"))
			})?;
		self.transfer
			.send_structured(
				&peer,
				&step,
				Path::new(file),
				&self.config.structured.placeholder_uids,
			)
			.await
	}

	/// Relinks the structured object named by the step's `DcmFile` to the step's series and
	/// stores it; `result` is its new SOP Instance UID.
	#[instrument(skip_all, fields(peer = name))]
	pub async fn store_structured(&self, name: &str, body: &str) -> WorkflowResponse {
		respond(self.try_store_structured(name, body).await, |uid| {
			WorkflowResponse::success("Structured object stored successfully.", uid)
		})
	}

	async fn try_store_path(&self, name: &str, body: &str) -> Result<UI, WorkflowError> {
		let request: HeadlessStoreRequest = parse(body)?;
		let peer = self.storage_peer(name)?;
		self.transfer.send_by_path(&peer, &request).await
	}

	/// Stores files without a procedure step; `result` is the last Series Instance UID used.
	#[instrument(skip_all, fields(peer = name))]
	pub async fn store_path(&self, name: &str, body: &str) -> WorkflowResponse {
		respond(self.try_store_path(name, body).await, |series| {
			WorkflowResponse::success("C-STORE requests completed successfully.", series)
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::mock::{MockNetwork, Primitive};
	use crate::config::tests::config;
	use crate::workflow::dataset::{first_item, put_items, read_str};
	use crate::workflow::model::{SeriesGroup, StepStatus, WorklistItem};
	use crate::workflow::template::tests::{step, write_instance};
	use dicom::object::InMemDicomObject;

	fn service(network: &MockNetwork) -> WorkflowService {
		WorkflowService::new(Arc::new(network.clone()), config())
	}

	fn step_body(step: &ProcedureStep) -> String {
		serde_json::to_string(step).unwrap()
	}

	#[test]
	fn endpoint_names_are_listed() {
		let service = service(&MockNetwork::new());
		assert_eq!(service.worklist_names(), ["RIS"]);
		assert_eq!(service.peer_names(), ["PACS"]);
	}

	#[tokio::test]
	async fn unknown_endpoint_is_reported() {
		let network = MockNetwork::new();
		let response = service(&network).begin("Nowhere", &step_body(&step())).await;
		assert!(!response.success);
		assert_eq!(response.message, "No endpoint named 'Nowhere' is configured");
		assert_eq!(response.result, "");
		assert!(network.opened().is_empty());
	}

	#[tokio::test]
	async fn malformed_body_is_reported() {
		let network = MockNetwork::new();
		let response = service(&network).begin("RIS", "{not json").await;
		assert!(!response.success);
		assert!(response.message.starts_with("Malformed payload"));
	}

	#[tokio::test]
	async fn worklist_query_returns_json_items() {
		let network = MockNetwork::new();
		let mut identifier = InMemDicomObject::new_empty();
		put_str(&mut identifier, tags::ACCESSION_NUMBER, VR::SH, "ACC9");
		put_items(&mut identifier, tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE, Vec::new());
		network.push_find_result(vec![identifier]);

		let response = service(&network).query_worklist("RIS", "").await;

		assert!(response.success, "{}", response.message);
		let items: Vec<WorklistItem> = serde_json::from_str(&response.result).unwrap();
		assert_eq!(items.len(), 1);
		assert_eq!(items[0].accession_number, "ACC9");

		let modalities: Vec<String> = network
			.primitives()
			.into_iter()
			.filter_map(|primitive| match primitive {
				Primitive::Find { identifier, .. } => {
					first_item(&identifier, tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE)
						.map(|step| read_str(step, tags::MODALITY))
				}
				_ => None,
			})
			.collect();
		assert_eq!(modalities, ["MR", ""]);
	}

	#[tokio::test]
	async fn requested_modality_overrides_configuration() {
		let network = MockNetwork::new();
		let response = service(&network)
			.query_worklist("RIS", r#"{"modality":"CT"}"#)
			.await;
		assert!(response.success);
		assert_eq!(response.result, "[]");
		match network.primitives().first() {
			Some(Primitive::Find { identifier, .. }) => {
				let step = first_item(identifier, tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE).unwrap();
				assert_eq!(read_str(step, tags::MODALITY), "CT");
			}
			other => panic!("unexpected primitive: {other:?}"),
		}
	}

	#[tokio::test]
	async fn begin_reports_instance_uid() {
		let network = MockNetwork::new();
		let response = service(&network).begin("RIS", &step_body(&step())).await;
		assert!(response.success);
		assert!(response.result.starts_with("2.25."));
		assert_eq!(network.opened()[0].0.called_aet, "MPPS");
	}

	#[tokio::test]
	async fn complete_without_acquisition_reports_no_instances() {
		let network = MockNetwork::new();
		let mut step = step();
		step.status = Some(StepStatus::InProgress);
		step.mpps_instance_uid = Some(UI::from("1.2.826.0.1.7"));

		let response = service(&network).complete("RIS", &step_body(&step)).await;

		assert!(!response.success);
		assert_eq!(response.message, "No SOP Instance UIDs found.");
		assert!(network.opened().is_empty());
	}

	#[tokio::test]
	async fn completed_series_feed_the_store() {
		let network = MockNetwork::new();
		let dir = tempfile::tempdir().unwrap();
		write_instance(&dir.path().join("1.dcm"), "");
		let mut step = step();
		step.status = Some(StepStatus::InProgress);
		step.mpps_instance_uid = Some(UI::from("1.2.826.0.1.7"));
		step.dcm_file = Some(dir.path().display().to_string());
		let service = service(&network);

		let completed = service.complete("RIS", &step_body(&step)).await;
		assert!(completed.success, "{}", completed.message);
		let groups: Vec<SeriesGroup> = serde_json::from_str(&completed.result).unwrap();
		assert_eq!(groups.len(), 1);

		step.status = Some(StepStatus::Completed);
		step.sop_instance_uids = Some(groups);
		let stored = service.store_series("PACS", &step_body(&step)).await;
		assert!(stored.success, "{}", stored.message);
		assert_eq!(stored.result, "1.2.826.0.1.7");
		assert_eq!(network.stored().len(), 1);
		assert_eq!(network.opened()[1].0.called_aet, "ARCHIVE");
		assert!(network.opened()[1].0.tls);
	}

	#[tokio::test]
	async fn failed_discontinue_has_empty_result() {
		let network = MockNetwork::new();
		network.answer_normalized(0x0110);
		let response = service(&network)
			.discontinue("RIS", r#"{"mpps_instance_uid":"1.2.3","currentState":"IN_PROGRESS"}"#)
			.await;
		assert!(!response.success);
		assert_eq!(response.result, "");
		assert_eq!(network.released(), 1);
	}

	#[tokio::test]
	async fn structured_store_requires_a_file() {
		let network = MockNetwork::new();
		let response = service(&network).store_structured("PACS", &step_body(&step())).await;
		assert!(!response.success);
		assert!(network.opened().is_empty());
	}

	#[tokio::test]
	async fn headless_store_of_missing_path_fails() {
		let network = MockNetwork::new();
		let response = service(&network)
			.store_path("PACS", r#"{"path":"/nonexistent/files","generate":true}"#)
			.await;
		assert!(!response.success);
		assert_eq!(response.message, "Path does not exist: /nonexistent/files");
	}
}
