//! Modality Performed Procedure Step lifecycle.
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part04/chapter_F.html>
//!
//! A step is created IN PROGRESS with N-CREATE and ends either COMPLETED or DISCONTINUED with
//! N-SET. Terminal steps accept no further transitions.

use crate::backend::{NetworkService, PresentationParameter, STATUS_SUCCESS};
use crate::types::{generate_uid, UI};
use crate::workflow::aggregate;
use crate::workflow::model::{ProcedureStep, SeriesGroup, StepStatus, WorklistEndpoint};
use crate::workflow::template::{
	bind_completed, bind_discontinued, bind_in_progress, DatasetTemplate,
};
use crate::workflow::WorkflowError;
use dicom::dictionary_std::uids;
use dicom::object::InMemDicomObject;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Checks that a step in state `from` (`None` for a step never reported) may enter `to`.
pub fn check_transition(from: Option<StepStatus>, to: StepStatus) -> Result<(), WorkflowError> {
	match (from, to) {
		(None, _) | (Some(StepStatus::InProgress), StepStatus::Completed | StepStatus::Discontinued) => {
			Ok(())
		}
		(Some(from), to) => Err(WorkflowError::InvalidTransition { from, to }),
	}
}

#[derive(Debug, Clone, Copy)]
enum Normalized {
	Create,
	Set,
}

pub struct ProcedureStepLifecycle {
	network: Arc<dyn NetworkService>,
}

impl ProcedureStepLifecycle {
	pub fn new(network: Arc<dyn NetworkService>) -> Self {
		Self { network }
	}

	fn presentation() -> PresentationParameter {
		PresentationParameter {
			abstract_syntax_uid: UI::from(uids::MODALITY_PERFORMED_PROCEDURE_STEP),
			transfer_syntax_uids: vec![
				UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
				UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
			],
		}
	}

	/// Issues one N-CREATE or N-SET over a dedicated association.
	async fn send(
		&self,
		endpoint: &WorklistEndpoint,
		primitive: Normalized,
		sop_instance_uid: &str,
		data_set: InMemDicomObject,
	) -> Result<(), WorkflowError> {
		let mut session = self
			.network
			.associate(&endpoint.mpps_peer(), Self::presentation())
			.await?;
		let result = match primitive {
			Normalized::Create => {
				session
					.create(uids::MODALITY_PERFORMED_PROCEDURE_STEP, sop_instance_uid, data_set)
					.await
			}
			Normalized::Set => {
				session
					.set(uids::MODALITY_PERFORMED_PROCEDURE_STEP, sop_instance_uid, data_set)
					.await
			}
		};
		session.release().await;

		let status = result?;
		if status == STATUS_SUCCESS {
			Ok(())
		} else {
			warn!(status, "MPPS peer rejected {primitive:?}");
			Err(WorkflowError::PeerRejected(status))
		}
	}

	/// Creates the step IN PROGRESS and returns its instance UID. A UID already carried by the
	/// step is reused.
	#[instrument(skip_all, fields(endpoint = %endpoint.name))]
	pub async fn begin(
		&self,
		endpoint: &WorklistEndpoint,
		step: &ProcedureStep,
		template: &DatasetTemplate,
	) -> Result<UI, WorkflowError> {
		check_transition(step.status, StepStatus::InProgress)?;
		let data_set = bind_in_progress(template, step, endpoint)?;
		let sop_instance_uid = step
			.mpps_instance_uid
			.clone()
			.filter(|uid| !uid.is_empty())
			.unwrap_or_else(generate_uid);

		self.send(endpoint, Normalized::Create, &sop_instance_uid, data_set)
			.await?;
		info!(sop_instance_uid, "Created procedure step");
		Ok(sop_instance_uid)
	}

	/// Completes the step with the series found below `acquired_path` and returns them.
	#[instrument(skip_all, fields(endpoint = %endpoint.name, path = %acquired_path.display()))]
	pub async fn complete(
		&self,
		endpoint: &WorklistEndpoint,
		step: &ProcedureStep,
		acquired_path: &Path,
		template: &DatasetTemplate,
	) -> Result<Vec<SeriesGroup>, WorkflowError> {
		check_transition(step.status, StepStatus::Completed)?;
		let groups = aggregate::scan(acquired_path)?;
		if groups.is_empty() {
			return Err(WorkflowError::NoInstancesFound);
		}
		let sop_instance_uid = step
			.mpps_instance_uid
			.as_deref()
			.filter(|uid| !uid.is_empty())
			.ok_or(WorkflowError::MissingStepInstance)?;

		let data_set = bind_completed(template, step, &groups)?;
		self.send(endpoint, Normalized::Set, sop_instance_uid, data_set)
			.await?;
		info!(sop_instance_uid, series = groups.len(), "Completed procedure step");
		Ok(groups)
	}

	/// Discontinues the step and returns its instance UID. Without a known UID a new one is
	/// generated.
	#[instrument(skip_all, fields(endpoint = %endpoint.name))]
	pub async fn discontinue(
		&self,
		endpoint: &WorklistEndpoint,
		step_instance_uid: Option<&str>,
		current: Option<StepStatus>,
		template: &DatasetTemplate,
	) -> Result<UI, WorkflowError> {
		check_transition(current, StepStatus::Discontinued)?;
		let sop_instance_uid = step_instance_uid
			.filter(|uid| !uid.is_empty())
			.map_or_else(generate_uid, UI::from);

		let data_set = bind_discontinued(template)?;
		self.send(endpoint, Normalized::Set, &sop_instance_uid, data_set)
			.await?;
		info!(sop_instance_uid, "Discontinued procedure step");
		Ok(sop_instance_uid)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::mock::{MockNetwork, Operation, Primitive};
	use crate::workflow::dataset::{items, read_str};
	use crate::workflow::template::tests::{endpoint, step, write_instance};
	use dicom::dictionary_std::tags;
	use std::fs;

	fn lifecycle(network: &MockNetwork) -> ProcedureStepLifecycle {
		ProcedureStepLifecycle::new(Arc::new(network.clone()))
	}

	#[test]
	fn terminal_states_refuse_transitions() {
		for from in [StepStatus::Completed, StepStatus::Discontinued] {
			for to in [StepStatus::InProgress, StepStatus::Completed, StepStatus::Discontinued] {
				assert!(matches!(
					check_transition(Some(from), to),
					Err(WorkflowError::InvalidTransition { .. })
				));
			}
		}
		assert!(check_transition(Some(StepStatus::InProgress), StepStatus::InProgress).is_err());
		assert!(check_transition(None, StepStatus::InProgress).is_ok());
		assert!(check_transition(Some(StepStatus::InProgress), StepStatus::Completed).is_ok());
		assert!(check_transition(Some(StepStatus::InProgress), StepStatus::Discontinued).is_ok());
	}

	#[tokio::test]
	async fn begin_creates_step_with_fresh_uid() {
		let network = MockNetwork::new();
		let uid = lifecycle(&network)
			.begin(&endpoint(), &step(), &DatasetTemplate::in_progress())
			.await
			.unwrap();

		assert!(uid.starts_with("2.25."));
		let opened = network.opened();
		assert_eq!(opened.len(), 1);
		assert_eq!(opened[0].0.called_aet, "MPPS");
		assert_eq!(opened[0].0.port, 105);
		assert_eq!(
			opened[0].1.abstract_syntax_uid,
			uids::MODALITY_PERFORMED_PROCEDURE_STEP
		);
		assert_eq!(network.released(), 1);

		match network.primitives().as_slice() {
			[Primitive::Create {
				sop_instance_uid,
				data_set,
				..
			}] => {
				assert_eq!(sop_instance_uid, &uid);
				assert_eq!(read_str(data_set, tags::PERFORMED_PROCEDURE_STEP_STATUS), "IN PROGRESS");
			}
			other => panic!("unexpected primitives: {other:?}"),
		}
	}

	#[tokio::test]
	async fn begin_reuses_supplied_uid() {
		let network = MockNetwork::new();
		let mut step = step();
		step.mpps_instance_uid = Some(UI::from("1.2.826.0.1.99"));
		let uid = lifecycle(&network)
			.begin(&endpoint(), &step, &DatasetTemplate::in_progress())
			.await
			.unwrap();
		assert_eq!(uid, "1.2.826.0.1.99");
	}

	#[tokio::test]
	async fn rejected_create_surfaces_status_and_releases() {
		let network = MockNetwork::new();
		network.answer_normalized(0x0110);
		let result = lifecycle(&network)
			.begin(&endpoint(), &step(), &DatasetTemplate::in_progress())
			.await;
		assert!(matches!(result, Err(WorkflowError::PeerRejected(0x0110))));
		assert_eq!(network.released(), 1);
	}

	#[tokio::test]
	async fn failed_create_releases_association() {
		let network = MockNetwork::new();
		network.fail_on(Operation::Create, 1);
		let result = lifecycle(&network)
			.begin(&endpoint(), &step(), &DatasetTemplate::in_progress())
			.await;
		assert!(matches!(result, Err(WorkflowError::Service(_))));
		assert_eq!(network.opened().len(), 1);
		assert_eq!(network.released(), 1);
	}

	#[tokio::test]
	async fn failed_set_releases_association() {
		let network = MockNetwork::new();
		network.fail_on(Operation::Set, 1);
		let result = lifecycle(&network)
			.discontinue(
				&endpoint(),
				Some("1.2.3"),
				Some(StepStatus::InProgress),
				&DatasetTemplate::discontinued(),
			)
			.await;
		assert!(matches!(result, Err(WorkflowError::Service(_))));
		assert_eq!(network.released(), network.opened().len());
	}

	#[tokio::test]
	async fn unreachable_peer_is_an_association_error() {
		let network = MockNetwork::new();
		network.refuse_associations();
		let result = lifecycle(&network)
			.begin(&endpoint(), &step(), &DatasetTemplate::in_progress())
			.await;
		assert!(matches!(result, Err(WorkflowError::Association(_))));
	}

	#[tokio::test]
	async fn complete_without_instances_does_not_contact_peer() {
		let network = MockNetwork::new();
		let dir = tempfile::tempdir().unwrap();
		let mut step = step();
		step.mpps_instance_uid = Some(generate_uid());

		let result = lifecycle(&network)
			.complete(&endpoint(), &step, dir.path(), &DatasetTemplate::completed())
			.await;
		assert!(matches!(result, Err(WorkflowError::NoInstancesFound)));
		assert!(network.opened().is_empty());
	}

	#[tokio::test]
	async fn complete_requires_step_instance() {
		let network = MockNetwork::new();
		let dir = tempfile::tempdir().unwrap();
		write_instance(&dir.path().join("1.dcm"), "");

		let result = lifecycle(&network)
			.complete(&endpoint(), &step(), dir.path(), &DatasetTemplate::completed())
			.await;
		assert!(matches!(result, Err(WorkflowError::MissingStepInstance)));
		assert!(network.opened().is_empty());
	}

	#[tokio::test]
	async fn complete_sets_performed_series() {
		let network = MockNetwork::new();
		let dir = tempfile::tempdir().unwrap();
		for series in ["a", "b"] {
			fs::create_dir(dir.path().join(series)).unwrap();
			write_instance(&dir.path().join(series).join("1.dcm"), "");
			write_instance(&dir.path().join(series).join("2.dcm"), "");
		}
		let mut step = step();
		step.status = Some(StepStatus::InProgress);
		step.mpps_instance_uid = Some(UI::from("1.2.826.0.1.7"));

		let groups = lifecycle(&network)
			.complete(&endpoint(), &step, dir.path(), &DatasetTemplate::completed())
			.await
			.unwrap();

		assert_eq!(groups.len(), 2);
		assert_eq!(network.released(), 1);
		match network.primitives().as_slice() {
			[Primitive::Set {
				sop_instance_uid,
				data_set,
				..
			}] => {
				assert_eq!(sop_instance_uid, "1.2.826.0.1.7");
				let series = items(data_set, tags::PERFORMED_SERIES_SEQUENCE);
				assert_eq!(series.len(), 2);
				assert_eq!(
					read_str(&series[1], tags::SERIES_INSTANCE_UID),
					groups[1].series_instance_uid
				);
			}
			other => panic!("unexpected primitives: {other:?}"),
		}
	}

	#[tokio::test]
	async fn complete_rejected_with_warning_status() {
		let network = MockNetwork::new();
		network.answer_normalized(0x0001);
		let dir = tempfile::tempdir().unwrap();
		write_instance(&dir.path().join("1.dcm"), "");
		let mut step = step();
		step.mpps_instance_uid = Some(generate_uid());

		let result = lifecycle(&network)
			.complete(&endpoint(), &step, dir.path(), &DatasetTemplate::completed())
			.await;
		assert!(matches!(result, Err(WorkflowError::PeerRejected(0x0001))));
		assert_eq!(network.released(), 1);
	}

	#[tokio::test]
	async fn completed_step_cannot_be_discontinued() {
		let network = MockNetwork::new();
		let result = lifecycle(&network)
			.discontinue(
				&endpoint(),
				Some("1.2.3"),
				Some(StepStatus::Completed),
				&DatasetTemplate::discontinued(),
			)
			.await;
		assert!(matches!(result, Err(WorkflowError::InvalidTransition { .. })));
		assert!(network.opened().is_empty());
	}

	#[tokio::test]
	async fn discontinue_without_uid_generates_one() {
		let network = MockNetwork::new();
		let uid = lifecycle(&network)
			.discontinue(
				&endpoint(),
				None,
				Some(StepStatus::InProgress),
				&DatasetTemplate::discontinued(),
			)
			.await
			.unwrap();
		assert!(uid.starts_with("2.25."));
		match network.primitives().as_slice() {
			[Primitive::Set { sop_instance_uid, data_set, .. }] => {
				assert_eq!(sop_instance_uid, &uid);
				assert_eq!(read_str(data_set, tags::PERFORMED_PROCEDURE_STEP_STATUS), "DISCONTINUED");
			}
			other => panic!("unexpected primitives: {other:?}"),
		}
		assert_eq!(network.released(), 1);
	}
}
