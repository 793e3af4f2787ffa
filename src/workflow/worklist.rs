//! Modality Worklist queries.
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part04/chapter_K.html>

use crate::backend::{FindMatch, NetworkService, PresentationParameter};
use crate::types::UI;
use crate::workflow::dataset::{first_item, read_person_name, read_str};
use crate::workflow::model::{WorklistEndpoint, WorklistItem};
use crate::workflow::template::DatasetTemplate;
use crate::workflow::WorkflowError;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

impl WorklistItem {
	/// Flattens a worklist match. Absent attributes read as empty strings.
	pub fn from_identifier(identifier: &InMemDicomObject) -> Self {
		let step = first_item(identifier, tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE);
		let from_step = |read: fn(&InMemDicomObject, dicom::core::Tag) -> String, tag| {
			step.map(|step| read(step, tag)).unwrap_or_default()
		};

		Self {
			accession_number: read_str(identifier, tags::ACCESSION_NUMBER),
			requested_procedure_description: read_str(
				identifier,
				tags::REQUESTED_PROCEDURE_DESCRIPTION,
			),
			patient_name: read_person_name(identifier, tags::PATIENT_NAME),
			patient_id: read_str(identifier, tags::PATIENT_ID),
			patient_birth_date: read_str(identifier, tags::PATIENT_BIRTH_DATE),
			patient_sex: read_str(identifier, tags::PATIENT_SEX),
			modality: from_step(read_str, tags::MODALITY),
			scheduled_station_ae_title: from_step(read_str, tags::SCHEDULED_STATION_AE_TITLE),
			scheduled_procedure_step_start_date: from_step(
				read_str,
				tags::SCHEDULED_PROCEDURE_STEP_START_DATE,
			),
			scheduled_performing_physician_name: from_step(
				read_person_name,
				tags::SCHEDULED_PERFORMING_PHYSICIAN_NAME,
			),
			study_instance_uid: read_str(identifier, tags::STUDY_INSTANCE_UID),
		}
	}
}

/// Appends the secondary results whose accession number is not among the primary results.
pub fn merge_worklists(primary: Vec<WorklistItem>, secondary: Vec<WorklistItem>) -> Vec<WorklistItem> {
	let known: HashSet<String> = primary
		.iter()
		.map(|item| item.accession_number.clone())
		.collect();
	let mut merged = primary;
	merged.extend(
		secondary
			.into_iter()
			.filter(|item| !known.contains(&item.accession_number)),
	);
	merged
}

pub struct WorklistQueryEngine {
	network: Arc<dyn NetworkService>,
}

impl WorklistQueryEngine {
	pub fn new(network: Arc<dyn NetworkService>) -> Self {
		Self { network }
	}

	/// Runs the primary and then the secondary filter over one association.
	///
	/// An unreachable or rejecting peer is logged and yields an empty worklist.
	#[instrument(skip_all, fields(endpoint = %endpoint.name))]
	pub async fn fetch_worklist(
		&self,
		endpoint: &WorklistEndpoint,
		primary_filter: &DatasetTemplate,
		secondary_filter: &DatasetTemplate,
	) -> Result<Vec<WorklistItem>, WorkflowError> {
		let presentation = PresentationParameter {
			abstract_syntax_uid: UI::from(uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND),
			transfer_syntax_uids: vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		};
		let mut session = match self
			.network
			.associate(&endpoint.query_peer(), presentation)
			.await
		{
			Ok(session) => session,
			Err(err) => {
				warn!("Worklist peer is unavailable: {err}");
				return Ok(Vec::new());
			}
		};

		let primary = session
			.find(
				uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
				primary_filter.prototype().clone(),
			)
			.await;
		let secondary = match primary {
			Ok(_) => {
				session
					.find(
						uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
						secondary_filter.prototype().clone(),
					)
					.await
			}
			Err(_) => Ok(Vec::new()),
		};
		session.release().await;

		let to_items = |matches: Vec<FindMatch>| {
			matches
				.iter()
				.filter_map(|m| {
					if m.is_pending() {
						Some(WorklistItem::from_identifier(&m.identifier))
					} else {
						warn!(status = m.status, "Ignoring identifier of a final C-FIND response");
						None
					}
				})
				.collect::<Vec<_>>()
		};
		let primary = to_items(primary?);
		let secondary = to_items(secondary?);
		debug!(
			primary = primary.len(),
			secondary = secondary.len(),
			"Received worklist matches"
		);

		Ok(merge_worklists(primary, secondary))
	}
}
