//! Prototype datasets and the functions binding workflow fields onto them.
//!
//! A [`DatasetTemplate`] is never modified. Every bind starts from a copy of the prototype and
//! returns a new dataset, so concurrent workflows may share one template.

use crate::types::generate_uid;
use crate::workflow::dataset::{
	first_item, put_empty, put_items, put_str, read_str, update_item, Timestamp,
};
use crate::workflow::model::{ProcedureStep, SeriesGroup, StepStatus, WorklistEndpoint};
use crate::workflow::WorkflowError;
use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::{open_file, InMemDicomObject};
use std::path::Path;
use tracing::{debug, instrument};

/// Operator name written by a simulator vendor. Series carrying it take their description from
/// the first acquired file instead.
pub const SIMULATOR_OPERATOR: &str = "iRT DICOM Device Simulator";

const CHARACTER_SET: &str = "ISO_IR 100";
const STEP_DESCRIPTION: &str = "description";
const STEP_TYPE_DESCRIPTION: &str = "type";
const STUDY_SOP_CLASS: &str = "1.2.840.10008.3.1.2.3.1";

/// An immutable prototype dataset.
#[derive(Debug, Clone)]
pub struct DatasetTemplate {
	prototype: InMemDicomObject,
}

impl DatasetTemplate {
	pub const fn new(prototype: InMemDicomObject) -> Self {
		Self { prototype }
	}

	/// Loads a template from a DICOM file. Only the data set is kept.
	pub fn load(path: &Path) -> Result<Self, WorkflowError> {
		let file = open_file(path).map_err(|source| WorkflowError::MissingFile {
			path: path.to_path_buf(),
			source,
		})?;
		debug!(path = %path.display(), "Loaded dataset template");
		Ok(Self::new(file.into_inner()))
	}

	pub const fn prototype(&self) -> &InMemDicomObject {
		&self.prototype
	}

	fn instantiate(&self) -> InMemDicomObject {
		self.prototype.clone()
	}

	/// Modality Worklist C-FIND identifier. `modality` restricts the scheduled procedure steps,
	/// `None` leaves the key universal.
	#[rustfmt::skip]
	pub fn worklist_filter(modality: Option<&str>) -> Self {
		let mut step = InMemDicomObject::new_empty();
		put_str(&mut step, tags::MODALITY, VR::CS, modality.unwrap_or_default());
		put_empty(&mut step, tags::SCHEDULED_STATION_AE_TITLE, VR::AE);
		put_empty(&mut step, tags::SCHEDULED_PROCEDURE_STEP_START_DATE, VR::DA);
		put_empty(&mut step, tags::SCHEDULED_PROCEDURE_STEP_START_TIME, VR::TM);
		put_empty(&mut step, tags::SCHEDULED_PERFORMING_PHYSICIAN_NAME, VR::PN);
		put_empty(&mut step, tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION, VR::LO);
		put_empty(&mut step, tags::SCHEDULED_PROCEDURE_STEP_ID, VR::SH);

		let mut filter = InMemDicomObject::new_empty();
		put_str(&mut filter, tags::SPECIFIC_CHARACTER_SET, VR::CS, CHARACTER_SET);
		put_empty(&mut filter, tags::ACCESSION_NUMBER, VR::SH);
		put_empty(&mut filter, tags::REQUESTED_PROCEDURE_DESCRIPTION, VR::LO);
		put_empty(&mut filter, tags::REQUESTED_PROCEDURE_ID, VR::SH);
		put_empty(&mut filter, tags::PATIENT_NAME, VR::PN);
		put_empty(&mut filter, tags::PATIENT_ID, VR::LO);
		put_empty(&mut filter, tags::PATIENT_BIRTH_DATE, VR::DA);
		put_empty(&mut filter, tags::PATIENT_SEX, VR::CS);
		put_empty(&mut filter, tags::STUDY_INSTANCE_UID, VR::UI);
		put_items(&mut filter, tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE, vec![step]);
		Self::new(filter)
	}

	/// N-CREATE attribute list of a procedure step entering IN PROGRESS.
	#[rustfmt::skip]
	pub fn in_progress() -> Self {
		let mut referenced_study = InMemDicomObject::new_empty();
		put_str(&mut referenced_study, tags::REFERENCED_SOP_CLASS_UID, VR::UI, STUDY_SOP_CLASS);
		put_empty(&mut referenced_study, tags::REFERENCED_SOP_INSTANCE_UID, VR::UI);

		let mut scheduled = InMemDicomObject::new_empty();
		put_empty(&mut scheduled, tags::STUDY_INSTANCE_UID, VR::UI);
		put_items(&mut scheduled, tags::REFERENCED_STUDY_SEQUENCE, vec![referenced_study]);
		put_empty(&mut scheduled, tags::ACCESSION_NUMBER, VR::SH);
		put_empty(&mut scheduled, tags::REQUESTED_PROCEDURE_ID, VR::SH);
		put_empty(&mut scheduled, tags::REQUESTED_PROCEDURE_DESCRIPTION, VR::LO);
		put_empty(&mut scheduled, tags::SCHEDULED_PROCEDURE_STEP_ID, VR::SH);
		put_empty(&mut scheduled, tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION, VR::LO);
		put_items(&mut scheduled, tags::SCHEDULED_PROTOCOL_CODE_SEQUENCE, Vec::new());

		let mut prototype = InMemDicomObject::new_empty();
		put_str(&mut prototype, tags::SPECIFIC_CHARACTER_SET, VR::CS, CHARACTER_SET);
		put_items(&mut prototype, tags::SCHEDULED_STEP_ATTRIBUTES_SEQUENCE, vec![scheduled]);
		put_empty(&mut prototype, tags::PATIENT_NAME, VR::PN);
		put_empty(&mut prototype, tags::PATIENT_ID, VR::LO);
		put_empty(&mut prototype, tags::PATIENT_BIRTH_DATE, VR::DA);
		put_empty(&mut prototype, tags::PATIENT_SEX, VR::CS);
		put_items(&mut prototype, tags::REFERENCED_PATIENT_SEQUENCE, Vec::new());
		put_empty(&mut prototype, tags::PERFORMED_PROCEDURE_STEP_ID, VR::SH);
		put_empty(&mut prototype, tags::PERFORMED_STATION_AE_TITLE, VR::AE);
		put_empty(&mut prototype, tags::PERFORMED_STATION_NAME, VR::SH);
		put_empty(&mut prototype, tags::PERFORMED_LOCATION, VR::SH);
		put_empty(&mut prototype, tags::PERFORMED_PROCEDURE_STEP_START_DATE, VR::DA);
		put_empty(&mut prototype, tags::PERFORMED_PROCEDURE_STEP_START_TIME, VR::TM);
		put_empty(&mut prototype, tags::PERFORMED_PROCEDURE_STEP_STATUS, VR::CS);
		put_empty(&mut prototype, tags::MODALITY, VR::CS);
		put_empty(&mut prototype, tags::STUDY_ID, VR::SH);
		Self::new(prototype)
	}

	/// N-SET attribute list of a completed procedure step, holding one series and one image
	/// reference that serve as the shape of every bound series and image.
	pub fn completed() -> Self {
		let mut prototype = Self::terminal_prototype();
		put_str(
			&mut prototype,
			tags::PERFORMED_PROCEDURE_STEP_STATUS,
			VR::CS,
			StepStatus::Completed.as_str(),
		);
		Self::new(prototype)
	}

	/// N-SET attribute list of a discontinued procedure step.
	pub fn discontinued() -> Self {
		let mut prototype = Self::terminal_prototype();
		put_str(
			&mut prototype,
			tags::PERFORMED_PROCEDURE_STEP_STATUS,
			VR::CS,
			StepStatus::Discontinued.as_str(),
		);
		put_items(
			&mut prototype,
			tags::PERFORMED_PROCEDURE_STEP_DISCONTINUATION_REASON_CODE_SEQUENCE,
			Vec::new(),
		);
		Self::new(prototype)
	}

	#[rustfmt::skip]
	fn terminal_prototype() -> InMemDicomObject {
		let mut image = InMemDicomObject::new_empty();
		put_empty(&mut image, tags::REFERENCED_SOP_CLASS_UID, VR::UI);
		put_empty(&mut image, tags::REFERENCED_SOP_INSTANCE_UID, VR::UI);

		let mut series = InMemDicomObject::new_empty();
		put_empty(&mut series, tags::PERFORMING_PHYSICIAN_NAME, VR::PN);
		put_empty(&mut series, tags::PROTOCOL_NAME, VR::LO);
		put_empty(&mut series, tags::OPERATORS_NAME, VR::PN);
		put_empty(&mut series, tags::SERIES_INSTANCE_UID, VR::UI);
		put_empty(&mut series, tags::SERIES_DESCRIPTION, VR::LO);
		put_empty(&mut series, tags::RETRIEVE_AE_TITLE, VR::AE);
		put_items(&mut series, tags::REFERENCED_IMAGE_SEQUENCE, vec![image]);
		put_items(&mut series, tags::REFERENCED_NON_IMAGE_COMPOSITE_SOP_INSTANCE_SEQUENCE, Vec::new());

		let mut prototype = InMemDicomObject::new_empty();
		put_empty(&mut prototype, tags::PERFORMED_PROCEDURE_STEP_END_DATE, VR::DA);
		put_empty(&mut prototype, tags::PERFORMED_PROCEDURE_STEP_END_TIME, VR::TM);
		put_empty(&mut prototype, tags::PERFORMED_PROCEDURE_STEP_STATUS, VR::CS);
		put_items(&mut prototype, tags::PERFORMED_SERIES_SEQUENCE, vec![series]);
		prototype
	}
}

/// Binds a worklist-derived step onto the IN PROGRESS template.
#[rustfmt::skip]
#[instrument(skip_all, fields(accession_number = %step.item.accession_number))]
pub fn bind_in_progress(
	template: &DatasetTemplate,
	step: &ProcedureStep,
	endpoint: &WorklistEndpoint,
) -> Result<InMemDicomObject, WorkflowError> {
	let item = &step.item;
	let now = Timestamp::now();
	let mut ds = template.instantiate();

	update_item(&mut ds, tags::SCHEDULED_STEP_ATTRIBUTES_SEQUENCE, 0, |scheduled| {
		put_str(scheduled, tags::STUDY_INSTANCE_UID, VR::UI, &item.study_instance_uid);
		if first_item(scheduled, tags::REFERENCED_STUDY_SEQUENCE).is_some() {
			update_item(scheduled, tags::REFERENCED_STUDY_SEQUENCE, 0, |study| {
				put_str(study, tags::SPECIFIC_CHARACTER_SET, VR::CS, CHARACTER_SET);
				Ok(())
			})?;
		}
		put_str(scheduled, tags::ACCESSION_NUMBER, VR::SH, &item.accession_number);
		put_str(scheduled, tags::REQUESTED_PROCEDURE_ID, VR::SH, &item.requested_procedure_description);
		put_str(scheduled, tags::REQUESTED_PROCEDURE_DESCRIPTION, VR::LO, &item.requested_procedure_description);
		put_str(scheduled, tags::SCHEDULED_PROCEDURE_STEP_ID, VR::SH, &item.requested_procedure_description);
		put_str(scheduled, tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION, VR::LO, &item.requested_procedure_description);
		put_items(scheduled, tags::SCHEDULED_PROTOCOL_CODE_SEQUENCE, Vec::new());
		Ok(())
	})?;

	put_str(&mut ds, tags::PATIENT_NAME, VR::PN, &item.patient_name);
	put_str(&mut ds, tags::PATIENT_ID, VR::LO, &item.patient_id);
	put_str(&mut ds, tags::PATIENT_BIRTH_DATE, VR::DA, &item.patient_birth_date);
	put_str(&mut ds, tags::PATIENT_SEX, VR::CS, &item.patient_sex);
	put_items(&mut ds, tags::REFERENCED_PATIENT_SEQUENCE, Vec::new());
	put_str(&mut ds, tags::PERFORMED_PROCEDURE_STEP_ID, VR::SH, &format!("PPS ID {}", item.accession_number));
	put_str(&mut ds, tags::PERFORMED_STATION_AE_TITLE, VR::AE, &endpoint.calling_aet);
	put_str(&mut ds, tags::PERFORMED_STATION_NAME, VR::SH, &endpoint.name);
	put_str(&mut ds, tags::PERFORMED_LOCATION, VR::SH, &endpoint.name);
	put_str(&mut ds, tags::PERFORMED_PROCEDURE_STEP_START_DATE, VR::DA, &item.scheduled_procedure_step_start_date);
	put_str(&mut ds, tags::PERFORMED_PROCEDURE_STEP_START_TIME, VR::TM, &now.time);
	put_str(&mut ds, tags::PERFORMED_PROCEDURE_STEP_STATUS, VR::CS, StepStatus::InProgress.as_str());
	put_str(&mut ds, tags::PERFORMED_PROCEDURE_STEP_DESCRIPTION, VR::LO, STEP_DESCRIPTION);
	put_str(&mut ds, tags::PERFORMED_PROCEDURE_TYPE_DESCRIPTION, VR::LO, STEP_TYPE_DESCRIPTION);
	put_items(&mut ds, tags::PROCEDURE_CODE_SEQUENCE, Vec::new());
	put_empty(&mut ds, tags::PERFORMED_PROCEDURE_STEP_END_DATE, VR::DA);
	put_empty(&mut ds, tags::PERFORMED_PROCEDURE_STEP_END_TIME, VR::TM);
	put_str(&mut ds, tags::MODALITY, VR::CS, &item.modality);
	put_str(&mut ds, tags::STUDY_ID, VR::SH, &item.accession_number);
	put_items(&mut ds, tags::PERFORMED_PROTOCOL_CODE_SEQUENCE, Vec::new());
	put_items(&mut ds, tags::PERFORMED_SERIES_SEQUENCE, Vec::new());
	put_items(&mut ds, tags::PERFORMED_PROCEDURE_STEP_DISCONTINUATION_REASON_CODE_SEQUENCE, Vec::new());

	Ok(ds)
}

/// Binds the acquired series onto the COMPLETED template.
#[instrument(skip_all, fields(series = groups.len()))]
pub fn bind_completed(
	template: &DatasetTemplate,
	step: &ProcedureStep,
	groups: &[SeriesGroup],
) -> Result<InMemDicomObject, WorkflowError> {
	let now = Timestamp::now();
	let mut ds = template.instantiate();

	put_str(&mut ds, tags::PERFORMED_PROCEDURE_STEP_END_DATE, VR::DA, &now.date);
	put_str(&mut ds, tags::PERFORMED_PROCEDURE_STEP_END_TIME, VR::TM, &now.short_time);
	put_str(
		&mut ds,
		tags::PERFORMED_PROCEDURE_STEP_STATUS,
		VR::CS,
		StepStatus::Completed.as_str(),
	);

	let series_template = first_item(&ds, tags::PERFORMED_SERIES_SEQUENCE)
		.cloned()
		.ok_or_else(|| {
			WorkflowError::Dataset(String::from("template has no PerformedSeriesSequence item"))
		})?;
	let image_template = first_item(&series_template, tags::REFERENCED_IMAGE_SEQUENCE)
		.cloned()
		.ok_or_else(|| {
			WorkflowError::Dataset(String::from("template has no ReferencedImageSequence item"))
		})?;

	let mut performed_series = Vec::with_capacity(groups.len());
	for group in groups {
		let mut series = series_template.clone();
		put_str(
			&mut series,
			tags::SERIES_INSTANCE_UID,
			VR::UI,
			&group.series_instance_uid,
		);
		put_str(
			&mut series,
			tags::PERFORMING_PHYSICIAN_NAME,
			VR::PN,
			&step.item.scheduled_performing_physician_name,
		);
		if let Some(description) = &step.description {
			put_str(&mut series, tags::SERIES_DESCRIPTION, VR::LO, description);
		}

		let mut images = Vec::with_capacity(group.sop_instance_infos.len());
		for instance in &group.sop_instance_infos {
			let mut image = image_template.clone();
			put_str(&mut image, tags::REFERENCED_SOP_CLASS_UID, VR::UI, &group.sop_class_uid);
			put_str(
				&mut image,
				tags::REFERENCED_SOP_INSTANCE_UID,
				VR::UI,
				&instance.sop_instance_uid,
			);
			if read_str(&series, tags::OPERATORS_NAME) == SIMULATOR_OPERATOR {
				apply_simulator_description(&mut series, Path::new(&instance.path))?;
			}
			images.push(image);
		}
		put_items(&mut series, tags::REFERENCED_IMAGE_SEQUENCE, images);
		performed_series.push(series);
	}
	put_items(&mut ds, tags::PERFORMED_SERIES_SEQUENCE, performed_series);

	Ok(ds)
}

/// Copies the series description of an acquired file into the operator name and series
/// description of a performed series. Files without a description are skipped.
fn apply_simulator_description(
	series: &mut InMemDicomObject,
	path: &Path,
) -> Result<(), WorkflowError> {
	let file = open_file(path).map_err(|source| WorkflowError::MissingFile {
		path: path.to_path_buf(),
		source,
	})?;
	let description = read_str(&file, tags::SERIES_DESCRIPTION);
	if !description.is_empty() {
		debug!(description, "Replacing simulator operator name");
		put_str(series, tags::OPERATORS_NAME, VR::PN, &description);
		put_str(series, tags::SERIES_DESCRIPTION, VR::LO, &description);
	}
	Ok(())
}

/// Binds the DISCONTINUED template. The performed series gets a fresh UID and no images.
#[instrument(skip_all)]
pub fn bind_discontinued(template: &DatasetTemplate) -> Result<InMemDicomObject, WorkflowError> {
	let now = Timestamp::now();
	let mut ds = template.instantiate();

	update_item(&mut ds, tags::PERFORMED_SERIES_SEQUENCE, 0, |series| {
		put_str(series, tags::SERIES_INSTANCE_UID, VR::UI, &generate_uid());
		put_items(series, tags::REFERENCED_IMAGE_SEQUENCE, Vec::new());
		Ok(())
	})?;
	put_str(&mut ds, tags::PERFORMED_PROCEDURE_STEP_STATUS, VR::CS, StepStatus::Discontinued.as_str());
	put_str(&mut ds, tags::PERFORMED_PROCEDURE_STEP_END_DATE, VR::DA, &now.date);
	put_str(&mut ds, tags::PERFORMED_PROCEDURE_STEP_END_TIME, VR::TM, &now.time);

	Ok(ds)
}
