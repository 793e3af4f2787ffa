//! C-STORE of acquired series and loose files to a storage peer.
//!
//! Stores run strictly in sequence. The first rejected instance aborts the whole transfer;
//! instances stored before it stay stored.

use crate::backend::{
	NetworkService, PresentationParameter, RemotePeer, Session, StoreInstance, STATUS_SUCCESS,
};
use crate::types::{generate_uid, UI};
use crate::workflow::aggregate::is_dicom_file;
use crate::workflow::dataset::{put_str, read_str, Timestamp};
use crate::workflow::model::{HeadlessStoreRequest, PatientIdentity, ProcedureStep, SeriesGroup};
use crate::workflow::rewrite::{prepare_structured, update_referenced_series};
use crate::workflow::WorkflowError;
use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject, InMemDicomObject};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Root of the composite storage SOP classes.
pub const STORAGE_SOP_CLASS_PREFIX: &str = "1.2.840.10008.5.1.4.1.1.";

fn open(path: &Path) -> Result<DefaultDicomObject, WorkflowError> {
	open_file(path).map_err(|source| WorkflowError::MissingFile {
		path: path.to_path_buf(),
		source,
	})
}

fn presentation(sop_class_uid: &str, transfer_syntax_uid: &str) -> PresentationParameter {
	PresentationParameter {
		abstract_syntax_uid: UI::from(sop_class_uid),
		transfer_syntax_uids: vec![UI::from(transfer_syntax_uid)],
	}
}

#[rustfmt::skip]
fn stamp_identity(ds: &mut InMemDicomObject, sop_instance_uid: &str, patient: &PatientIdentity) {
	let now = Timestamp::now();
	put_str(ds, tags::INSTANCE_CREATION_DATE, VR::DA, &now.date);
	put_str(ds, tags::INSTANCE_CREATION_TIME, VR::TM, &now.time);
	put_str(ds, tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid);
	put_str(ds, tags::PATIENT_NAME, VR::PN, &patient.patient_name);
	put_str(ds, tags::PATIENT_ID, VR::LO, &patient.patient_id);
	put_str(ds, tags::PATIENT_BIRTH_DATE, VR::DA, &patient.patient_birth_date);
	put_str(ds, tags::PATIENT_SEX, VR::CS, &patient.patient_sex);
}

fn non_empty(value: Option<&String>) -> Option<&str> {
	value.map(String::as_str).filter(|value| !value.is_empty())
}

/// An instance ready for C-STORE together with the file it came from.
struct Prepared {
	path: PathBuf,
	instance: StoreInstance,
}

/// Files of one directory sharing a SOP class and transfer syntax.
#[derive(Debug)]
struct StoreUnit {
	sop_class_uid: UI,
	transfer_syntax_uid: UI,
	paths: Vec<PathBuf>,
}

/// Collects the DICOM files below `root`, one list per containing directory.
fn leaf_directories(root: &Path) -> Result<Vec<Vec<PathBuf>>, WorkflowError> {
	if root.is_file() {
		return Ok(vec![vec![root.to_path_buf()]]);
	}

	let mut directories: Vec<Vec<PathBuf>> = Vec::new();
	let mut index: HashMap<PathBuf, usize> = HashMap::new();
	for entry in WalkDir::new(root).sort_by_file_name() {
		let entry = entry.map_err(|err| {
			WorkflowError::Dataset(format!("Failed to walk {}: {err}", root.display()))
		})?;
		let path = entry.path();
		if !entry.file_type().is_file() || !is_dicom_file(path) {
			continue;
		}
		let directory = path.parent().unwrap_or(root).to_path_buf();
		let position = *index.entry(directory).or_insert_with(|| {
			directories.push(Vec::new());
			directories.len() - 1
		});
		directories[position].push(path.to_path_buf());
	}
	Ok(directories)
}

/// Splits one directory into store units and returns the last embedded Series Instance UID.
fn plan_units(files: &[PathBuf]) -> Result<(Vec<StoreUnit>, Option<UI>), WorkflowError> {
	let mut units: Vec<StoreUnit> = Vec::new();
	let mut embedded_series = None;
	for path in files {
		let file = open(path)?;
		let sop_class_uid = read_str(&file, tags::SOP_CLASS_UID);
		let transfer_syntax_uid = file.meta().transfer_syntax().to_owned();
		let series_instance_uid = read_str(&file, tags::SERIES_INSTANCE_UID);
		if !series_instance_uid.is_empty() {
			embedded_series = Some(series_instance_uid);
		}

		match units.iter_mut().find(|unit| {
			unit.sop_class_uid == sop_class_uid && unit.transfer_syntax_uid == transfer_syntax_uid
		}) {
			Some(unit) => unit.paths.push(path.clone()),
			None => units.push(StoreUnit {
				sop_class_uid,
				transfer_syntax_uid,
				paths: vec![path.clone()],
			}),
		}
	}
	Ok((units, embedded_series))
}

pub struct TransferPipeline {
	network: Arc<dyn NetworkService>,
	extra_sop_classes: Vec<UI>,
	cancellation: CancellationToken,
}

impl TransferPipeline {
	pub fn new(network: Arc<dyn NetworkService>, extra_sop_classes: Vec<UI>) -> Self {
		Self {
			network,
			extra_sop_classes,
			cancellation: CancellationToken::new(),
		}
	}

	/// Stops the pipeline before the next store once `cancellation` is cancelled.
	#[must_use]
	pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
		self.cancellation = cancellation;
		self
	}

	pub fn is_supported(&self, sop_class_uid: &str) -> bool {
		sop_class_uid.starts_with(STORAGE_SOP_CLASS_PREFIX)
			|| self.extra_sop_classes.iter().any(|extra| extra == sop_class_uid)
	}

	fn check_cancelled(&self) -> Result<(), WorkflowError> {
		if self.cancellation.is_cancelled() {
			warn!("Transfer cancelled");
			return Err(WorkflowError::Cancelled);
		}
		Ok(())
	}

	async fn store_members<T, F>(
		&self,
		session: &mut Box<dyn Session>,
		members: &[T],
		prepare: &F,
	) -> Result<(), WorkflowError>
	where
		T: Sync,
		F: Fn(&T) -> Result<Prepared, WorkflowError> + Sync,
	{
		for member in members {
			self.check_cancelled()?;
			let Prepared { path, instance } = prepare(member)?;
			let status = session.store(instance).await?;
			if status != STATUS_SUCCESS {
				warn!(status, path = %path.display(), "Storage peer rejected instance");
				return Err(WorkflowError::StoreRejected { path, status });
			}
			debug!(path = %path.display(), "Stored instance");
		}
		Ok(())
	}

	/// Stores `members` over one association, which is released before returning.
	async fn store_unit<T, F>(
		&self,
		peer: &RemotePeer,
		presentation: PresentationParameter,
		members: &[T],
		prepare: F,
	) -> Result<(), WorkflowError>
	where
		T: Sync,
		F: Fn(&T) -> Result<Prepared, WorkflowError> + Sync,
	{
		let mut session = self.network.associate(peer, presentation).await?;
		let result = self.store_members(&mut session, members, &prepare).await;
		session.release().await;
		result
	}

	/// Stores every series of a procedure step, one association per series.
	///
	/// Series of unsupported SOP classes are skipped. Each instance is stamped with the step's
	/// patient and study, its series and the instance UID assigned during aggregation.
	#[instrument(skip_all, fields(peer = %peer, accession_number = %step.item.accession_number))]
	pub async fn send(
		&self,
		peer: &RemotePeer,
		step: &ProcedureStep,
		groups: &[SeriesGroup],
	) -> Result<(), WorkflowError> {
		if groups.is_empty() {
			return Err(WorkflowError::NoInstancesFound);
		}
		let patient = step.patient();
		let description = non_empty(step.description.as_ref());

		for group in groups {
			self.check_cancelled()?;
			if !self.is_supported(&group.sop_class_uid) {
				warn!(sop_class_uid = %group.sop_class_uid, "Skipping series of unsupported SOP class");
				continue;
			}
			let Some(first) = group.sop_instance_infos.first() else {
				continue;
			};
			let transfer_syntax_uid = open(Path::new(&first.path))?
				.meta()
				.transfer_syntax()
				.to_owned();

			self.store_unit(
				peer,
				presentation(&group.sop_class_uid, &transfer_syntax_uid),
				&group.sop_instance_infos,
				|member| {
					let path = PathBuf::from(&member.path);
					let mut ds = open(&path)?.into_inner();
					stamp_identity(&mut ds, &member.sop_instance_uid, &patient);
					put_str(&mut ds, tags::STUDY_INSTANCE_UID, VR::UI, &step.item.study_instance_uid);
					put_str(&mut ds, tags::SERIES_INSTANCE_UID, VR::UI, &group.series_instance_uid);
					if let Some(description) = description {
						put_str(&mut ds, tags::SERIES_DESCRIPTION, VR::LO, description);
					}
					Ok(Prepared {
						path,
						instance: StoreInstance {
							sop_class_uid: member.sop_class_uid.clone(),
							sop_instance_uid: member.sop_instance_uid.clone(),
							data_set: ds,
						},
					})
				},
			)
			.await?;
			info!(
				series_instance_uid = %group.series_instance_uid,
				instances = group.sop_instance_infos.len(),
				"Stored series"
			);
		}
		Ok(())
	}

	/// Relinks the structured object in `file` to the step's series and stores it.
	/// Returns the SOP Instance UID it was stored under.
	#[instrument(skip_all, fields(peer = %peer, file = %file.display()))]
	pub async fn send_structured(
		&self,
		peer: &RemotePeer,
		step: &ProcedureStep,
		file: &Path,
		placeholder_uids: &[UI],
	) -> Result<UI, WorkflowError> {
		self.check_cancelled()?;
		let source = open(file)?;
		let transfer_syntax_uid = source.meta().transfer_syntax().to_owned();
		let sop_class_uid = read_str(&source, tags::SOP_CLASS_UID);
		let (data_set, sop_instance_uid) = prepare_structured(&source, step, placeholder_uids)?;
		drop(source);

		let mut session = self
			.network
			.associate(peer, presentation(&sop_class_uid, &transfer_syntax_uid))
			.await?;
		let result = session
			.store(StoreInstance {
				sop_class_uid,
				sop_instance_uid: sop_instance_uid.clone(),
				data_set,
			})
			.await;
		session.release().await;

		let status = result?;
		if status != STATUS_SUCCESS {
			warn!(status, "Storage peer rejected structured object");
			return Err(WorkflowError::StoreRejected {
				path: file.to_path_buf(),
				status,
			});
		}
		info!(sop_instance_uid = %sop_instance_uid, "Stored structured object");
		Ok(sop_instance_uid)
	}

	/// Stores a file or every DICOM file below a directory without a procedure step.
	///
	/// Each directory is stored with one association per SOP class and transfer syntax. With
	/// `generate` set, all files share a new study and each directory gets a new series;
	/// otherwise the embedded UIDs are kept. Returns the last Series Instance UID used.
	///
	/// A structure set in a generated transfer references the new series of its own directory,
	/// not the series stored last. Keep it next to the images it was contoured on.
	#[instrument(skip_all, fields(peer = %peer, path = %request.path))]
	pub async fn send_by_path(
		&self,
		peer: &RemotePeer,
		request: &HeadlessStoreRequest,
	) -> Result<UI, WorkflowError> {
		let root = Path::new(&request.path);
		if !root.exists() {
			return Err(WorkflowError::PathNotFound(root.to_path_buf()));
		}
		let study_instance_uid = generate_uid();
		let description = non_empty(request.description.as_ref());
		let mut last_series_uid = UI::new();

		for files in leaf_directories(root)? {
			self.check_cancelled()?;
			let series_instance_uid = request.generate.then(generate_uid);
			let (units, embedded_series) = plan_units(&files)?;

			for unit in &units {
				if !self.is_supported(&unit.sop_class_uid) {
					warn!(sop_class_uid = %unit.sop_class_uid, "Skipping files of unsupported SOP class");
					continue;
				}
				let series = series_instance_uid.as_deref();
				self.store_unit(
					peer,
					presentation(&unit.sop_class_uid, &unit.transfer_syntax_uid),
					&unit.paths,
					|path: &PathBuf| {
						let mut ds = open(path)?.into_inner();
						let sop_instance_uid = generate_uid();
						stamp_identity(&mut ds, &sop_instance_uid, &request.patient);
						if let Some(series) = series {
							put_str(&mut ds, tags::STUDY_INSTANCE_UID, VR::UI, &study_instance_uid);
							put_str(&mut ds, tags::SERIES_INSTANCE_UID, VR::UI, series);
							if ds.get(tags::REFERENCED_FRAME_OF_REFERENCE_SEQUENCE).is_some() {
								update_referenced_series(&mut ds, |referenced| {
									put_str(referenced, tags::SERIES_INSTANCE_UID, VR::UI, series);
									Ok(())
								})?;
							}
						}
						if let Some(description) = description {
							put_str(&mut ds, tags::SERIES_DESCRIPTION, VR::LO, description);
						}
						Ok(Prepared {
							path: path.clone(),
							instance: StoreInstance {
								sop_class_uid: read_str(&ds, tags::SOP_CLASS_UID),
								sop_instance_uid,
								data_set: ds,
							},
						})
					},
				)
				.await?;
			}

			if let Some(series) = series_instance_uid.or(embedded_series) {
				last_series_uid = series;
			}
		}

		info!(series_instance_uid = %last_series_uid, "Stored files");
		Ok(last_series_uid)
	}
}
