//! Discovery of acquired SOP instances.

use crate::types::{generate_uid, UI};
use crate::workflow::dataset::read_str;
use crate::workflow::model::{SeriesGroup, SopInstanceInfo};
use crate::workflow::WorkflowError;
use dicom::dictionary_std::tags;
use dicom::object::open_file;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

pub const DICOM_EXTENSION: &str = "dcm";

pub fn is_dicom_file(path: &Path) -> bool {
	path.extension()
		.is_some_and(|extension| extension == DICOM_EXTENSION)
}

/// Groups every `.dcm` file below `root` into one series per containing directory.
///
/// Each instance gets a fresh SOP Instance UID and each directory a fresh Series Instance UID;
/// UIDs embedded in the files are ignored. A group takes the SOP class of its first member.
/// Files are visited in name order within each directory. A missing `root` yields no groups.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn scan(root: &Path) -> Result<Vec<SeriesGroup>, WorkflowError> {
	if !root.exists() {
		warn!("Acquisition path does not exist");
		return Ok(Vec::new());
	}

	let mut groups: Vec<SeriesGroup> = Vec::new();
	let mut group_index: HashMap<PathBuf, usize> = HashMap::new();

	for entry in WalkDir::new(root).sort_by_file_name() {
		let entry = entry.map_err(|err| {
			WorkflowError::Dataset(format!("Failed to walk {}: {err}", root.display()))
		})?;
		let path = entry.path();
		if !entry.file_type().is_file() || !is_dicom_file(path) {
			continue;
		}

		let file = open_file(path).map_err(|source| WorkflowError::MissingFile {
			path: path.to_path_buf(),
			source,
		})?;
		let sop_class_uid: UI = read_str(&file, tags::SOP_CLASS_UID);
		if sop_class_uid.is_empty() {
			debug!(path = %path.display(), "Skipping file without SOP Class UID");
			continue;
		}

		let directory = path.parent().unwrap_or(root).to_path_buf();
		let index = *group_index.entry(directory).or_insert_with(|| {
			groups.push(SeriesGroup {
				series_instance_uid: generate_uid(),
				sop_class_uid: sop_class_uid.clone(),
				sop_instance_infos: Vec::new(),
			});
			groups.len() - 1
		});
		groups[index].sop_instance_infos.push(SopInstanceInfo {
			sop_instance_uid: generate_uid(),
			path: path.display().to_string(),
			sop_class_uid,
		});
	}

	debug!(
		series = groups.len(),
		instances = groups.iter().map(|g| g.sop_instance_infos.len()).sum::<usize>(),
		"Aggregated acquired instances"
	);
	Ok(groups)
}
