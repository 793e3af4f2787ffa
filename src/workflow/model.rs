//! Records exchanged with callers and read from configuration.

use crate::backend::RemotePeer;
use crate::types::{AE, UI};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// One storable object discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SopInstanceInfo {
	pub sop_instance_uid: UI,
	pub path: String,
	#[serde(rename = "SOPClassUID")]
	pub sop_class_uid: UI,
}

/// All objects acquired into one directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesGroup {
	pub series_instance_uid: UI,
	#[serde(rename = "SOPClassUID")]
	pub sop_class_uid: UI,
	pub sop_instance_infos: Vec<SopInstanceInfo>,
}

/// Performed Procedure Step Status (0040,0252)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
	InProgress,
	Completed,
	Discontinued,
}

impl StepStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::InProgress => "IN PROGRESS",
			Self::Completed => "COMPLETED",
			Self::Discontinued => "DISCONTINUED",
		}
	}

	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Discontinued)
	}
}

impl Display for StepStatus {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The flat record extracted from a worklist C-FIND match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct WorklistItem {
	pub accession_number: String,
	pub requested_procedure_description: String,
	pub patient_name: String,
	#[serde(rename = "PatientID")]
	pub patient_id: String,
	pub patient_birth_date: String,
	pub patient_sex: String,
	pub modality: String,
	#[serde(rename = "ScheduledStationAETitle")]
	pub scheduled_station_ae_title: String,
	pub scheduled_procedure_step_start_date: String,
	pub scheduled_performing_physician_name: String,
	#[serde(rename = "StudyInstanceUID")]
	pub study_instance_uid: UI,
}

/// A Modality Performed Procedure Step as tracked by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcedureStep {
	#[serde(flatten)]
	pub item: WorklistItem,
	pub status: Option<StepStatus>,
	#[serde(rename = "MppsInstanceUid")]
	pub mpps_instance_uid: Option<UI>,
	#[serde(rename = "SopInstanceUids", with = "embedded_json")]
	pub sop_instance_uids: Option<Vec<SeriesGroup>>,
	#[serde(rename = "DcmFile")]
	pub dcm_file: Option<String>,
	pub description: Option<String>,
}

impl ProcedureStep {
	pub fn patient(&self) -> PatientIdentity {
		PatientIdentity {
			patient_name: self.item.patient_name.clone(),
			patient_id: self.item.patient_id.clone(),
			patient_birth_date: self.item.patient_birth_date.clone(),
			patient_sex: self.item.patient_sex.clone(),
		}
	}

	pub fn series_groups(&self) -> &[SeriesGroup] {
		self.sop_instance_uids.as_deref().unwrap_or_default()
	}
}

/// Serializes a series group list the way it travels inside a procedure step.
pub fn serialize_groups(groups: &[SeriesGroup]) -> Result<String, serde_json::Error> {
	serde_json::to_string(groups)
}

/// `SopInstanceUids` travels as a JSON document embedded in a string field.
mod embedded_json {
	use super::SeriesGroup;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(
		groups: &Option<Vec<SeriesGroup>>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match groups {
			Some(groups) => {
				let embedded = serde_json::to_string(groups).map_err(serde::ser::Error::custom)?;
				serializer.serialize_some(&embedded)
			}
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<Vec<SeriesGroup>>, D::Error> {
		let embedded = Option::<String>::deserialize(deserializer)?;
		match embedded.as_deref().map(str::trim) {
			None | Some("") => Ok(None),
			Some(embedded) => serde_json::from_str(embedded)
				.map(Some)
				.map_err(serde::de::Error::custom),
		}
	}
}

/// Demographics stamped onto files sent without a procedure step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientIdentity {
	pub patient_name: String,
	pub patient_id: String,
	pub patient_birth_date: String,
	pub patient_sex: String,
}

/// Overrides for a worklist query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorklistQuery {
	/// Modality of the primary query. Falls back to the configured modality.
	pub modality: Option<String>,
}

/// Discontinuation of a procedure step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscontinueRequest {
	pub mpps_instance_uid: Option<UI>,
	/// State the step is in before the discontinuation.
	#[serde(rename = "currentState")]
	pub current_state: Option<StepStatus>,
}

/// A transfer of files on disk without a procedure step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlessStoreRequest {
	#[serde(flatten)]
	pub patient: PatientIdentity,
	pub description: Option<String>,
	/// Replace study and series UIDs instead of keeping the embedded ones.
	pub generate: bool,
	/// A single file or a directory tree.
	pub path: String,
}

/// A scheduling peer offering the Modality Worklist and MPPS services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorklistEndpoint {
	pub name: String,
	pub calling_aet: AE,
	pub query_aet: AE,
	pub host: String,
	pub port: u16,
	/// Falls back to `calling_aet`.
	#[serde(default)]
	pub mpps_calling_aet: Option<AE>,
	pub mpps_aet: AE,
	pub mpps_port: u16,
	#[serde(default)]
	pub tls: bool,
}

impl WorklistEndpoint {
	pub fn query_peer(&self) -> RemotePeer {
		RemotePeer {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.query_aet.clone(),
			host: self.host.clone(),
			port: self.port,
			tls: self.tls,
		}
	}

	/// The MPPS SCP runs on the worklist host.
	pub fn mpps_peer(&self) -> RemotePeer {
		RemotePeer {
			calling_aet: self
				.mpps_calling_aet
				.clone()
				.unwrap_or_else(|| self.calling_aet.clone()),
			called_aet: self.mpps_aet.clone(),
			host: self.host.clone(),
			port: self.mpps_port,
			tls: self.tls,
		}
	}
}

/// A storage archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePeer {
	pub name: String,
	pub calling_aet: AE,
	pub aet: AE,
	pub host: String,
	pub port: u16,
	#[serde(default)]
	pub tls: bool,
}

impl StoragePeer {
	pub fn peer(&self) -> RemotePeer {
		RemotePeer {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.aet.clone(),
			host: self.host.clone(),
			port: self.port,
			tls: self.tls,
		}
	}
}

/// Result record returned by every public operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowResponse {
	pub success: bool,
	pub message: String,
	pub result: String,
}

impl WorkflowResponse {
	pub fn success(message: impl Into<String>, result: impl Into<String>) -> Self {
		Self {
			success: true,
			message: message.into(),
			result: result.into(),
		}
	}

	pub fn failure(message: impl Into<String>) -> Self {
		Self {
			success: false,
			message: message.into(),
			result: String::new(),
		}
	}

	#[must_use]
	pub fn with_result(mut self, result: impl Into<String>) -> Self {
		self.result = result.into();
		self
	}
}
