use crate::types::UI;
use crate::workflow::model::{StoragePeer, WorklistEndpoint};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: ServerConfig,
	pub dimse: DimseConfig,
	#[serde(default)]
	pub templates: TemplateConfig,
	#[serde(default)]
	pub worklist: WorklistConfig,
	#[serde(default)]
	pub structured: StructuredConfig,
	#[serde(default)]
	pub storage: StorageConfig,
	/// Scheduling peers, addressed by name.
	#[serde(default)]
	pub worklists: Vec<WorklistEndpoint>,
	/// Storage peers, addressed by name.
	#[serde(default)]
	pub peers: Vec<StoragePeer>,
}

fn defaults() -> ConfigBuilder<DefaultState> {
	Config::builder().add_source(File::from_str(
		include_str!("defaults.toml"),
		FileFormat::Toml,
	))
}

impl AppConfig {
	/// Layers `config.toml` and `MPPS_BRIDGE_*` environment variables over the built-in defaults.
	pub fn new() -> Result<Self, ConfigError> {
		defaults()
			.add_source(File::with_name("config.toml").required(false))
			.add_source(Environment::with_prefix("MPPS_BRIDGE").separator("_"))
			.build()?
			.try_deserialize()
	}

	pub fn worklist(&self, name: &str) -> Option<&WorklistEndpoint> {
		self.worklists.iter().find(|endpoint| endpoint.name == name)
	}

	pub fn peer(&self, name: &str) -> Option<&StoragePeer> {
		self.peers.iter().find(|peer| peer.name == name)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Also configurable via RUST_LOG.
	#[serde(deserialize_with = "deserialize_level")]
	pub level: Level,
	/// Sentry DSN. Sentry stays disabled without one.
	pub sentry: Option<String>,
}

fn deserialize_level<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
	String::deserialize(deserializer)?
		.parse()
		.map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	pub http: HttpServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
	pub interface: IpAddr,
	pub port: u16,
	/// Seconds
	pub request_timeout: u64,
	pub graceful_shutdown: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimseConfig {
	/// Milliseconds to wait for each PDU.
	pub timeout: u64,
	pub certs_dir: PathBuf,
}

impl DimseConfig {
	pub const fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout)
	}
}

/// Prototype dataset files. Unset entries use the built-in prototypes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
	/// Secondary worklist query, matching every modality.
	pub worklist: Option<PathBuf>,
	/// Primary worklist query. Its modality is taken from the file as is.
	pub worklist_modality: Option<PathBuf>,
	pub in_progress: Option<PathBuf>,
	pub completed: Option<PathBuf>,
	pub discontinued: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorklistConfig {
	pub modality: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StructuredConfig {
	pub placeholder_uids: Vec<UI>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
	pub extra_sop_classes: Vec<UI>,
}
