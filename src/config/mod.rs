use crate::types::{GroupingKeyKind, AE, UI};
use crate::DEFAULT_AET;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
	#[serde(default)]
	pub telemetry: TelemetryConfig,
	#[serde(default)]
	pub server: ServerConfig,
	#[serde(default)]
	pub staging: StagingConfig,
	#[serde(default)]
	pub sources: Vec<SourceConfig>,
	#[serde(default)]
	pub called_aets: Vec<CalledAeConfig>,
	#[serde(default)]
	pub kv: KvConfig,
	pub platform: PlatformConfig,
	#[serde(default)]
	pub worker: WorkerConfig,
	#[serde(default)]
	pub retrieval: RetrievalConfig,
}

impl AppConfig {
	/// Loads the application configuration from the following sources, in increasing precedence:
	/// 1. Defaults (defined in `defaults.yaml`)
	/// 2. `config.yaml` in the working directory
	/// 3. Environment variables, prefixed with `DICOM_ADAPTER_`
	/// # Errors
	/// Returns a [`config::ConfigError`] if source collection or deserialization fails.
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::{Config, Environment, File, FileFormat};
		Config::builder()
			.add_source(File::from_str(
				include_str!("defaults.yaml"),
				FileFormat::Yaml,
			))
			.add_source(File::with_name("config.yaml").required(false))
			.add_source(Environment::with_prefix("DICOM_ADAPTER").separator("_"))
			.build()?
			.try_deserialize()
	}

	/// Finds the called-AE configuration for the given local AE title, if one is configured.
	pub fn called_aet(&self, aet: &str) -> Option<&CalledAeConfig> {
		self.called_aets.iter().find(|c| c.aet == aet)
	}

	/// Finds the configured source id for a calling AE title allowed to connect, if any.
	pub fn source_for_calling_aet(&self, aet: &str) -> Option<&SourceConfig> {
		self.sources.iter().find(|s| s.aet == aet)
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceConfig {
	/// Calling AE title allowed to open associations.
	pub aet: AE,
	/// Opaque identifier this calling AE is resolved to (§3 AE Title Policy).
	pub source_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CalledAeConfig {
	pub aet: AE,
	#[serde(default)]
	pub grouping_key: GroupingKeyKind,
	#[serde(default = "CalledAeConfig::default_timeout_ms")]
	pub timeout_ms: u64,
	#[serde(default = "CalledAeConfig::default_max_age_ms")]
	pub max_age_ms: u64,
	#[serde(default)]
	pub allowed_sops: Vec<UI>,
	/// Source ids (not AE titles) permitted to push into this called AE.
	#[serde(default)]
	pub allowed_sources: Vec<String>,
	pub pipeline_ids: Vec<String>,
	#[serde(default = "CalledAeConfig::default_priority")]
	pub priority: u8,
}

impl CalledAeConfig {
	pub const fn default_timeout_ms() -> u64 {
		5_000
	}
	pub const fn default_max_age_ms() -> u64 {
		60_000
	}
	pub const fn default_priority() -> u8 {
		128
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
	pub aet: AE,
	pub http: HttpServerConfig,
	pub dimse: DimseServerConfig,
	#[serde(default = "ServerConfig::default_max_associations")]
	pub max_associations: usize,
}

impl ServerConfig {
	pub const fn default_max_associations() -> usize {
		32
	}
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			aet: AE::from(DEFAULT_AET),
			http: HttpServerConfig::default(),
			dimse: DimseServerConfig::default(),
			max_associations: Self::default_max_associations(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpServerConfig {
	pub interface: IpAddr,
	pub port: u16,
	pub request_timeout_ms: u64,
	pub base_path: String,
}

impl Default for HttpServerConfig {
	fn default() -> Self {
		Self {
			interface: IpAddr::from([0, 0, 0, 0]),
			port: 8080,
			request_timeout_ms: 60_000,
			base_path: String::from("/"),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DimseServerConfig {
	pub interface: IpAddr,
	#[serde(default = "DimseServerConfig::default_port")]
	pub port: u16,
	#[serde(default = "DimseServerConfig::default_uncompressed")]
	pub uncompressed: bool,
	/// DIMSE timeout (read/write) per §5.
	#[serde(default = "DimseServerConfig::default_dimse_timeout_ms")]
	pub dimse_timeout_ms: u64,
	/// Association-idle timeout per §5.
	#[serde(default = "DimseServerConfig::default_idle_timeout_ms")]
	pub idle_timeout_ms: u64,
}

impl DimseServerConfig {
	pub const fn default_port() -> u16 {
		7001
	}
	pub const fn default_uncompressed() -> bool {
		true
	}
	pub const fn default_dimse_timeout_ms() -> u64 {
		30_000
	}
	pub const fn default_idle_timeout_ms() -> u64 {
		60_000
	}
}

impl Default for DimseServerConfig {
	fn default() -> Self {
		Self {
			interface: IpAddr::from([0, 0, 0, 0]),
			port: Self::default_port(),
			uncompressed: Self::default_uncompressed(),
			dimse_timeout_ms: Self::default_dimse_timeout_ms(),
			idle_timeout_ms: Self::default_idle_timeout_ms(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StagingConfig {
	pub root: PathBuf,
	#[serde(default = "StagingConfig::default_retention_hours")]
	pub retention_hours: u64,
	#[serde(default = "StagingConfig::default_high_water_bytes")]
	pub high_water_bytes: u64,
}

impl StagingConfig {
	pub const fn default_retention_hours() -> u64 {
		24
	}
	pub const fn default_high_water_bytes() -> u64 {
		500_000_000_000
	}
}

impl Default for StagingConfig {
	fn default() -> Self {
		Self {
			root: PathBuf::from("./staging"),
			retention_hours: Self::default_retention_hours(),
			high_water_bytes: Self::default_high_water_bytes(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KvConfig {
	pub path: PathBuf,
}

impl Default for KvConfig {
	fn default() -> Self {
		Self {
			path: PathBuf::from("./adapter.redb"),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlatformConfig {
	pub base_url: String,
	#[serde(default = "PlatformConfig::default_timeout_ms")]
	pub timeout_ms: u64,
	#[serde(default = "PlatformConfig::default_max_job_name_len")]
	pub max_job_name_len: usize,
}

impl PlatformConfig {
	pub const fn default_timeout_ms() -> u64 {
		30_000
	}
	pub const fn default_max_job_name_len() -> usize {
		64
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerConfig {
	#[serde(default = "WorkerConfig::default_concurrency")]
	pub concurrency: usize,
	#[serde(default = "WorkerConfig::default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "WorkerConfig::default_backoff_base_ms")]
	pub backoff_base_ms: u64,
	#[serde(default = "WorkerConfig::default_backoff_factor")]
	pub backoff_factor: u32,
	#[serde(default = "WorkerConfig::default_backoff_cap_ms")]
	pub backoff_cap_ms: u64,
	#[serde(default = "WorkerConfig::default_retrieval_timeout_ms")]
	pub retrieval_timeout_ms: u64,
	/// §4.G step 3: by default, a data-source resource that yields zero instances aborts
	/// retrieval before the next resource is tried. Setting this `true` marks the called-AE
	/// "fallback" exception, letting later resources be attempted regardless.
	#[serde(default = "WorkerConfig::default_fallback_on_empty_resource")]
	pub fallback_on_empty_resource: bool,
}

impl WorkerConfig {
	pub const fn default_concurrency() -> usize {
		1
	}
	pub const fn default_max_retries() -> u32 {
		3
	}
	pub const fn default_backoff_base_ms() -> u64 {
		1_000
	}
	pub const fn default_backoff_factor() -> u32 {
		2
	}
	pub const fn default_backoff_cap_ms() -> u64 {
		60_000
	}
	pub const fn default_retrieval_timeout_ms() -> u64 {
		600_000
	}
	pub const fn default_fallback_on_empty_resource() -> bool {
		false
	}
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			concurrency: Self::default_concurrency(),
			max_retries: Self::default_max_retries(),
			backoff_base_ms: Self::default_backoff_base_ms(),
			backoff_factor: Self::default_backoff_factor(),
			backoff_cap_ms: Self::default_backoff_cap_ms(),
			retrieval_timeout_ms: Self::default_retrieval_timeout_ms(),
			fallback_on_empty_resource: Self::default_fallback_on_empty_resource(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetrievalConfig {
	/// Remote DIMSE sources usable for C-FIND/C-MOVE retrieval, keyed by source id.
	#[serde(default)]
	pub dimse_sources: Vec<DimseSourceConfig>,
	/// The AE title this adapter presents as the C-MOVE destination (it is also the SCP).
	#[serde(default)]
	pub move_destination_aet: Option<AE>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DimseSourceConfig {
	pub source_id: String,
	pub host: String,
	pub port: u16,
	pub called_aet: AE,
	#[serde(default)]
	pub pool: PoolConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PoolConfig {
	pub size: usize,
	pub timeout_ms: u64,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			size: 4,
			timeout_ms: 10_000,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
	#[serde(deserialize_with = "deserialize_log_level")]
	pub level: tracing::Level,
}

impl Default for TelemetryConfig {
	fn default() -> Self {
		Self {
			level: tracing::Level::INFO,
		}
	}
}

/// Deserializer for [`tracing::Level`] as it does not implement [`Deserialize`].
fn deserialize_log_level<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
where
	D: serde::Deserializer<'de>,
{
	use serde::de::Error;
	let value = String::deserialize(deserializer)?;

	tracing::Level::from_str(&value)
		.map_err(|_| Error::unknown_variant(&value, &["TRACE", "DEBUG", "INFO", "WARN", "ERROR"]))
}
