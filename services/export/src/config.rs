use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Smallest part size S3 accepts for a non-final multipart part
pub const MIN_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration for the exporter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Google Cloud API configuration
    #[serde(default)]
    pub gcp: GcpConfig,
    /// Blob storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Export run configuration
    #[serde(default)]
    pub export: ExportConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Prometheus listener port; no listener when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Google Cloud REST endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct GcpConfig {
    /// Cloud Monitoring v3 base URL
    #[serde(default = "default_monitoring_endpoint")]
    pub monitoring_endpoint: String,
    /// Resource Manager v1 base URL
    #[serde(default = "default_resource_manager_endpoint")]
    pub resource_manager_endpoint: String,
    /// Compute Engine v1 base URL
    #[serde(default = "default_compute_endpoint")]
    pub compute_endpoint: String,
    /// Requested page size for list calls
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Blob storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Which blob store implementation to use
    #[serde(default)]
    pub backend: StorageBackend,
    /// Region passed to the S3 client
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (GCS interoperability, MinIO, LocalStack)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Objects larger than this are sent as multipart uploads
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Memory,
}

/// Export run configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Bucket names are `{bucket_prefix}-{company}-{project}`
    #[serde(default = "default_bucket_prefix")]
    pub bucket_prefix: String,
    /// Staged bytes that trigger a batch flush
    #[serde(default = "default_threshold_bytes")]
    pub threshold_bytes: u64,
    /// Root under which batch directories are created
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// How far back the export window reaches
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
}

// Default value functions
fn default_service_name() -> String {
    "telemetry-export".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_monitoring_endpoint() -> String {
    "https://monitoring.googleapis.com/v3".to_string()
}

fn default_resource_manager_endpoint() -> String {
    "https://cloudresourcemanager.googleapis.com/v1".to_string()
}

fn default_compute_endpoint() -> String {
    "https://compute.googleapis.com/compute/v1".to_string()
}

fn default_page_size() -> u32 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    16 * 1024 * 1024 // 16MB
}

fn default_part_size() -> usize {
    16 * 1024 * 1024 // 16MB
}

fn default_bucket_prefix() -> String {
    "stackdriver".to_string()
}

fn default_threshold_bytes() -> u64 {
    1024 * 1024 * 500 // 500MB
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("telemetry-export")
}

fn default_lookback_days() -> u32 {
    42
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/exporter").required(false))
            .add_source(config::File::with_name("/etc/telemetry-export/exporter").required(false))
            // EXPORTER__EXPORT__THRESHOLD_BYTES -> export.threshold_bytes
            .add_source(
                config::Environment::with_prefix("EXPORTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the exporter cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.export.threshold_bytes == 0 {
            return Err(ConfigError::Invalid(
                "export.threshold_bytes must be greater than zero".to_string(),
            ));
        }
        if self.export.bucket_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "export.bucket_prefix must not be empty".to_string(),
            ));
        }
        if self.storage.part_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "storage.part_size_bytes must be greater than zero".to_string(),
            ));
        }
        if self.storage.part_size_bytes < MIN_PART_SIZE_BYTES {
            return Err(ConfigError::Invalid(format!(
                "storage.part_size_bytes must be at least {MIN_PART_SIZE_BYTES}"
            )));
        }
        Ok(())
    }
}

impl GcpConfig {
    /// Get the per-request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ExportConfig {
    /// Get the export window length
    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.lookback_days))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: None,
        }
    }
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            monitoring_endpoint: default_monitoring_endpoint(),
            resource_manager_endpoint: default_resource_manager_endpoint(),
            compute_endpoint: default_compute_endpoint(),
            page_size: default_page_size(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            bucket_prefix: default_bucket_prefix(),
            threshold_bytes: default_threshold_bytes(),
            staging_dir: default_staging_dir(),
            lookback_days: default_lookback_days(),
        }
    }
}
