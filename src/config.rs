use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{BuilderError, Result};

/// Top-level process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Object store transport settings. Shared by every run of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Attempts made by the transport before a request fails.
    #[serde(default = "default_retries")]
    pub retries: usize,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom S3 endpoint, e.g. LocalStack or MinIO.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
    /// Root directory of the `fs` repository type.
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    /// Log transfer progress per chunk.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Keys this version does not understand. Logged and ignored.
    #[serde(flatten, default, skip_serializing)]
    pub unknown: BTreeMap<String, toml::Value>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            region: default_region(),
            endpoint: None,
            allow_http: false,
            local_root: default_local_root(),
            debug: false,
            transfer: TransferConfig::default(),
            unknown: BTreeMap::new(),
        }
    }
}

/// Chunking and concurrency of blob transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Part size of multipart uploads.
    #[serde(default = "default_multipart_chunksize")]
    pub multipart_chunksize: usize,
    /// Artifacts at least this large are uploaded in parts.
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: usize,
    /// Parts in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Read size when streaming a file from disk.
    #[serde(default = "default_io_chunksize")]
    pub io_chunksize: usize,
    /// Bytes per second, unlimited when unset.
    #[serde(default)]
    pub max_bandwidth: Option<u64>,
    #[serde(flatten, default, skip_serializing)]
    pub unknown: BTreeMap<String, toml::Value>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_chunksize: default_multipart_chunksize(),
            multipart_threshold: default_multipart_threshold(),
            max_concurrency: default_max_concurrency(),
            io_chunksize: default_io_chunksize(),
            max_bandwidth: None,
            unknown: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Parent of the per-run temporary directories.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Deadline of one run. Checked before each stage starts.
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,
    /// Thread hint passed to the engine.
    #[serde(default)]
    pub omp_num_threads: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            stage_timeout_secs: None,
            omp_num_threads: None,
        }
    }
}

impl PipelineConfig {
    /// Variables native libraries read once when their thread pools start.
    /// They must be exported before any thread is spawned.
    pub fn thread_env(&self) -> Vec<(&'static str, String)> {
        self.omp_num_threads
            .map(|threads| ("OMP_NUM_THREADS", threads.to_string()))
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_retries() -> usize {
    3
}
fn default_region() -> String {
    "us-west-2".to_string()
}
fn default_local_root() -> PathBuf {
    PathBuf::from("./data")
}
fn default_multipart_chunksize() -> usize {
    10 * 1024 * 1024
}
fn default_multipart_threshold() -> usize {
    10 * 1024 * 1024
}
fn default_max_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cpus / 2).max(1)
}
fn default_io_chunksize() -> usize {
    256 * 1024
}
fn default_staging_dir() -> PathBuf {
    std::env::temp_dir()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from an optional TOML file, then apply environment
    /// variable overrides. Without an explicit path, `INDEX_BUILDER_CONFIG`
    /// is consulted; a missing file there falls back to defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (Some(p.to_string()), true),
            None => (std::env::var("INDEX_BUILDER_CONFIG").ok(), false),
        };

        let mut config = match path {
            Some(p) if explicit || Path::new(&p).exists() => Self::from_file(Path::new(&p))?,
            _ => Config::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        config.warn_unknown_keys();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuilderError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override fields from the variables `lookup` resolves.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("S3_ENDPOINT_URL") {
            self.storage.endpoint = Some(endpoint);
        }
        if let Some(region) = lookup("AWS_REGION") {
            self.storage.region = region;
        }
        if let Some(retries) = lookup("INDEX_BUILDER_RETRIES") {
            self.storage.retries = retries.parse().map_err(|_| {
                BuilderError::Config(format!("INDEX_BUILDER_RETRIES is not a number: {retries}"))
            })?;
        }
        if let Some(dir) = lookup("INDEX_BUILDER_STAGING_DIR") {
            self.pipeline.staging_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("INDEX_BUILDER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("INDEX_BUILDER_LOG_FORMAT") {
            self.logging.format = format;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let transfer = &self.storage.transfer;
        if transfer.multipart_chunksize == 0 {
            return Err(BuilderError::config_field(
                "storage.transfer.multipart_chunksize",
                "must be greater than 0",
            ));
        }
        if transfer.max_concurrency == 0 {
            return Err(BuilderError::config_field(
                "storage.transfer.max_concurrency",
                "must be greater than 0",
            ));
        }
        if transfer.io_chunksize == 0 {
            return Err(BuilderError::config_field(
                "storage.transfer.io_chunksize",
                "must be greater than 0",
            ));
        }
        if transfer.max_bandwidth == Some(0) {
            return Err(BuilderError::config_field(
                "storage.transfer.max_bandwidth",
                "must be greater than 0 when set",
            ));
        }
        if self.pipeline.stage_timeout_secs == Some(0) {
            return Err(BuilderError::config_field(
                "pipeline.stage_timeout_secs",
                "must be greater than 0 when set",
            ));
        }
        match self.logging.format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(BuilderError::config_field(
                "logging.format",
                format!("expected 'pretty' or 'json', got '{other}'"),
            )),
        }
    }

    /// Log every key that was present in the file but not understood.
    pub fn warn_unknown_keys(&self) {
        for key in self.storage.unknown.keys() {
            warn!(key = %key, "ignoring unknown storage config key");
        }
        for key in self.storage.transfer.unknown.keys() {
            warn!(key = %key, "ignoring unknown transfer config key");
        }
    }
}
