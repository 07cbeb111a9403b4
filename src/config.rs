//! Configuration for the report synchronization pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote reconciliation service
    pub remote: RemoteConfig,

    /// Input record configuration
    #[serde(default)]
    pub input: InputConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,
}

/// Remote service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the reconciliation API
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Bearer token sent with every request
    #[serde(default)]
    pub api_token: Option<String>,
}

/// Input record configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Column holding each record's unique key
    #[serde(default = "default_key_field")]
    pub key_field: String,

    /// Column holding the owning group, used when the remote store
    /// returns no group for a record
    #[serde(default)]
    pub group_field: Option<String>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            key_field: default_key_field(),
            group_field: None,
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Where to write the merged report (.json or .csv).
    /// If unset, only the summary is printed.
    #[serde(default)]
    pub report_path: Option<String>,
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Records per chunk. Chosen from the dataset size if unset.
    #[serde(default)]
    pub chunk_size: Option<usize>,

    /// Simultaneous dispatch calls. Chosen from the dataset size if unset.
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Retry configuration for remote calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Pacing sleep between starting two dispatches, in milliseconds
    #[serde(default = "default_pause_between_chunks_ms")]
    pub pause_between_chunks_ms: u64,

    /// Minimum time between two polls of the same task, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Optional wall-clock limit per task while polling, in seconds
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            concurrency: None,
            retry: RetryConfig::default(),
            pause_between_chunks_ms: default_pause_between_chunks_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            task_timeout_secs: None,
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt in milliseconds
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Multiplier applied to the delay after each failure (1.0 = fixed)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Maximum delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Config {
    /// Configuration pointing at `base_url` with every other field defaulted.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            remote: RemoteConfig {
                base_url: base_url.into(),
                request_timeout_secs: default_request_timeout(),
                api_token: None,
            },
            input: InputConfig::default(),
            processing: ProcessingConfig::default(),
            output: OutputConfig::default(),
        }
    }

    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.remote.base_url.trim().is_empty() {
            anyhow::bail!("remote.base_url must be set");
        }
        let base_url = &self.remote.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            anyhow::bail!("remote.base_url must be an http(s) URL");
        }
        if self.remote.request_timeout_secs == 0 {
            anyhow::bail!("Request timeout must be > 0");
        }
        if self.input.key_field.is_empty() {
            anyhow::bail!("input.key_field must not be empty");
        }
        if self.processing.chunk_size == Some(0) {
            anyhow::bail!("Chunk size must be > 0");
        }
        if self.processing.concurrency == Some(0) {
            anyhow::bail!("Concurrency must be > 0");
        }
        if self.processing.retry.max_attempts == 0 {
            anyhow::bail!("Retry attempts must be > 0");
        }
        let backoff = self.processing.retry.backoff_multiplier;
        if !backoff.is_finite() || backoff < 1.0 {
            anyhow::bail!("Backoff multiplier must be a finite number >= 1.0");
        }
        if self.processing.poll_interval_ms == 0 {
            anyhow::bail!("Poll interval must be > 0");
        }
        if self.processing.task_timeout_secs == Some(0) {
            anyhow::bail!("Task timeout must be > 0 when set");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_request_timeout() -> u64 { 30 }
fn default_key_field() -> String { "serial".to_string() }
fn default_pause_between_chunks_ms() -> u64 { 100 }
fn default_poll_interval_ms() -> u64 { 2000 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_max_attempts() -> u32 { 3 }
fn default_delay_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_delay_ms() -> u64 { 10_000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let config = Config::from_yaml("remote:\n  base_url: http://localhost:8080\n").unwrap();

        assert_eq!(config.remote.request_timeout_secs, 30);
        assert_eq!(config.input.key_field, "serial");
        assert_eq!(config.processing.chunk_size, None);
        assert_eq!(config.processing.retry.max_attempts, 3);
        assert_eq!(config.processing.retry.delay_ms, 1000);
        assert_eq!(config.processing.pause_between_chunks_ms, 100);
        assert_eq!(config.processing.poll_interval_ms, 2000);
        assert!(config.processing.enable_metrics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_config() {
        let json = r#"{
            "remote": {"base_url": "https://sync.example.com/api", "api_token": "t"},
            "processing": {"chunk_size": 100, "concurrency": 3, "retry": {"max_attempts": 5}}
        }"#;
        let config = Config::from_json(json).unwrap();

        assert_eq!(config.processing.chunk_size, Some(100));
        assert_eq!(config.processing.concurrency, Some(3));
        assert_eq!(config.processing.retry.max_attempts, 5);
        assert_eq!(config.processing.retry.backoff_multiplier, 2.0);
        assert_eq!(config.remote.api_token.as_deref(), Some("t"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::with_base_url("http://localhost:1234");
        config.processing.task_timeout_secs = Some(600);

        let yaml = config.to_yaml().unwrap();
        let back = Config::from_yaml(&yaml).unwrap();
        assert_eq!(back.processing.task_timeout_secs, Some(600));
        assert_eq!(back.remote.base_url, "http://localhost:1234");
    }

    #[test]
    fn test_config_validation_invalid() {
        let mut config = Config::with_base_url("http://localhost");
        config.processing.concurrency = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::with_base_url("http://localhost");
        config.processing.chunk_size = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::with_base_url("http://localhost");
        config.processing.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::with_base_url("http://localhost");
        config.processing.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::with_base_url("http://localhost");
        config.processing.retry.backoff_multiplier = f64::NAN;
        assert!(config.validate().is_err());

        assert!(Config::with_base_url("").validate().is_err());
        assert!(Config::with_base_url("ftp://host").validate().is_err());
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{"remote": {"base_url": "http://h"}}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.remote.base_url, "http://h");
    }
}
