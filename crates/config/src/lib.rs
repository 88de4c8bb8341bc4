//! Configuration schema and loader for cellstore servers.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address for batch requests.
    pub listen: SocketAddr,

    /// Content store settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Lock manager settings.
    #[serde(default)]
    pub locks: LockConfig,

    /// Co-authoring settings.
    #[serde(default)]
    pub coauth: CoauthConfig,

    /// Cell (put/query changes) settings.
    #[serde(default)]
    pub cell: CellConfig,

    /// Largest batch request body accepted over HTTP, in bytes.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the content store WAL.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Fsync policy: "always", "batch", "none".
    #[serde(default = "default_fsync")]
    pub fsync: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fsync: default_fsync(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Timeout applied when a lock request carries none.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Upper bound every requested timeout is clamped to.
    #[serde(default = "default_timeout_secs")]
    pub max_timeout_secs: u64,

    /// Whether the document library requires checkout before locking.
    #[serde(default)]
    pub checkout_required: bool,

    /// Interval of the expiry/reclaim reaper in seconds; 0 disables it.
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_timeout_secs(),
            checkout_required: false,
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoauthConfig {
    /// Whether co-authoring (shared locks) is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of clients in one session; 0 means unlimited.
    #[serde(default)]
    pub max_coauthors: usize,
}

impl Default for CoauthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_coauthors: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellConfig {
    /// Size cap of one QueryChanges page in bytes.
    #[serde(default = "default_query_page_bytes")]
    pub query_page_bytes: u64,

    /// Chunk size used when storing whole-file uploads.
    #[serde(default = "default_upload_chunk_bytes")]
    pub upload_chunk_bytes: usize,

    /// Number of superseded storage indexes kept for coherency checks.
    #[serde(default = "default_retained_index_versions")]
    pub retained_index_versions: usize,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            query_page_bytes: default_query_page_bytes(),
            upload_chunk_bytes: default_upload_chunk_bytes(),
            retained_index_versions: default_retained_index_versions(),
        }
    }
}

// --- Defaults ---

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_fsync() -> String {
    "batch".to_string()
}
fn default_timeout_secs() -> u64 {
    3600
}
fn default_reaper_interval_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_query_page_bytes() -> u64 {
    1024 * 1024
}
fn default_upload_chunk_bytes() -> usize {
    64 * 1024
}
fn default_retained_index_versions() -> usize {
    16
}
fn default_max_request_bytes() -> usize {
    64 * 1024 * 1024
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ServerConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.storage.fsync.as_str(), "always" | "batch" | "none") {
            return Err(ConfigError::Invalid(format!(
                "storage.fsync must be one of always|batch|none, got {:?}",
                self.storage.fsync
            )));
        }
        if self.locks.max_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "locks.max_timeout_secs must be > 0".into(),
            ));
        }
        if self.locks.default_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "locks.default_timeout_secs must be > 0".into(),
            ));
        }
        if self.locks.default_timeout_secs > self.locks.max_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "locks.default_timeout_secs ({}) must be <= locks.max_timeout_secs ({})",
                self.locks.default_timeout_secs, self.locks.max_timeout_secs
            )));
        }
        if self.max_request_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_request_bytes must be > 0".into(),
            ));
        }
        if self.cell.query_page_bytes == 0 {
            return Err(ConfigError::Invalid(
                "cell.query_page_bytes must be > 0".into(),
            ));
        }
        if self.cell.upload_chunk_bytes == 0 {
            return Err(ConfigError::Invalid(
                "cell.upload_chunk_bytes must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Load a `ServerConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<ServerConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `ServerConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<ServerConfig, ConfigError> {
    let config: ServerConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
listen: "127.0.0.1:7000"
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.listen.port(), 7000);
        assert_eq!(config.locks.default_timeout_secs, 3600);
        assert!(config.coauth.enabled);
        assert_eq!(config.coauth.max_coauthors, 0);
        assert_eq!(config.storage.fsync, "batch");
        assert_eq!(config.cell.query_page_bytes, 1024 * 1024);
        assert!(config.metrics_port.is_none());
        assert_eq!(config.max_request_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
listen: "0.0.0.0:8000"
metrics_port: 9100
max_request_bytes: 1048576
storage:
  data_dir: /tmp/cellstore-test
  fsync: always
locks:
  default_timeout_secs: 60
  max_timeout_secs: 600
  checkout_required: true
  reaper_interval_secs: 0
coauth:
  enabled: false
  max_coauthors: 2
cell:
  query_page_bytes: 4096
  upload_chunk_bytes: 512
  retained_index_versions: 4
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.storage.fsync, "always");
        assert_eq!(config.locks.max_timeout_secs, 600);
        assert!(config.locks.checkout_required);
        assert!(!config.coauth.enabled);
        assert_eq!(config.coauth.max_coauthors, 2);
        assert_eq!(config.cell.upload_chunk_bytes, 512);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.max_request_bytes, 1024 * 1024);
    }

    #[test]
    fn test_roundtrip_yaml() {
        let config = load_from_str("listen: \"127.0.0.1:9000\"\n").unwrap();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let config2 = load_from_str(&serialized).unwrap();
        assert_eq!(config.listen, config2.listen);
        assert_eq!(
            config.locks.max_timeout_secs,
            config2.locks.max_timeout_secs
        );
    }

    #[test]
    fn test_rejects_default_above_max_timeout() {
        let yaml = r#"
listen: "127.0.0.1:7000"
locks:
  default_timeout_secs: 7200
  max_timeout_secs: 3600
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(
            err.contains("locks.default_timeout_secs"),
            "error should mention locks.default_timeout_secs: {}",
            err
        );
    }

    #[test]
    fn test_rejects_unknown_fsync() {
        let yaml = r#"
listen: "127.0.0.1:7000"
storage:
  fsync: sometimes
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("storage.fsync"), "{}", err);
    }

    #[test]
    fn test_rejects_zero_page_size() {
        let yaml = r#"
listen: "127.0.0.1:7000"
cell:
  query_page_bytes: 0
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("cell.query_page_bytes"), "{}", err);
    }
}
