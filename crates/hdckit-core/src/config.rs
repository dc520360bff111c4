//! Persistent configuration for hdckit.
//!
//! Stores user settings in `~/.hdckit/config.json`. A missing file yields the
//! defaults; a file that exists but does not parse is an error.
//!
//! # Example
//!
//! ```no_run
//! use hdckit_core::config::BridgeConfig;
//!
//! let config = BridgeConfig::load()?;
//! let connection = config.connection_config();
//! println!("HDC daemon at {}:{}", connection.host, connection.port);
//! # Ok::<(), hdckit_core::config::ConfigError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent_lifecycle::{AgentLifecycleConfig, DEFAULT_AGENT_REMOTE_PATH};
use crate::driver::DriverConfig;
use crate::kit::KIT_DEVICE_PORT;
use crate::pool::{ConnectionConfig, DEFAULT_HDC_PORT};

const CONFIG_FILENAME: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    NoHomeDir,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Returns `~/.hdckit`, creating it if needed.
pub fn hdckit_dir() -> Result<PathBuf, ConfigError> {
    let dir = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?.join(".hdckit");
    std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Io {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

/// Persistent hdckit configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub hdc_host: String,
    pub hdc_port: u16,
    /// Connections the pool dials up front.
    pub pool_capacity: usize,
    pub connect_timeout_ms: u64,
    pub kit_device_port: u16,
    pub kit_request_timeout_ms: u64,
    /// Local agent library pushed to the device when it is missing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_blob: Option<PathBuf>,
    pub agent_remote_path: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            hdc_host: "127.0.0.1".to_string(),
            hdc_port: DEFAULT_HDC_PORT,
            pool_capacity: 2,
            connect_timeout_ms: 5000,
            kit_device_port: KIT_DEVICE_PORT,
            kit_request_timeout_ms: 5000,
            agent_blob: None,
            agent_remote_path: DEFAULT_AGENT_REMOTE_PATH.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Default location, `~/.hdckit/config.json`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(hdckit_dir()?.join(CONFIG_FILENAME))
    }

    /// Load from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load from `path`. Returns [`Default`] if the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save to `path` as pretty-printed JSON.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(io_err)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.hdc_host.clone(),
            port: self.hdc_port,
            capacity: self.pool_capacity,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..Default::default()
        }
    }

    /// Driver settings. The agent is started on connect only when a blob is
    /// configured.
    pub fn driver_config(&self) -> DriverConfig {
        let lifecycle = self.agent_blob.as_ref().map(|blob| AgentLifecycleConfig {
            agent_blob: Some(blob.clone()),
            remote_path: self.agent_remote_path.clone(),
            ..Default::default()
        });
        DriverConfig {
            kit_device_port: self.kit_device_port,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.kit_request_timeout_ms),
            lifecycle,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hdckit-config-{}-{name}.json", std::process::id()))
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.hdc_host, "127.0.0.1");
        assert_eq!(config.hdc_port, 8710);
        assert_eq!(config.pool_capacity, 2);
        assert_eq!(config.kit_device_port, 8012);
        assert!(config.agent_blob.is_none());
        assert_eq!(config.agent_remote_path, "/data/local/tmp/agent.so");
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: BridgeConfig = serde_json::from_str(r#"{"hdc_port": 9000}"#).unwrap();
        assert_eq!(config.hdc_port, 9000);
        assert_eq!(config.hdc_host, "127.0.0.1");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = BridgeConfig::load_from(&temp_path("missing")).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = temp_path("malformed");
        std::fs::write(&path, "{ not json").unwrap();
        let result = BridgeConfig::load_from(&path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn save_then_load() {
        let path = temp_path("saved");
        let config = BridgeConfig {
            hdc_host: "10.0.0.2".into(),
            agent_blob: Some(PathBuf::from("/opt/agent.so")),
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(BridgeConfig::load_from(&path).unwrap(), config);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn converts_into_component_configs() {
        let config = BridgeConfig {
            hdc_port: 9000,
            connect_timeout_ms: 1500,
            kit_request_timeout_ms: 7000,
            ..Default::default()
        };
        let connection = config.connection_config();
        assert_eq!(connection.port, 9000);
        assert_eq!(connection.connect_timeout, Duration::from_millis(1500));

        let driver = config.driver_config();
        assert_eq!(driver.request_timeout, Duration::from_millis(7000));
        assert!(driver.lifecycle.is_none());
    }

    #[test]
    fn blob_enables_lifecycle() {
        let config = BridgeConfig {
            agent_blob: Some(PathBuf::from("/opt/agent.so")),
            ..Default::default()
        };
        let lifecycle = config.driver_config().lifecycle.unwrap();
        assert_eq!(lifecycle.agent_blob, Some(PathBuf::from("/opt/agent.so")));
    }
}
