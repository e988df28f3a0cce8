//! Server configuration, loadable from TOML.
//!
//! ```toml
//! [server]
//! bind_addr = "127.0.0.1:3000"
//! broadcast_capacity = 256
//! max_steps_per_update = 1000
//! busy_policy = "queue"        # or "reject"
//! queue_capacity = 64
//!
//! [engine]
//! max_stored_steps = 1000
//! lease_timeout_ms = 5000
//!
//! [storage]
//! path = "data/stepsync"       # omit for in-memory
//! sync_writes = false
//! ```
//!
//! Every field has a default; missing sections use them.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::{RocksConfig, DEFAULT_MAX_STORED_STEPS};

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

/// What a submission does when the engine is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Report `Busy` to the submitter as a retryable error
    Reject,
    /// Wait in a bounded FIFO; `Busy` only when the queue is full
    Queue,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Listen address (default: 127.0.0.1:3000).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Frames buffered per session before it lags (default: 256).
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Largest accepted `steps` array (default: 1000).
    #[serde(default = "default_max_steps_per_update")]
    pub max_steps_per_update: usize,
    #[serde(default = "default_busy_policy")]
    pub busy_policy: BusyPolicy,
    /// Pending submissions under `BusyPolicy::Queue` (default: 64).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Step log retention N (default: 1000).
    #[serde(default = "default_max_stored_steps")]
    pub max_stored_steps: usize,
    /// Guard lease expiry (default: 5000).
    #[serde(default = "default_lease_timeout_ms")]
    pub lease_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSettings {
    /// RocksDB directory; `None` keeps everything in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// fsync every commit (default: false).
    #[serde(default)]
    pub sync_writes: bool,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_max_steps_per_update() -> usize {
    1000
}

fn default_busy_policy() -> BusyPolicy {
    BusyPolicy::Reject
}

fn default_queue_capacity() -> usize {
    64
}

fn default_max_stored_steps() -> usize {
    DEFAULT_MAX_STORED_STEPS
}

fn default_lease_timeout_ms() -> u64 {
    5000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            broadcast_capacity: default_broadcast_capacity(),
            max_steps_per_update: default_max_steps_per_update(),
            busy_policy: default_busy_policy(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_stored_steps: default_max_stored_steps(),
            lease_timeout_ms: default_lease_timeout_ms(),
        }
    }
}

impl EngineSettings {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }
}

impl StorageSettings {
    /// RocksDB settings, if a path is configured.
    pub fn rocks_config(&self) -> Option<RocksConfig> {
        self.path.as_ref().map(|path| RocksConfig {
            sync_writes: self.sync_writes,
            ..RocksConfig::new(path)
        })
    }
}

impl SyncConfig {
    /// In-memory config on an ephemeral port.
    pub fn for_testing() -> Self {
        Self {
            server: ServerSettings {
                bind_addr: "127.0.0.1:0".to_string(),
                broadcast_capacity: 64,
                max_steps_per_update: 100,
                ..ServerSettings::default()
            },
            engine: EngineSettings {
                max_stored_steps: 100,
                lease_timeout_ms: 2000,
            },
            storage: StorageSettings::default(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: None,
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_stored_steps == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_stored_steps must be at least 1".into(),
            ));
        }
        if self.engine.lease_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "engine.lease_timeout_ms must be at least 1".into(),
            ));
        }
        if self.server.max_steps_per_update == 0 {
            return Err(ConfigError::Invalid(
                "server.max_steps_per_update must be at least 1".into(),
            ));
        }
        // A committed batch must fit in the log so it can be broadcast whole
        if self.server.max_steps_per_update > self.engine.max_stored_steps {
            return Err(ConfigError::Invalid(format!(
                "server.max_steps_per_update ({}) exceeds engine.max_stored_steps ({})",
                self.server.max_steps_per_update, self.engine.max_stored_steps
            )));
        }
        if self.server.busy_policy == BusyPolicy::Queue && self.server.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "server.queue_capacity must be at least 1 with busy_policy = \"queue\"".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {message}")]
    Parse {
        path: Option<PathBuf>,
        message: String,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.server.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.server.broadcast_capacity, 256);
        assert_eq!(config.server.busy_policy, BusyPolicy::Reject);
        assert_eq!(config.engine.max_stored_steps, 1000);
        assert_eq!(config.engine.lease_timeout(), Duration::from_secs(5));
        assert!(config.storage.path.is_none());
        assert!(config.storage.rocks_config().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(SyncConfig::from_toml_str("").unwrap(), SyncConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = SyncConfig::from_toml_str(
            r#"
            [server]
            bind_addr = "0.0.0.0:8080"
            busy_policy = "queue"
            max_steps_per_update = 50

            [storage]
            path = "/var/lib/stepsync"
            sync_writes = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.server.busy_policy, BusyPolicy::Queue);
        assert_eq!(config.server.queue_capacity, 64);
        assert_eq!(config.engine, EngineSettings::default());

        let rocks = config.storage.rocks_config().unwrap();
        assert_eq!(rocks.path, PathBuf::from("/var/lib/stepsync"));
        assert!(rocks.sync_writes);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SyncConfig::from_toml_str("[engine]\nmax_stored_steps = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = SyncConfig::from_toml_str(
            "[server]\nmax_steps_per_update = 20\n[engine]\nmax_stored_steps = 10",
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds"));

        // A zero lease would expire as soon as it is granted
        let err = SyncConfig::from_toml_str("[engine]\nlease_timeout_ms = 0").unwrap_err();
        assert!(err.to_string().contains("lease_timeout_ms"));

        let err = SyncConfig::from_toml_str("[server]\nbusy_policy = \"drop\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        let err = SyncConfig::from_toml_str("[server]\nport = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stepsync.toml");
        std::fs::write(&path, "[engine]\nlease_timeout_ms = 250\n").unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.engine.lease_timeout(), Duration::from_millis(250));

        let err = SyncConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_for_testing_is_valid() {
        let config = SyncConfig::for_testing();
        assert!(config.validate().is_ok());
        assert!(config.server.bind_addr.ends_with(":0"));
    }
}
