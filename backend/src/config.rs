//! Configuration file model.
//!
//! The proxy is configured from a single JSON document with three top-level
//! sections: `BACKENDS` (upstream databases), `KEYMAPS` (measurement to
//! backend-set routing) and `NODE` (the proxy process itself). A value of
//! zero or an absent key selects the documented default.

use serde::Deserialize;
use std::{collections::HashMap, path::Path};
use thiserror::Error;

/// Errors produced while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("backends cannot be empty")]
    NoBackends,

    #[error("keymaps cannot be empty")]
    NoKeymaps,

    #[error("keymap {key:?} references unknown backend {backend:?}")]
    UnknownBackend { key: String, backend: String },
}

/// One upstream time-series database.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the backend, e.g. `http://influxdb-1:8086`.
    pub url: String,
    /// Target database on the backend.
    pub db: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Points buffered before a flush is forced.
    #[serde(default)]
    pub flush_size: usize,
    /// Milliseconds a partial batch may linger before being flushed.
    #[serde(default)]
    pub flush_time: u64,
    /// Write timeout in milliseconds.
    #[serde(default)]
    pub timeout: u64,
    /// Health probe interval in milliseconds.
    #[serde(default)]
    pub check_interval: u64,
    /// Spill rewrite interval in milliseconds.
    #[serde(default)]
    pub rewrite_interval: u64,
    /// Concurrent in-flight flushes.
    #[serde(default)]
    pub conn_pool_size: usize,
    /// Excluded from reads when set.
    #[serde(default)]
    pub write_only: bool,
}

impl BackendConfig {
    /// Replaces zero values with the documented defaults.
    fn normalize(&mut self) {
        if self.flush_size == 0 {
            self.flush_size = 10_000;
        }
        if self.flush_time == 0 {
            self.flush_time = 1_000;
        }
        if self.timeout == 0 {
            self.timeout = 10_000;
        }
        if self.check_interval == 0 {
            self.check_interval = 1_000;
        }
        if self.rewrite_interval == 0 {
            self.rewrite_interval = 10_000;
        }
        if self.conn_pool_size == 0 {
            self.conn_pool_size = 20;
        }
    }
}

/// The proxy process itself.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    /// Listen address, default `:7076`.
    #[serde(default)]
    pub listen_addr: String,
    /// When set, clients must address exactly this database.
    #[serde(default)]
    pub db: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Directory holding the per-backend `.dat`/`.rec` spill files.
    #[serde(default)]
    pub data_dir: String,
    /// Log file path, empty for stdout.
    #[serde(default)]
    pub log_path: String,
    /// Keep-alive idle timeout in milliseconds.
    #[serde(default)]
    pub idle_timeout: u64,
    /// Statistics collection interval in milliseconds.
    #[serde(default)]
    pub stat_interval: u64,
    #[serde(default)]
    pub write_tracing: bool,
    #[serde(default)]
    pub query_tracing: bool,
    #[serde(default)]
    pub https_enabled: bool,
    #[serde(default)]
    pub https_cert: String,
    #[serde(default)]
    pub https_key: String,
}

impl NodeConfig {
    fn normalize(&mut self) {
        if self.listen_addr.is_empty() {
            self.listen_addr = ":7076".to_owned();
        }
        if self.data_dir.is_empty() {
            self.data_dir = "data".to_owned();
        }
        if self.idle_timeout == 0 {
            self.idle_timeout = 10_000;
        }
        if self.stat_interval == 0 {
            self.stat_interval = 10_000;
        }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "BACKENDS")]
    pub backends: HashMap<String, BackendConfig>,
    #[serde(rename = "KEYMAPS")]
    pub keymaps: HashMap<String, Vec<String>>,
    #[serde(rename = "NODE", default)]
    pub node: NodeConfig,
}

impl ProxyConfig {
    /// Loads and validates the configuration from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parses and validates a configuration document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_str(raw)?;
        config.normalize()?;
        Ok(config)
    }

    fn normalize(&mut self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        if self.keymaps.is_empty() {
            return Err(ConfigError::NoKeymaps);
        }
        for (key, names) in &self.keymaps {
            for name in names {
                if !self.backends.contains_key(name) {
                    return Err(ConfigError::UnknownBackend {
                        key: key.clone(),
                        backend: name.clone(),
                    });
                }
            }
        }
        for backend in self.backends.values_mut() {
            backend.normalize();
        }
        self.node.normalize();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const MINIMAL: &str = r#"{
        "BACKENDS": {
            "local": {"url": "http://localhost:8086", "db": "test"}
        },
        "KEYMAPS": {
            "cpu": ["local"],
            "_default_": ["local"]
        }
    }"#;

    #[test]
    fn defaults_are_applied() {
        let config = ProxyConfig::from_json(MINIMAL).unwrap();
        let backend = &config.backends["local"];
        assert_eq!(backend.flush_size, 10_000);
        assert_eq!(backend.flush_time, 1_000);
        assert_eq!(backend.timeout, 10_000);
        assert_eq!(backend.check_interval, 1_000);
        assert_eq!(backend.rewrite_interval, 10_000);
        assert_eq!(backend.conn_pool_size, 20);
        assert!(!backend.write_only);

        assert_eq!(config.node.listen_addr, ":7076");
        assert_eq!(config.node.data_dir, "data");
        assert_eq!(config.node.idle_timeout, 10_000);
        assert_eq!(config.node.stat_interval, 10_000);
    }

    #[test]
    fn explicit_values_survive() {
        let raw = r#"{
            "BACKENDS": {
                "local": {
                    "url": "https://remote:8086", "db": "test",
                    "username": "u", "password": "p",
                    "flush_size": 50, "flush_time": 200, "write_only": true
                }
            },
            "KEYMAPS": {"_default_": ["local"]},
            "NODE": {"listen_addr": ":9096", "db": "only", "stat_interval": 500}
        }"#;
        let config = ProxyConfig::from_json(raw).unwrap();
        let backend = &config.backends["local"];
        assert_eq!(backend.flush_size, 50);
        assert_eq!(backend.flush_time, 200);
        assert!(backend.write_only);
        assert_eq!(config.node.listen_addr, ":9096");
        assert_eq!(config.node.db, "only");
        assert_eq!(config.node.stat_interval, 500);
    }

    #[test]
    fn rejects_incomplete_configs() {
        assert_matches!(
            ProxyConfig::from_json(r#"{"BACKENDS": {}, "KEYMAPS": {"a": []}}"#),
            Err(ConfigError::NoBackends)
        );
        assert_matches!(
            ProxyConfig::from_json(
                r#"{"BACKENDS": {"b": {"url": "http://x", "db": "d"}}, "KEYMAPS": {}}"#
            ),
            Err(ConfigError::NoKeymaps)
        );
        assert_matches!(
            ProxyConfig::from_json(
                r#"{"BACKENDS": {"b": {"url": "http://x", "db": "d"}},
                    "KEYMAPS": {"cpu": ["nope"]}}"#
            ),
            Err(ConfigError::UnknownBackend { .. })
        );
    }
}
