//! Engine configuration
//!
//! Serde-deserializable configuration with defaults suitable for a
//! single-node development deployment. Production deployments load a TOML
//! file via [`EngineConfig::load`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Listener and filesystem settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Address the web listener binds to.
    pub listen_addr: SocketAddr,
    /// Name of this node inside the cluster.
    pub node: String,
    /// Root of the static web assets (`<www_root>/agent`, `<www_root>/contrib`).
    pub www_root: PathBuf,
    /// Root served under `/dynamic/`.
    pub dynamic_root: PathBuf,
    /// RSA private key in PEM form, loaded at startup.
    pub key_path: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5050".parse().expect("static addr"),
            node: "cpx1".to_string(),
            www_root: PathBuf::from("www"),
            dynamic_root: PathBuf::from("www/dynamic"),
            key_path: PathBuf::from("key"),
        }
    }
}

/// Session and long-poll timing.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Seconds without `keep_alive` before a connection worker terminates.
    pub idle_timeout_secs: u64,
    /// Bounded wait for `poll` before the handler replies 408.
    pub poll_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 120,
            poll_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:cpx.db?mode=rwc".to_string(),
        }
    }
}

/// Queue manager settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Weight applied to queues created without an explicit one.
    pub default_weight: i64,
    /// Priority applied to calls enqueued without an explicit one.
    pub default_priority: i64,
    /// Synchronous leader RPCs fail after this long.
    pub rpc_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_weight: 1,
            default_priority: 10,
            rpc_timeout_ms: 2000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            session: SessionConfig::default(),
            database: DatabaseConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("cannot parse {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.session.idle_timeout_secs > 0);
        assert!(config.queue.default_weight >= 1);
        assert_eq!(config.general.www_root, PathBuf::from("www"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [session]
            idle_timeout_secs = 5
            poll_timeout_secs = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.session.idle_timeout_secs, 5);
        assert_eq!(config.queue.default_weight, 1);
    }
}
