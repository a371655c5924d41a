//! Configuration loading and persistence for both binaries.
//!
//! Config is a thin JSON file under the platform config directory, overlaid
//! with environment variable overrides and then CLI flags (applied by each
//! binary's `main`). Authentication material is out of scope (§1) so there
//! is nothing sensitive here to keep out of the serialized form.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Application directory name under the platform config root.
pub const APP_NAME: &str = "overlord";

/// Returns the configuration directory, creating it if necessary.
///
/// Directory selection priority:
/// 1. `OVERLORD_CONFIG_DIR` env var — explicit override, used by tests and
///    by operators who want config alongside the binary.
/// 2. `OVERLORD_ENV=test` — a `tmp/overlord-test` directory under the crate
///    root, so unit/integration tests never touch the real platform config
///    dir.
/// 3. Platform-standard config dir (`dirs::config_dir()`).
pub fn config_dir() -> Result<PathBuf> {
    let dir = if let Ok(over) = std::env::var("OVERLORD_CONFIG_DIR") {
        PathBuf::from(over)
    } else if crate::env::is_test_mode() {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/overlord-test")
    } else {
        dirs::config_dir()
            .context("could not determine platform config directory")?
            .join(APP_NAME)
    };
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Agent-side configuration (§4.3 start sequence, step 1 and step 3).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AgentConfig {
    /// Explicit coordinator address, if the operator supplied one. Tried
    /// before any discovered candidate.
    #[serde(default)]
    pub coordinator_addr: Option<String>,
    /// TLS negotiation mode for each candidate address.
    #[serde(default)]
    pub tls_mode: TlsMode,
    /// Whether to run the LAN discovery listener (C8) alongside the connect
    /// loop. Disabled automatically while a Control session is registered.
    #[serde(default = "default_true")]
    pub discovery_enabled: bool,
    /// Path to the free-form JSON properties file sent at registration.
    #[serde(default)]
    pub properties_path: Option<PathBuf>,
    /// `u/<user>` / `g/<group>` / `anyone` entries carried as opaque
    /// strings in `properties["allowlist"]` at registration (§4.2). The
    /// agent does not interpret these; the coordinator is the enforcement
    /// point.
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Local IPC server bind address (loopback only).
    #[serde(default = "default_ipc_addr")]
    pub ipc_addr: String,
}

fn default_true() -> bool {
    true
}

fn default_ipc_addr() -> String {
    "127.0.0.1:7874".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            coordinator_addr: None,
            tls_mode: TlsMode::Detect,
            discovery_enabled: true,
            properties_path: None,
            allowlist: Vec::new(),
            ipc_addr: default_ipc_addr(),
        }
    }
}

/// How an agent decides whether a candidate coordinator address speaks TLS.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Probe the candidate and use TLS if the handshake succeeds.
    #[default]
    Detect,
    /// Always use TLS; never fall back to plaintext.
    ForceEnable,
    /// Never use TLS.
    ForceDisable,
}

impl AgentConfig {
    /// Load from `{config_dir}/agent.json`, falling back to defaults if the
    /// file is absent or unreadable.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = config_dir()?.join("agent.json");
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("OVERLORD_COORDINATOR_ADDR") {
            self.coordinator_addr = Some(addr);
        }
        if let Ok(path) = std::env::var("OVERLORD_PROPERTIES_PATH") {
            self.properties_path = Some(PathBuf::from(path));
        }
        if let Ok(list) = std::env::var("OVERLORD_ALLOWLIST") {
            self.allowlist = list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
        }
    }

    /// Loads the free-form properties object sent at registration, augmented
    /// with the `allowlist` the coordinator uses for access control (§4.2
    /// registration payload). Falls back to an empty object if no
    /// properties path is configured or the file can't be read/parsed.
    pub fn load_properties(&self) -> serde_json::Value {
        let mut properties = self.load_properties_file();
        if let Some(obj) = properties.as_object_mut() {
            obj.insert("allowlist".to_string(), serde_json::Value::from(self.allowlist.clone()));
        }
        properties
    }

    fn load_properties_file(&self) -> serde_json::Value {
        let Some(path) = &self.properties_path else {
            return serde_json::json!({});
        };
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                log::warn!("properties file {path:?} is not valid JSON: {e}");
                serde_json::json!({})
            }),
            Err(e) => {
                log::warn!("could not read properties file {path:?}: {e}");
                serde_json::json!({})
            }
        }
    }

    /// Persist to `{config_dir}/agent.json`.
    pub fn save(&self) -> Result<()> {
        let path = config_dir()?.join("agent.json");
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Coordinator-side configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CoordinatorConfig {
    /// Address the agent TCP listener binds to (C4).
    #[serde(default = "default_agent_listen")]
    pub agent_listen_addr: String,
    /// Address the HTTP/WebSocket browser bridge (C6) binds to.
    #[serde(default = "default_http_listen")]
    pub http_listen_addr: String,
    /// Network interface broadcast address used for LAN discovery (C8).
    /// `None` disables the discovery broadcaster.
    #[serde(default)]
    pub discovery_broadcast_addr: Option<String>,
}

fn default_agent_listen() -> String {
    format!("0.0.0.0:{}", crate::constants::DEFAULT_AGENT_PORT)
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            agent_listen_addr: default_agent_listen(),
            http_listen_addr: default_http_listen(),
            discovery_broadcast_addr: None,
        }
    }
}

impl CoordinatorConfig {
    /// Load from `{config_dir}/coordinator.json`, falling back to defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = config_dir()?.join("coordinator.json");
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("OVERLORD_AGENT_LISTEN_ADDR") {
            self.agent_listen_addr = addr;
        }
        if let Ok(addr) = std::env::var("OVERLORD_HTTP_LISTEN_ADDR") {
            self.http_listen_addr = addr;
        }
    }

    /// Persist to `{config_dir}/coordinator.json`.
    pub fn save(&self) -> Result<()> {
        let path = config_dir()?.join("coordinator.json");
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_default_has_detect_tls() {
        let config = AgentConfig::default();
        assert_eq!(config.tls_mode, TlsMode::Detect);
        assert!(config.discovery_enabled);
    }

    #[test]
    fn agent_properties_carries_empty_allowlist_when_unset() {
        let config = AgentConfig::default();
        assert_eq!(config.load_properties(), serde_json::json!({"allowlist": []}));
    }

    #[test]
    fn agent_properties_allowlist_augments_loaded_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("properties.json");
        fs::write(&path, r#"{"role": "worker"}"#).unwrap();
        let mut config = AgentConfig::default();
        config.properties_path = Some(path);
        config.allowlist = vec!["u/alice".to_string(), "g/ops".to_string()];
        let props = config.load_properties();
        assert_eq!(props["role"], "worker");
        assert_eq!(props["allowlist"], serde_json::json!(["u/alice", "g/ops"]));
    }

    #[test]
    fn coordinator_config_default_ports() {
        let config = CoordinatorConfig::default();
        assert!(config.agent_listen_addr.ends_with("4343"));
        assert!(config.discovery_broadcast_addr.is_none());
    }
}
