//! Bridge configuration – reads `~/.roverlink/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use roverlink_runtime::BridgeConfig;
use roverlink_runtime::bridge::{DEFAULT_ROVER_IDENTIFIER, DEFAULT_SERVER_URL};

/// Longest interval or timeout accepted from the file or the environment.
const MAX_DURATION_SECS: u64 = 24 * 60 * 60;

/// Persisted bridge configuration.  Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Coordination server WebSocket URL.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Identifier announced in the `CONNECT` handshake.
    #[serde(default = "default_rover_id")]
    pub rover_id: String,

    /// rosbridge server (e.g. `ws://localhost:9090`).  Without it the bridge
    /// runs on an in-process loopback bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rosbridge_url: Option<String>,

    #[serde(default = "default_interval_secs")]
    pub reconnect_interval_secs: u64,

    #[serde(default = "default_interval_secs")]
    pub telemetry_interval_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}
fn default_rover_id() -> String {
    DEFAULT_ROVER_IDENTIFIER.to_string()
}
fn default_interval_secs() -> u64 {
    5
}
fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            rover_id: default_rover_id(),
            rosbridge_url: None,
            reconnect_interval_secs: default_interval_secs(),
            telemetry_interval_secs: default_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Config {
    /// Runtime settings.  Durations are clamped to one second through one
    /// day.
    pub fn to_bridge_config(&self) -> BridgeConfig {
        let secs = |n: u64| Duration::from_secs(n.clamp(1, MAX_DURATION_SECS));
        BridgeConfig {
            reconnect_interval: secs(self.reconnect_interval_secs),
            telemetry_interval: secs(self.telemetry_interval_secs),
            connect_timeout: secs(self.connect_timeout_secs),
            ..BridgeConfig::new(self.server_url.clone(), self.rover_id.clone())
        }
    }
}

/// `$ROVERLINK_CONFIG`, or `~/.roverlink/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("ROVERLINK_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".roverlink").join("config.toml")
}

/// Load the config file (defaults when absent), then apply environment
/// overrides.
pub fn load() -> Result<Config, String> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Parse the file at `path`.  `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SERVER_URL` | `server_url` |
/// | `ROVER_ID` | `rover_id` |
/// | `ROVERLINK_ROSBRIDGE_URL` | `rosbridge_url` |
/// | `ROVERLINK_RECONNECT_SECS` | `reconnect_interval_secs` |
/// | `ROVERLINK_TELEMETRY_SECS` | `telemetry_interval_secs` |
///
/// Numeric values that do not parse as a positive integer are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SERVER_URL") {
        cfg.server_url = v;
    }
    if let Some(v) = lookup("ROVER_ID") {
        cfg.rover_id = v;
    }
    if let Some(v) = lookup("ROVERLINK_ROSBRIDGE_URL") {
        cfg.rosbridge_url = Some(v).filter(|url| !url.trim().is_empty());
    }
    let secs = |key: &str| {
        lookup(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|&n| n > 0)
    };
    if let Some(n) = secs("ROVERLINK_RECONNECT_SECS") {
        cfg.reconnect_interval_secs = n;
    }
    if let Some(n) = secs("ROVERLINK_TELEMETRY_SECS") {
        cfg.telemetry_interval_secs = n;
    }
}
