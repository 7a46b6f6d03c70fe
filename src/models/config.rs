use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default = "default_cooldown_ms")]
    pub default_cooldown_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_oauth_callback_port")]
    pub oauth_callback_port: u16,
    #[serde(default)]
    pub backends: BackendsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendsConfig {
    #[serde(default)]
    pub cloudcode: BackendConfig,
    #[serde(default)]
    pub codex: BackendConfig,
    #[serde(default)]
    pub copilot: BackendConfig,
    #[serde(default)]
    pub cursor: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendConfig {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub oauth_client_id: Option<String>,
    #[serde(default)]
    pub oauth_scope: Option<String>,
}

fn default_port() -> u16 {
    8899
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_cooldown_ms() -> u64 {
    60_000
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_state_dir() -> PathBuf {
    dirs_home().join(".switchyard")
}

fn default_oauth_callback_port() -> u16 {
    8976
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl AppConfig {
    pub fn new() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("empty config object is valid")
    }

    // Path of the persisted pool state file for one backend.
    pub fn pool_path(&self, backend: &str) -> PathBuf {
        self.state_dir.join(format!("{}-accounts.json", backend))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub fn load_app_config() -> Result<AppConfig, String> {
    let path = std::env::var("SWITCHYARD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_state_dir().join("config.json"));

    if !path.exists() {
        info!("No config file at {:?}, using defaults", path);
        return Ok(AppConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("failed_to_read_config {:?}: {}", path, e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed_to_parse_config {:?}: {}", path, e))
}

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    config.port = p;
                    info!("Using proxy port from environment: {}", p);
                }
                _ => warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
            }
        }
    }

    if let Ok(host) = std::env::var("HOST") {
        if !host.trim().is_empty() {
            config.host = host.trim().to_string();
        }
    }

    if let Ok(key) = std::env::var("API_KEY") {
        if !key.trim().is_empty() {
            info!("Using API key from environment");
            config.api_key = Some(key);
        }
    }

    if let Ok(dev) = std::env::var("SWITCHYARD_DEV_MODE") {
        if let Some(parsed) = parse_env_bool(&dev) {
            config.dev_mode = parsed;
        } else {
            warn!("[W-DEV-MODE-INVALID] ignoring_invalid_dev_mode_value: {}", dev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScopedEnvVar;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.port, 8899);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.default_cooldown_ms, 60_000);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn env_port_overrides_config_port() {
        let _guard = crate::test_utils::lock_env();
        let _port = ScopedEnvVar::set("PORT", "8045");

        let mut config = AppConfig::default();
        config.port = 8145;
        apply_env_overrides(&mut config);

        assert_eq!(config.port, 8045);
    }

    #[test]
    fn invalid_env_port_is_ignored() {
        let _guard = crate::test_utils::lock_env();
        let _port = ScopedEnvVar::set("PORT", "not-a-port");

        let mut config = AppConfig::default();
        config.port = 8145;
        apply_env_overrides(&mut config);

        assert_eq!(config.port, 8145);
    }

    #[test]
    fn pool_path_is_per_backend() {
        let config = AppConfig::default();
        assert!(config
            .pool_path("codex")
            .to_string_lossy()
            .ends_with("codex-accounts.json"));
    }
}
