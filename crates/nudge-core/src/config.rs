//! Nudge configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{NudgeError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NudgeConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl NudgeConfig {
    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NudgeError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| NudgeError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| NudgeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Nudge home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nudge")
    }
}

/// SQLite storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.nudge/nudge.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Follow-up scheduling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Conversations quiet for longer than this are scan candidates.
    #[serde(default = "default_inactivity_hours")]
    pub inactivity_hours: u32,
    /// Max candidates per company per scan invocation.
    #[serde(default = "default_scan_batch_limit")]
    pub scan_batch_limit: usize,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Upper bound for every storage / catalog call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "bool_true")]
    pub scan_enabled: bool,
}

fn bool_true() -> bool { true }
fn default_inactivity_hours() -> u32 { 24 }
fn default_scan_batch_limit() -> usize { 100 }
fn default_scan_interval_secs() -> u64 { 900 }
fn default_call_timeout_secs() -> u64 { 10 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            inactivity_hours: default_inactivity_hours(),
            scan_batch_limit: default_scan_batch_limit(),
            scan_interval_secs: default_scan_interval_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            scan_enabled: true,
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Allowed CORS origins; empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 { 3080 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NudgeConfig::default();
        assert_eq!(config.scheduler.inactivity_hours, 24);
        assert_eq!(config.scheduler.scan_batch_limit, 100);
        assert_eq!(config.gateway.port, 3080);
        assert!(config.gateway.cors_origins.is_empty());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: NudgeConfig = toml::from_str(
            r#"
            [scheduler]
            scan_batch_limit = 25

            [gateway]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.scan_batch_limit, 25);
        assert_eq!(config.scheduler.inactivity_hours, 24);
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.database.path, "~/.nudge/nudge.db");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = NudgeConfig::default();
        config.scheduler.call_timeout_secs = 3;
        config.save_to(&path).unwrap();

        let loaded = NudgeConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.call_timeout_secs, 3);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[scheduler\nbroken").unwrap();
        let err = NudgeConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, NudgeError::Config(_)));
    }
}
