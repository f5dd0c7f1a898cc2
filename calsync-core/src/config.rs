//! Coordinator configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;

const DATABASE_URL_ENV: &str = "CALSYNC_DATABASE_URL";
const DEFAULT_PROVIDER: &str = "google";

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_provider_timeout_secs() -> u64 {
    60
}

fn default_max_connections() -> u32 {
    5
}

/// Tuning knobs for one sync attempt. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// A calendar synced successfully within this window is skipped unless forced.
    pub skip_ttl_secs: u64,
    pub lock_timeout_ms: u64,
    pub lock_poll_interval_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            skip_ttl_secs: 300,
            lock_timeout_ms: 10_000,
            lock_poll_interval_ms: 250,
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            max_jitter_ms: 250,
        }
    }
}

impl SyncSettings {
    pub fn skip_ttl(&self) -> Duration {
        Duration::from_secs(self.skip_ttl_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
        }
    }
}

/// Configuration at ~/.config/calsync/config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    /// Suffix of the provider binary, e.g. `google` for `calsync-provider-google`
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    #[serde(default)]
    pub sync: SyncSettings,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: None,
            database_max_connections: default_max_connections(),
            provider: default_provider(),
            provider_timeout_secs: default_provider_timeout_secs(),
            sync: SyncSettings::default(),
        }
    }
}

impl Config {
    pub fn config_path() -> SyncResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SyncError::Config("Could not determine config directory".into()))?
            .join("calsync");

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from `path`, applying the database URL environment override.
    pub fn load(path: &Path) -> SyncResult<Self> {
        if !path.exists() {
            return Err(SyncError::Config(format!(
                "Config file not found at {}\n\nCreate one with `calsync init` or by hand:\n\n\
                database_url = \"postgres://localhost/calsync\"",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;

        if let Ok(url) = std::env::var(DATABASE_URL_ENV) {
            config.database_url = Some(url);
        }

        Ok(config)
    }

    pub fn parse(content: &str) -> SyncResult<Self> {
        toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn database_url(&self) -> SyncResult<&str> {
        self.database_url.as_deref().ok_or_else(|| {
            SyncError::Config(format!(
                "No database_url configured (set it in config.toml or {DATABASE_URL_ENV})"
            ))
        })
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    /// Create a default config file with all options commented out.
    pub fn create_default_config(path: &Path) -> SyncResult<()> {
        let defaults = SyncSettings::default();
        let contents = format!(
            "\
# calsync configuration

# Postgres connection string (or set {DATABASE_URL_ENV}):
# database_url = \"postgres://localhost/calsync\"

# Provider binary to use (calsync-provider-<name> in PATH):
# provider = \"{DEFAULT_PROVIDER}\"

[sync]
# skip_ttl_secs = {}
# lock_timeout_ms = {}
# lock_poll_interval_ms = {}
# max_attempts = {}
# base_delay_ms = {}
# max_delay_ms = {}
# max_jitter_ms = {}
",
            defaults.skip_ttl_secs,
            defaults.lock_timeout_ms,
            defaults.lock_poll_interval_ms,
            defaults.max_attempts,
            defaults.base_delay_ms,
            defaults.max_delay_ms,
            defaults.max_jitter_ms,
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::Config(format!("Could not create config directory: {e}"))
            })?;
        }

        std::fs::write(path, contents)
            .map_err(|e| SyncError::Config(format!("Could not write config file: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.provider, "google");
        assert_eq!(config.sync, SyncSettings::default());
        assert!(config.database_url().is_err());
    }

    #[test]
    fn test_parse_partial_sync_table() {
        let config = Config::parse(
            r#"
database_url = "postgres://localhost/calsync"

[sync]
max_attempts = 3
skip_ttl_secs = 60
"#,
        )
        .unwrap();

        assert_eq!(config.database_url().unwrap(), "postgres://localhost/calsync");
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.sync.skip_ttl(), Duration::from_secs(60));
        assert_eq!(config.sync.lock_timeout_ms, 10_000);
    }

    #[test]
    fn test_retry_policy_never_has_zero_attempts() {
        let settings = SyncSettings {
            max_attempts: 0,
            ..SyncSettings::default()
        };
        assert_eq!(settings.retry_policy().max_attempts, 1);
    }

    #[test]
    fn test_default_config_template_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calsync").join("config.toml");

        Config::create_default_config(&path).unwrap();
        let config = Config::parse(&std::fs::read_to_string(&path).unwrap()).unwrap();

        assert_eq!(config.sync, SyncSettings::default());
    }
}
