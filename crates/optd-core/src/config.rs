//! Layered configuration (`SPEC_FULL.md` §10.3).
//!
//! Resolution chain, highest precedence first: CLI flag > environment
//! variable > TOML config file > built-in default. Covers the Store DSN,
//! Broker URL, and the ingestion handoff directory; notifier credentials
//! and the Thresholds' own env fallbacks are resolved separately by
//! [`crate::notifier`] and `optd_db::thresholds` respectively, each
//! reading straight from the environment as the spec's last rung.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use optd_broker::BrokerConfig;
use optd_db::config::DbConfig;

const APP_NAME: &str = "optd";
const HANDOFF_DIR_ENV: &str = "CONTROLLER_HANDOFF_DIR";
const DEFAULT_HANDOFF_DIR: &str = "./handoff";

/// On-disk config file shape, written by `optd init`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub handoff: HandoffSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BrokerSection {
    pub url: String,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_owned(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HandoffSection {
    pub dir: String,
}

impl Default for HandoffSection {
    fn default() -> Self {
        Self {
            dir: DEFAULT_HANDOFF_DIR.to_owned(),
        }
    }
}

/// The `optd` config directory: `$XDG_CONFIG_HOME/optd` or `~/.config/optd`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join(APP_NAME);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(APP_NAME)
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file. Returns an error if it does not exist
/// or fails to parse.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent directories as
/// needed. Sets file permissions to `0600` on Unix (§10.3).
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Fully resolved configuration for a running controller process.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db: DbConfig,
    pub broker: BrokerConfig,
    pub handoff_dir: PathBuf,
}

impl AppConfig {
    /// Resolve the chain CLI flag > env var > config file > default for
    /// each of the Store DSN, Broker URL, and handoff directory.
    pub fn resolve(cli_db_url: Option<&str>, cli_broker_url: Option<&str>, cli_handoff_dir: Option<&str>) -> Self {
        let file_config = load_config().ok();

        let db_url = cli_db_url
            .map(str::to_owned)
            .or_else(|| std::env::var("CONTROLLER_DATABASE_URL").ok())
            .or_else(|| file_config.as_ref().map(|c| c.database.url.clone()))
            .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_owned());

        let broker_url = cli_broker_url
            .map(str::to_owned)
            .or_else(|| std::env::var(optd_broker::config::REDIS_URL_ENV).ok())
            .or_else(|| file_config.as_ref().map(|c| c.broker.url.clone()))
            .unwrap_or_else(|| BrokerSection::default().url);

        let handoff_dir = cli_handoff_dir
            .map(str::to_owned)
            .or_else(|| std::env::var(HANDOFF_DIR_ENV).ok())
            .or_else(|| file_config.as_ref().map(|c| c.handoff.dir.clone()))
            .unwrap_or_else(|| DEFAULT_HANDOFF_DIR.to_owned());

        let mut broker = BrokerConfig::from_env();
        broker.redis_url = broker_url;

        Self {
            db: DbConfig::new(db_url),
            broker,
            handoff_dir: PathBuf::from(handoff_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_falls_back_to_defaults_with_nothing_set() {
        let config = AppConfig::resolve(None, None, None);
        assert!(config.db.database_url.contains("optd") || config.db.database_url.contains("localhost"));
        assert_eq!(config.handoff_dir, PathBuf::from(DEFAULT_HANDOFF_DIR));
    }

    #[test]
    fn cli_flag_wins_over_everything() {
        let config = AppConfig::resolve(
            Some("postgresql://cli-host/cli-db"),
            Some("redis://cli-host:1"),
            Some("/tmp/cli-handoff"),
        );
        assert_eq!(config.db.database_url, "postgresql://cli-host/cli-db");
        assert_eq!(config.broker.redis_url, "redis://cli-host:1");
        assert_eq!(config.handoff_dir, PathBuf::from("/tmp/cli-handoff"));
    }
}
