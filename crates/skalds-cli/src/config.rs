//! Configuration file management for skalds.
//!
//! Provides a TOML-based config file at `~/.config/skalds/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use skalds_core::config::ControllerConfig;
use skalds_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub events: EventsSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheSection {
    pub url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EventsSection {
    pub brokers: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the skalds config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/skalds` or `~/.config/skalds`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("skalds");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("skalds")
}

/// Return the path to the skalds config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct SkaldsConfig {
    pub db: DbConfig,
    pub controller: ControllerConfig,
}

/// Endpoint overrides taken from CLI flags.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub kafka_brokers: Option<String>,
}

impl SkaldsConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default. A missing config file is fine; a malformed one is not.
    pub fn resolve(overrides: &CliOverrides) -> Result<Self> {
        let mut controller = ControllerConfig::from_env()?;

        let file = if config_path().exists() {
            load_config()?
        } else {
            ConfigFile::default()
        };

        let database_url = overrides
            .database_url
            .clone()
            .or_else(|| std::env::var("SKALDS_DATABASE_URL").ok().filter(|v| !v.is_empty()))
            .or(file.database.url)
            .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_owned());

        if let Some(url) = overrides.redis_url.clone() {
            controller.cache.url = url;
        } else if std::env::var("SKALDS_REDIS_URL").is_err() {
            if let Some(url) = file.cache.url {
                controller.cache.url = url;
            }
        }

        if let Some(brokers) = overrides.kafka_brokers.clone() {
            controller.events.brokers = brokers;
        } else if std::env::var("SKALDS_KAFKA_BROKERS").is_err() {
            if let Some(brokers) = file.events.brokers {
                controller.events.brokers = brokers;
            }
        }

        Ok(Self {
            db: DbConfig::new(database_url),
            controller,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_roundtrip() {
        let file = ConfigFile {
            database: DatabaseSection {
                url: Some("postgresql://db:5432/skalds".to_owned()),
            },
            cache: CacheSection {
                url: Some("redis://cache:6379".to_owned()),
            },
            events: EventsSection {
                brokers: Some("kafka:9092".to_owned()),
            },
        };
        let text = toml::to_string_pretty(&file).expect("serialize");
        let parsed: ConfigFile = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.database.url.as_deref(), Some("postgresql://db:5432/skalds"));
        assert_eq!(parsed.cache.url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(parsed.events.brokers.as_deref(), Some("kafka:9092"));
    }

    #[test]
    fn empty_file_parses_with_defaults() {
        let parsed: ConfigFile = toml::from_str("").expect("parse");
        assert!(parsed.database.url.is_none());
        assert!(parsed.cache.url.is_none());
        assert!(parsed.events.brokers.is_none());
    }

    #[test]
    fn cli_flag_wins_over_everything() {
        let overrides = CliOverrides {
            database_url: Some("postgresql://flag:5432/skalds".to_owned()),
            ..Default::default()
        };
        let resolved = SkaldsConfig::resolve(&overrides).expect("resolve");
        assert_eq!(resolved.db.database_url, "postgresql://flag:5432/skalds");
    }
}
