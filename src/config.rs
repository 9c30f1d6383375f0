//! Runtime configuration.
//!
//! Defaults, then `config.toml` in the data directory, then environment
//! variables (a `.env` file is honoured).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DATA_DIR: &str = ".market-chat";
pub const CONFIG_FILE: &str = "config.toml";
pub const DATABASE_FILE: &str = "chat.db";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    pub database_path: PathBuf,
    pub server: ServerSettings,
    pub delivery: DeliverySettings,
    pub limits: LimitSettings,
    pub retry: RetrySettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeliverySettings {
    /// Per-conversation broadcast buffer. Slower subscribers lag and catch
    /// up from the store.
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitSettings {
    pub page_size: usize,
    pub max_page_size: usize,
    pub max_body_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    pub filter: String,
    /// When set, logs are also written to a daily rolling file here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            database_path: Path::new(DATA_DIR).join(DATABASE_FILE),
            server: ServerSettings::default(),
            delivery: DeliverySettings::default(),
            limits: LimitSettings::default(),
            retry: RetrySettings::default(),
            log: LogSettings::default(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_page_size: 200,
            max_body_chars: 4000,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 5000,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            directory: None,
        }
    }
}

impl ChatConfig {
    /// Defaults rooted at `root`, so the database lives under `root/.market-chat`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            database_path: root.join(DATA_DIR).join(DATABASE_FILE),
            ..Self::default()
        }
    }

    /// Load the configuration for the data directory under `root`.
    pub fn load(root: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = root.join(DATA_DIR).join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            let mut parsed: Self = toml::from_str(&raw)
                .with_context(|| format!("failed to parse {}", config_path.display()))?;
            if parsed.database_path.is_relative() {
                parsed.database_path = root.join(&parsed.database_path);
            }
            parsed
        } else {
            Self::rooted_at(root)
        };

        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(db) = std::env::var("MARKET_CHAT_DB") {
            self.database_path = PathBuf::from(db);
        }
        if let Ok(port) = std::env::var("MARKET_CHAT_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("MARKET_CHAT_PORT is not a port number: {port}"))?;
        }
        if let Ok(filter) = std::env::var("MARKET_CHAT_LOG") {
            self.log.filter = filter;
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config")
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: ChatConfig = toml::from_str(
            r#"
            [server]
            port = 8080

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(parsed.server.port, 8080);
        assert_eq!(parsed.server.host, "0.0.0.0");
        assert_eq!(parsed.retry.max_attempts, 5);
        assert_eq!(parsed.retry.initial_delay_ms, 100);
        assert_eq!(parsed.limits.page_size, 50);
    }

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join(DATA_DIR);
        std::fs::create_dir_all(&data_dir).unwrap();

        let mut config = ChatConfig::rooted_at(dir.path());
        config.delivery.channel_capacity = 16;
        std::fs::write(data_dir.join(CONFIG_FILE), config.to_toml().unwrap()).unwrap();

        let loaded = ChatConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.delivery.channel_capacity, 16);
        assert!(loaded.database_path.ends_with(DATABASE_FILE));
    }
}
