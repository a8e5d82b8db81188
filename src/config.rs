use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::builder::BuilderConfig;
use crate::error::ConfigError;
use crate::indexer::IndexerConfig;
use crate::storage::StorageConfig;
use crate::stream::StreamConfig;

const MEMORY_DB_PATH: &str = ":memory:";

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub block_size: usize,
    pub block_overlap: usize,
    pub settle_ms: u64,
    pub retry_ms: u64,
    pub max_attempts: u32,
    pub frame_ms: u64,
    pub session_url: Option<String>,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "data/blocks.sqlite3".into(),
            block_size: 10,
            block_overlap: 0,
            settle_ms: 300,
            retry_ms: 250,
            max_attempts: 6,
            frame_ms: 16,
            session_url: None,
            port: 8083,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            db_path: env::var("CAPTURE_DB_PATH").unwrap_or(defaults.db_path),
            block_size: number("CAPTURE_BLOCK_SIZE", defaults.block_size)?,
            block_overlap: number("CAPTURE_BLOCK_OVERLAP", defaults.block_overlap)?,
            settle_ms: number("CAPTURE_SETTLE_MS", defaults.settle_ms)?,
            retry_ms: number("CAPTURE_RETRY_MS", defaults.retry_ms)?,
            max_attempts: number("CAPTURE_MAX_ATTEMPTS", defaults.max_attempts)?,
            frame_ms: number("CAPTURE_FRAME_MS", defaults.frame_ms)?,
            session_url: env::var("CAPTURE_SESSION_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            port: number("PORT", defaults.port)?,
        })
    }

    pub fn builder(&self) -> BuilderConfig {
        BuilderConfig::new(self.block_size, self.block_overlap)
    }

    pub fn stream(&self) -> StreamConfig {
        StreamConfig {
            builder: self.builder(),
            settle_delay: Duration::from_millis(self.settle_ms),
            retry_interval: Duration::from_millis(self.retry_ms),
            max_attempts: self.max_attempts.max(1),
        }
    }

    pub fn indexer(&self) -> IndexerConfig {
        IndexerConfig {
            frame_interval: Duration::from_millis(self.frame_ms),
            ..IndexerConfig::default()
        }
    }

    pub fn storage(&self) -> StorageConfig {
        if self.db_path == MEMORY_DB_PATH {
            StorageConfig::Memory
        } else {
            StorageConfig::Sqlite {
                path: PathBuf::from(&self.db_path),
            }
        }
    }
}

fn number<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        _ => Ok(default),
    }
}
