use serde::Serialize;
use thiserror::Error;

/// Stable classification for storage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageErrorClass {
    TerminalData,
    Retryable,
    DependencyUnavailable,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage backend unavailable: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn class(&self) -> StorageErrorClass {
        match self {
            Self::InvalidBlock(_) | Self::Json(_) => StorageErrorClass::TerminalData,
            Self::Sqlite(_) | Self::Io(_) => StorageErrorClass::Retryable,
            Self::Backend(_) => StorageErrorClass::DependencyUnavailable,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("cannot build a block from an empty window")]
    EmptyWindow,
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("element {0:?} is no longer attached")]
    Detached(crate::arena::ElementHandle),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("message stream is already running")]
    AlreadyRunning,

    #[error("persistence worker has shut down")]
    PersistenceClosed,
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
