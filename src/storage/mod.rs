//! Block persistence.
//!
//! [`BlockStorage`] validates and normalizes blocks, then hands them to a
//! [`BlockBackend`]. SQLite is preferred; when it cannot be opened the
//! storage silently continues on the in-memory backend, so callers never
//! need to know which one is active.

mod memory;
mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{StorageError, StorageResult};
use crate::schema::{Block, OrdinalRange};

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StorageStats {
    pub total_blocks: usize,
    pub total_messages: usize,
    pub sessions: usize,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Sqlite { path: PathBuf },
    Memory,
}

#[async_trait]
pub trait BlockBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn save(&self, block: &Block) -> StorageResult<()>;

    async fn get(&self, id: &str) -> StorageResult<Option<Block>>;

    /// Blocks of one session ordered by start ordinal, timestamp, then id.
    async fn get_by_session(&self, session_url: &str) -> StorageResult<Vec<Block>>;

    /// Every stored block, ordered by session then as in `get_by_session`.
    async fn all(&self) -> StorageResult<Vec<Block>>;

    async fn delete(&self, id: &str) -> StorageResult<bool>;

    /// Remove one session, or everything when `session_url` is `None`.
    async fn clear(&self, session_url: Option<&str>) -> StorageResult<usize>;

    async fn stats(&self) -> StorageResult<StorageStats>;
}

#[derive(Clone)]
pub struct BlockStorage {
    backend: Arc<dyn BlockBackend>,
}

impl BlockStorage {
    pub fn open(config: &StorageConfig) -> Self {
        match config {
            StorageConfig::Memory => Self::memory(),
            StorageConfig::Sqlite { path } => match SqliteBackend::open(path) {
                Ok(backend) => {
                    info!(path = %path.display(), "Opened SQLite block storage");
                    Self::with_backend(Arc::new(backend))
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "Block storage unavailable, falling back to in-memory store"
                    );
                    Self::memory()
                }
            },
        }
    }

    pub fn memory() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()))
    }

    pub fn with_backend(backend: Arc<dyn BlockBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn save(&self, block: &Block) -> StorageResult<()> {
        let block = normalize(block)?;
        self.backend.save(&block).await
    }

    pub async fn get(&self, id: &str) -> StorageResult<Option<Block>> {
        self.backend.get(id).await
    }

    pub async fn get_by_session(&self, session_url: &str) -> StorageResult<Vec<Block>> {
        self.backend.get_by_session(session_url).await
    }

    pub async fn all(&self) -> StorageResult<Vec<Block>> {
        self.backend.all().await
    }

    pub async fn delete(&self, id: &str) -> StorageResult<bool> {
        self.backend.delete(id).await
    }

    pub async fn clear(&self, session_url: Option<&str>) -> StorageResult<usize> {
        self.backend.clear(session_url).await
    }

    pub async fn stats(&self) -> StorageResult<StorageStats> {
        self.backend.stats().await
    }
}

/// Ordinals are stored as SQLite `INTEGER`, a signed 64-bit value.
const MAX_ORDINAL: u64 = i64::MAX as u64;

fn validate(block: &Block) -> StorageResult<()> {
    if block.id.trim().is_empty() {
        return Err(StorageError::InvalidBlock("block id is empty".into()));
    }
    if block.session_url.trim().is_empty() {
        return Err(StorageError::InvalidBlock(format!(
            "block {} has no session url",
            block.id
        )));
    }
    if block.ordinal_range.start > block.ordinal_range.end {
        return Err(StorageError::InvalidBlock(format!(
            "block {} has inverted ordinal range {}..{}",
            block.id, block.ordinal_range.start, block.ordinal_range.end
        )));
    }
    let too_large = block.ordinal_range.end > MAX_ORDINAL
        || block
            .messages
            .iter()
            .filter_map(|message| message.ordinal)
            .any(|ordinal| ordinal > MAX_ORDINAL);
    if too_large {
        return Err(StorageError::InvalidBlock(format!(
            "block {} carries an ordinal above {}",
            block.id, MAX_ORDINAL
        )));
    }
    if block.timestamp <= 0 {
        return Err(StorageError::InvalidBlock(format!(
            "block {} has invalid timestamp {}",
            block.id, block.timestamp
        )));
    }
    Ok(())
}

/// Validated copy with `message_count` and `ordinal_range` derived from
/// the messages actually carried.
fn normalize(block: &Block) -> StorageResult<Block> {
    validate(block)?;
    let mut block = block.clone();
    block.message_count = block.messages.len();
    if let Some(range) = OrdinalRange::spanning(&block.messages) {
        block.ordinal_range = range;
    }
    Ok(block)
}

fn sort_session_blocks(blocks: &mut [Block]) {
    blocks.sort_by(|a, b| {
        a.ordinal_range
            .start
            .cmp(&b.ordinal_range.start)
            .then(a.timestamp.cmp(&b.timestamp))
            .then_with(|| a.id.cmp(&b.id))
    });
}
