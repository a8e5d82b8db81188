use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{sort_session_blocks, BackendKind, BlockBackend, StorageStats};
use crate::error::StorageResult;
use crate::schema::Block;

/// Non-durable backend used when SQLite is unavailable.
///
/// Blocks are cloned in and out, so no caller ever shares a stored
/// message list or embedding buffer with another.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    blocks: RwLock<HashMap<String, Block>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn save(&self, block: &Block) -> StorageResult<()> {
        self.blocks
            .write()
            .await
            .insert(block.id.clone(), block.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> StorageResult<Option<Block>> {
        Ok(self.blocks.read().await.get(id).cloned())
    }

    async fn get_by_session(&self, session_url: &str) -> StorageResult<Vec<Block>> {
        let mut blocks: Vec<Block> = self
            .blocks
            .read()
            .await
            .values()
            .filter(|block| block.session_url == session_url)
            .cloned()
            .collect();
        sort_session_blocks(&mut blocks);
        Ok(blocks)
    }

    async fn all(&self) -> StorageResult<Vec<Block>> {
        let mut blocks: Vec<Block> = self.blocks.read().await.values().cloned().collect();
        sort_session_blocks(&mut blocks);
        blocks.sort_by(|a, b| a.session_url.cmp(&b.session_url));
        Ok(blocks)
    }

    async fn delete(&self, id: &str) -> StorageResult<bool> {
        Ok(self.blocks.write().await.remove(id).is_some())
    }

    async fn clear(&self, session_url: Option<&str>) -> StorageResult<usize> {
        let mut blocks = self.blocks.write().await;
        let before = blocks.len();
        match session_url {
            Some(session) => blocks.retain(|_, block| block.session_url != session),
            None => blocks.clear(),
        }
        Ok(before - blocks.len())
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        let blocks = self.blocks.read().await;
        let sessions: HashSet<&str> = blocks.values().map(|b| b.session_url.as_str()).collect();
        Ok(StorageStats {
            total_blocks: blocks.len(),
            total_messages: blocks.values().map(|b| b.message_count).sum(),
            sessions: sessions.len(),
        })
    }
}
