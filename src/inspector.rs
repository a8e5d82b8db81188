//! Read-only views over stored blocks, used by the inspector server and
//! for poking at a capture from tests.

use chrono::{TimeZone, Utc};
use serde::Serialize;

use crate::error::StorageResult;
use crate::schema::{Block, BlockMeta, OrdinalRange, StructuredMessage};
use crate::storage::{BackendKind, BlockStorage, StorageStats};

const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockSummary {
    pub id: String,
    pub session_url: String,
    pub ordinal_range: OrdinalRange,
    pub message_count: usize,
    pub created_at: String,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockDetails {
    #[serde(flatten)]
    pub summary: BlockSummary,
    pub raw: String,
    pub messages: Vec<StructuredMessage>,
    pub meta: Option<BlockMeta>,
    pub embedding_dims: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectorStats {
    pub backend: BackendKind,
    #[serde(flatten)]
    pub storage: StorageStats,
}

#[derive(Clone)]
pub struct Inspector {
    storage: BlockStorage,
}

impl Inspector {
    pub fn new(storage: BlockStorage) -> Self {
        Self { storage }
    }

    pub async fn list_blocks(&self) -> StorageResult<Vec<BlockSummary>> {
        let blocks = self.storage.all().await?;
        Ok(blocks.iter().map(summarize).collect())
    }

    pub async fn get_session_blocks(&self, session_url: &str) -> StorageResult<Vec<BlockSummary>> {
        let blocks = self.storage.get_by_session(session_url).await?;
        Ok(blocks.iter().map(summarize).collect())
    }

    pub async fn get_block_details(&self, id: &str) -> StorageResult<Option<BlockDetails>> {
        let Some(block) = self.storage.get(id).await? else {
            return Ok(None);
        };
        Ok(Some(BlockDetails {
            summary: summarize(&block),
            embedding_dims: block.embedding.as_ref().map(Vec::len),
            raw: block.raw,
            messages: block.messages,
            meta: block.meta,
        }))
    }

    pub async fn stats(&self) -> StorageResult<InspectorStats> {
        Ok(InspectorStats {
            backend: self.storage.backend_kind(),
            storage: self.storage.stats().await?,
        })
    }
}

fn summarize(block: &Block) -> BlockSummary {
    BlockSummary {
        id: block.id.clone(),
        session_url: block.session_url.clone(),
        ordinal_range: block.ordinal_range,
        message_count: block.message_count,
        created_at: format_timestamp(block.timestamp),
        preview: preview(&block.raw),
    }
}

fn format_timestamp(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn preview(raw: &str) -> String {
    let first = raw.lines().find(|line| !line.trim().is_empty()).unwrap_or("");
    let mut preview: String = first.chars().take(PREVIEW_CHARS).collect();
    if first.chars().count() > PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::block;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn details_carry_rfc3339_time_and_embedding_size() {
        let storage = BlockStorage::memory();
        let mut stored = block("b1", "s", 1, 2, 1_700_000_000_000);
        stored.raw = "user: message 1\n\nuser: message 2".into();
        stored.embedding = Some(vec![0.0; 4]);
        storage.save(&stored).await.unwrap();
        let inspector = Inspector::new(storage);

        let details = inspector.get_block_details("b1").await.unwrap().unwrap();

        assert_eq!(details.summary.created_at, "2023-11-14T22:13:20+00:00");
        assert_eq!(details.summary.preview, "user: message 1");
        assert_eq!(details.summary.message_count, 2);
        assert_eq!(details.embedding_dims, Some(4));
        assert!(inspector.get_block_details("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lists_every_block_or_one_session() {
        let storage = BlockStorage::memory();
        storage.save(&block("a1", "a", 1, 2, 10)).await.unwrap();
        storage.save(&block("b1", "b", 1, 2, 10)).await.unwrap();
        storage.save(&block("a2", "a", 3, 4, 10)).await.unwrap();
        let inspector = Inspector::new(storage);

        assert_eq!(inspector.list_blocks().await.unwrap().len(), 3);
        let ids: Vec<_> = inspector
            .get_session_blocks("a")
            .await
            .unwrap()
            .into_iter()
            .map(|summary| summary.id)
            .collect();
        assert_eq!(ids, vec!["a1", "a2"]);

        let stats = inspector.stats().await.unwrap();
        assert_eq!(stats.backend, BackendKind::Memory);
        assert_eq!(stats.storage.sessions, 2);
    }

    #[test]
    fn long_previews_are_truncated() {
        let raw = "x".repeat(200);
        let preview = preview(&raw);
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
    }
}
