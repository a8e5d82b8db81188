use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{BackendKind, BlockBackend, StorageStats};
use crate::error::{StorageError, StorageResult};
use crate::schema::{Block, BlockMeta, OrdinalRange, StructuredMessage};

/// Additive schema steps, applied in order above the stored `user_version`.
/// Never rewrite a shipped step; append a new one.
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS blocks (
        id TEXT PRIMARY KEY,
        session_url TEXT NOT NULL,
        start_ordinal INTEGER NOT NULL,
        end_ordinal INTEGER NOT NULL,
        message_count INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        raw TEXT NOT NULL,
        messages TEXT NOT NULL,
        embedding BLOB,
        meta TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_blocks_session ON blocks(session_url);
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_blocks_start_ordinal ON blocks(start_ordinal);
    CREATE INDEX IF NOT EXISTS idx_blocks_timestamp ON blocks(timestamp);
    "#,
];

const SELECT_COLUMNS: &str = "id, session_url, start_ordinal, end_ordinal, message_count, \
     timestamp, raw, messages, embedding, meta";

/// Every statement runs on the blocking pool; the connection never sits
/// on a runtime worker.
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> StorageResult<Self> {
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            op(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("sqlite task join: {e}")))?
    }
}

fn lock(conn: &Mutex<Connection>) -> StorageResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| StorageError::Backend("sqlite connection lock poisoned".into()))
}

fn query_blocks(conn: &Connection, sql: &str, session_url: Option<&str>) -> StorageResult<Vec<Block>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = match session_url {
        Some(session) => stmt
            .query_map(params![session], BlockRow::read)?
            .collect::<Result<Vec<_>, _>>()?,
        None => stmt
            .query_map([], BlockRow::read)?
            .collect::<Result<Vec<_>, _>>()?,
    };
    rows.into_iter().map(BlockRow::into_block).collect()
}

fn migrate(conn: &mut Connection) -> StorageResult<()> {
    let current = schema_version(conn)?;
    for (step, sql) in MIGRATIONS.iter().enumerate() {
        let version = step as i64 + 1;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {version}"))?;
        tx.commit()?;
        debug!(version, "Applied block storage migration");
    }
    Ok(())
}

fn schema_version(conn: &Connection) -> StorageResult<i64> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn to_column(value: u64, field: &str, block_id: &str) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidBlock(format!("block {block_id} {field} {value} exceeds sqlite range")))
}

fn from_column(value: i64, field: &str, block_id: &str) -> StorageResult<u64> {
    u64::try_from(value)
        .map_err(|_| StorageError::Backend(format!("stored block {block_id} has negative {field} {value}")))
}

struct BlockRow {
    id: String,
    session_url: String,
    start_ordinal: i64,
    end_ordinal: i64,
    message_count: i64,
    timestamp: i64,
    raw: String,
    messages: String,
    embedding: Option<Vec<u8>>,
    meta: Option<String>,
}

impl BlockRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_url: row.get(1)?,
            start_ordinal: row.get(2)?,
            end_ordinal: row.get(3)?,
            message_count: row.get(4)?,
            timestamp: row.get(5)?,
            raw: row.get(6)?,
            messages: row.get(7)?,
            embedding: row.get(8)?,
            meta: row.get(9)?,
        })
    }

    fn into_block(self) -> StorageResult<Block> {
        let messages: Vec<StructuredMessage> = serde_json::from_str(&self.messages)?;
        let meta: Option<BlockMeta> = match self.meta {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        };
        Ok(Block {
            ordinal_range: OrdinalRange {
                start: from_column(self.start_ordinal, "start ordinal", &self.id)?,
                end: from_column(self.end_ordinal, "end ordinal", &self.id)?,
            },
            message_count: from_column(self.message_count, "message count", &self.id)? as usize,
            id: self.id,
            session_url: self.session_url,
            timestamp: self.timestamp,
            messages,
            raw: self.raw,
            meta,
            embedding: self.embedding.as_deref().map(decode_embedding),
        })
    }
}

fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[async_trait]
impl BlockBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn save(&self, block: &Block) -> StorageResult<()> {
        let messages = serde_json::to_string(&block.messages)?;
        let meta = block.meta.as_ref().map(serde_json::to_string).transpose()?;
        let embedding = block.embedding.as_deref().map(encode_embedding);
        let start = to_column(block.ordinal_range.start, "start ordinal", &block.id)?;
        let end = to_column(block.ordinal_range.end, "end ordinal", &block.id)?;
        let message_count = to_column(block.message_count as u64, "message count", &block.id)?;
        let id = block.id.clone();
        let session_url = block.session_url.clone();
        let timestamp = block.timestamp;
        let raw = block.raw.clone();

        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO blocks \
                 (id, session_url, start_ordinal, end_ordinal, message_count, timestamp, raw, messages, embedding, meta) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![id, session_url, start, end, message_count, timestamp, raw, messages, embedding, meta],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> StorageResult<Option<Block>> {
        let id = id.to_string();
        self.run(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM blocks WHERE id = ?1"),
                    params![id],
                    BlockRow::read,
                )
                .optional()?;
            row.map(BlockRow::into_block).transpose()
        })
        .await
    }

    async fn get_by_session(&self, session_url: &str) -> StorageResult<Vec<Block>> {
        let session_url = session_url.to_string();
        self.run(move |conn| {
            query_blocks(
                conn,
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM blocks WHERE session_url = ?1 \
                     ORDER BY start_ordinal, timestamp, id"
                ),
                Some(&session_url),
            )
        })
        .await
    }

    async fn all(&self) -> StorageResult<Vec<Block>> {
        self.run(|conn| {
            query_blocks(
                conn,
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM blocks \
                     ORDER BY session_url, start_ordinal, timestamp, id"
                ),
                None,
            )
        })
        .await
    }

    async fn delete(&self, id: &str) -> StorageResult<bool> {
        let id = id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM blocks WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    async fn clear(&self, session_url: Option<&str>) -> StorageResult<usize> {
        let session_url = session_url.map(str::to_string);
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let removed = match &session_url {
                Some(session) => tx.execute("DELETE FROM blocks WHERE session_url = ?1", params![session])?,
                None => tx.execute("DELETE FROM blocks", [])?,
            };
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        self.run(|conn| {
            let (total_blocks, total_messages, sessions): (i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(message_count), 0), COUNT(DISTINCT session_url) FROM blocks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok(StorageStats {
                total_blocks: total_blocks as usize,
                total_messages: total_messages as usize,
                sessions: sessions as usize,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::block;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn round_trips_blocks_with_embeddings() {
        let backend = SqliteBackend::in_memory().unwrap();
        let mut original = block("b1", "https://chat.example/c/1", 1, 3, 1_700_000_000_000);
        original.message_count = 3;
        original.raw = "user: message 1".into();
        original.embedding = Some(vec![0.25, -1.0, 3.5]);

        backend.save(&original).await.unwrap();

        assert_eq!(backend.get("b1").await.unwrap(), Some(original));
        assert_eq!(backend.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn session_query_orders_by_start_then_time_then_id() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.save(&block("c", "s", 4, 6, 20)).await.unwrap();
        backend.save(&block("b", "s", 1, 3, 30)).await.unwrap();
        backend.save(&block("a", "s", 1, 3, 30)).await.unwrap();
        backend.save(&block("z", "s", 1, 3, 10)).await.unwrap();
        backend.save(&block("other", "t", 1, 3, 10)).await.unwrap();

        let ids: Vec<_> = backend
            .get_by_session("s")
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec!["z", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn reopening_keeps_history_and_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store").join("blocks.sqlite3");
        {
            let backend = SqliteBackend::open(&path).unwrap();
            let mut stored = block("b1", "s", 1, 2, 10);
            stored.message_count = 2;
            backend.save(&stored).await.unwrap();
        }

        let reopened = SqliteBackend::open(&path).unwrap();
        let stats = reopened.stats().await.unwrap();
        assert_eq!(stats.total_blocks, 1);
        assert_eq!(stats.total_messages, 2);

        let conn = lock(&reopened.conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.save(&block("a1", "a", 1, 1, 10)).await.unwrap();
        backend.save(&block("a2", "a", 2, 2, 10)).await.unwrap();
        backend.save(&block("b1", "b", 1, 1, 10)).await.unwrap();

        assert!(backend.delete("a1").await.unwrap());
        assert!(!backend.delete("a1").await.unwrap());
        assert_eq!(backend.clear(Some("a")).await.unwrap(), 1);
        assert_eq!(backend.stats().await.unwrap().sessions, 1);
        assert_eq!(backend.clear(None).await.unwrap(), 1);
        assert_eq!(backend.all().await.unwrap(), Vec::new());
    }

    #[tokio::test]
    async fn busy_connection_does_not_stall_the_runtime() {
        let backend = Arc::new(SqliteBackend::in_memory().unwrap());
        let held = Arc::clone(&backend.conn);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _guard = held.lock().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(300));
        });
        locked_rx.recv().unwrap();

        let save = tokio::spawn({
            let backend = Arc::clone(&backend);
            async move { backend.save(&block("b1", "s", 1, 2, 10)).await }
        });
        // Timers on this single-threaded runtime still fire while the save waits.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!save.is_finished());

        save.await.unwrap().unwrap();
        holder.join().unwrap();
        assert_eq!(backend.stats().await.unwrap().total_blocks, 1);
    }

    #[tokio::test]
    async fn ordinals_beyond_sqlite_range_are_rejected() {
        let backend = SqliteBackend::in_memory().unwrap();
        let mut huge = block("big", "s", 1, 1, 10);
        huge.ordinal_range.end = u64::MAX;

        let err = backend.save(&huge).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidBlock(_)));
        assert_eq!(backend.get("big").await.unwrap(), None);
    }
}
