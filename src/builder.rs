//! Fixed-size overlapping windows over the committed message sequence.
//!
//! The builder knows nothing about storage or the surface. It buffers
//! messages in commit order and cuts a [`Block`] every time the buffer holds
//! `block_size` messages, keeping the trailing `overlap` messages for the
//! next window.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::error::BuildError;
use crate::schema::{Block, BlockMeta, OrdinalRange, StructuredMessage};

const DEFAULT_BLOCK_SIZE: usize = 10;
const DEFAULT_OVERLAP: usize = 2;

static BLOCK_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuilderConfig {
    block_size: usize,
    overlap: usize,
}

impl BuilderConfig {
    /// `block_size` is clamped to at least 1 and `overlap` to `block_size - 1`.
    pub fn new(block_size: usize, overlap: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            overlap: overlap.min(block_size - 1),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    fn step(&self) -> usize {
        self.block_size - self.overlap
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE, DEFAULT_OVERLAP)
    }
}

#[derive(Debug)]
pub struct BlockBuilder {
    config: BuilderConfig,
    session_url: Option<String>,
    buffer: Vec<StructuredMessage>,
    seen_ids: HashSet<String>,
    last_ordinal: u64,
    /// Leading buffer entries that already went out in an emitted block.
    emitted_prefix: usize,
}

impl BlockBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self {
            config,
            session_url: None,
            buffer: Vec::new(),
            seen_ids: HashSet::new(),
            last_ordinal: 0,
            emitted_prefix: 0,
        }
    }

    pub fn config(&self) -> BuilderConfig {
        self.config
    }

    pub fn session_url(&self) -> Option<&str> {
        self.session_url.as_deref()
    }

    pub fn buffer(&self) -> &[StructuredMessage] {
        &self.buffer
    }

    pub fn last_ordinal(&self) -> u64 {
        self.last_ordinal
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.seen_ids.contains(id)
    }

    /// Switch to another session. Blank or unchanged values are ignored.
    pub fn set_session_url(&mut self, next: &str) {
        let next = next.trim();
        if next.is_empty() || self.session_url.as_deref() == Some(next) {
            return;
        }
        debug!(from = ?self.session_url, to = %next, "Resetting block builder for new session");
        self.session_url = Some(next.to_string());
        self.buffer.clear();
        self.seen_ids.clear();
        self.last_ordinal = 0;
        self.emitted_prefix = 0;
    }

    pub fn append(&mut self, message: &StructuredMessage) -> Result<Vec<Block>, BuildError> {
        self.admit(message);
        self.cut_ready()
    }

    /// Admit a burst of messages, then cut every window that filled up.
    pub fn append_batch(&mut self, messages: &[StructuredMessage]) -> Result<Vec<Block>, BuildError> {
        for message in messages {
            self.admit(message);
        }
        self.cut_ready()
    }

    fn admit(&mut self, message: &StructuredMessage) -> bool {
        if let Some(id) = &message.id {
            if !self.seen_ids.insert(id.clone()) {
                debug!(message_id = %id, "Skipping duplicate message");
                return false;
            }
        }

        let mut message = message.clone();
        let ordinal = match message.ordinal {
            Some(ordinal) => ordinal,
            None => {
                let next = self.last_ordinal + 1;
                message.ordinal = Some(next);
                next
            }
        };
        self.last_ordinal = self.last_ordinal.max(ordinal);
        self.buffer.push(message);
        true
    }

    fn cut_ready(&mut self) -> Result<Vec<Block>, BuildError> {
        let mut blocks = Vec::new();
        while self.buffer.len() >= self.config.block_size {
            let block = self.build_block(&self.buffer[..self.config.block_size], false)?;
            info!(
                block_id = %block.id,
                start = block.ordinal_range.start,
                end = block.ordinal_range.end,
                "Created block"
            );
            blocks.push(block);
            self.buffer.drain(..self.config.step());
            self.emitted_prefix = self.config.overlap;
        }
        Ok(blocks)
    }

    /// Emit the remainder as a final undersized block when `include_partial`
    /// is set and the buffer holds something no block has carried yet.
    ///
    /// A remainder made only of the overlap tail of the last emitted block
    /// is already stored, so it is left buffered and nothing is emitted.
    /// Once a fresh message joins it, the whole remainder (overlap included)
    /// goes out as one block.
    pub fn flush(&mut self, include_partial: bool) -> Result<Option<Block>, BuildError> {
        if !include_partial || self.buffer.len() <= self.emitted_prefix {
            return Ok(None);
        }

        let block = self.build_block(&self.buffer, true)?;
        info!(block_id = %block.id, message_count = block.message_count, "Flushed partial block");
        self.buffer.clear();
        self.emitted_prefix = 0;
        Ok(Some(block))
    }

    /// Absorb already persisted blocks so their messages are never admitted
    /// again and new ordinals continue after them. Emits nothing.
    pub fn prime_from_blocks(&mut self, blocks: &[Block]) {
        for block in blocks {
            for message in &block.messages {
                if let Some(id) = &message.id {
                    self.seen_ids.insert(id.clone());
                }
                if let Some(ordinal) = message.ordinal {
                    self.last_ordinal = self.last_ordinal.max(ordinal);
                }
            }
            self.last_ordinal = self.last_ordinal.max(block.ordinal_range.end);
        }
        debug!(
            blocks = blocks.len(),
            known_ids = self.seen_ids.len(),
            last_ordinal = self.last_ordinal,
            "Primed block builder"
        );
    }

    fn build_block(&self, window: &[StructuredMessage], partial: bool) -> Result<Block, BuildError> {
        let ordinal_range = OrdinalRange::spanning(window).ok_or(BuildError::EmptyWindow)?;
        let timestamp = chrono::Utc::now().timestamp_millis();
        let counter = BLOCK_COUNTER.fetch_add(1, Ordering::Relaxed);

        let raw = window
            .iter()
            .map(|msg| format!("{}: {}", msg.label(), msg.plain_text()))
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(Block {
            id: format!(
                "block-{}-{}-{}-{}",
                ordinal_range.start, ordinal_range.end, timestamp, counter
            ),
            session_url: self.session_url.clone().unwrap_or_default(),
            ordinal_range,
            timestamp,
            message_count: window.len(),
            messages: window.to_vec(),
            raw,
            meta: Some(BlockMeta {
                block_size: self.config.block_size,
                overlap: self.config.overlap,
                ordinals: window.iter().filter_map(|msg| msg.ordinal).collect(),
                partial,
            }),
            embedding: None,
        })
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new(BuilderConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::MessagePart;
    use pretty_assertions::assert_eq;

    fn message(id: &str, ordinal: u64) -> StructuredMessage {
        StructuredMessage {
            id: Some(id.to_string()),
            ordinal: Some(ordinal),
            role: Some("user".into()),
            parts: vec![MessagePart::text(format!("text {id}"))],
            ..Default::default()
        }
    }

    fn builder(size: usize, overlap: usize) -> BlockBuilder {
        let mut builder = BlockBuilder::new(BuilderConfig::new(size, overlap));
        builder.set_session_url("https://chat.example/c/1");
        builder
    }

    #[test]
    fn config_clamps_size_and_overlap() {
        let cfg = BuilderConfig::new(0, 5);
        assert_eq!((cfg.block_size(), cfg.overlap()), (1, 0));
        let cfg = BuilderConfig::new(4, 9);
        assert_eq!((cfg.block_size(), cfg.overlap()), (4, 3));
        assert_eq!(BuilderConfig::default().overlap(), 2);
    }

    #[test]
    fn windows_of_five_with_overlap_two() {
        let mut builder = builder(5, 2);
        let mut blocks = Vec::new();
        for n in 1..=12 {
            blocks.extend(builder.append(&message(&format!("m{n}"), n)).unwrap());
        }

        assert_eq!(blocks.len(), 3);
        let ranges: Vec<_> = blocks
            .iter()
            .map(|b| (b.ordinal_range.start, b.ordinal_range.end))
            .collect();
        assert_eq!(ranges, vec![(1, 5), (4, 8), (7, 11)]);
        for pair in blocks.windows(2) {
            let tail = &pair[0].messages[3..];
            let head = &pair[1].messages[..2];
            assert_eq!(tail, head);
        }

        let last = builder.flush(true).unwrap().expect("partial block");
        assert_eq!(last.meta.as_ref().map(|m| m.partial), Some(true));
        assert_eq!(last.ordinal_range, OrdinalRange { start: 10, end: 12 });
        assert!(builder.buffer().is_empty());
        assert_eq!(builder.flush(true).unwrap(), None);
    }

    #[test]
    fn flush_without_partial_keeps_remainder() {
        let mut builder = builder(5, 0);
        builder.append(&message("a", 1)).unwrap();
        builder.append(&message("b", 2)).unwrap();

        assert_eq!(builder.flush(false).unwrap(), None);
        assert_eq!(builder.buffer().len(), 2);
    }

    #[test]
    fn flush_skips_remainder_made_only_of_overlap() {
        let mut builder = builder(3, 1);
        for n in 1..=3 {
            builder.append(&message(&format!("m{n}"), n)).unwrap();
        }
        assert_eq!(builder.buffer().len(), 1);
        assert_eq!(builder.flush(true).unwrap(), None);
        assert_eq!(builder.buffer().len(), 1);

        builder.append(&message("m4", 4)).unwrap();
        let tail = builder.flush(true).unwrap().expect("fresh message forces a block");
        assert_eq!(tail.ordinal_range, OrdinalRange { start: 3, end: 4 });
        assert!(tail.meta.unwrap().partial);
        assert!(builder.buffer().is_empty());
    }

    #[test]
    fn duplicate_ids_are_ignored() {
        let mut builder = builder(2, 0);
        builder.append(&message("a", 1)).unwrap();
        assert!(builder.append(&message("a", 1)).unwrap().is_empty());
        assert_eq!(builder.buffer().len(), 1);
    }

    #[test]
    fn messages_without_id_are_never_deduplicated() {
        let mut builder = builder(10, 0);
        let anonymous = StructuredMessage {
            parts: vec![MessagePart::text("hi")],
            ..Default::default()
        };
        builder.append(&anonymous).unwrap();
        builder.append(&anonymous).unwrap();
        let ordinals: Vec<_> = builder.buffer().iter().map(|m| m.ordinal).collect();
        assert_eq!(ordinals, vec![Some(1), Some(2)]);
    }

    #[test]
    fn burst_cuts_multiple_blocks_in_one_call() {
        let mut builder = builder(4, 1);
        let burst: Vec<_> = (1..=11).map(|n| message(&format!("m{n}"), n)).collect();

        let blocks = builder.append_batch(&burst).unwrap();

        let ranges: Vec<_> = blocks
            .iter()
            .map(|b| (b.ordinal_range.start, b.ordinal_range.end))
            .collect();
        assert_eq!(ranges, vec![(1, 4), (4, 7), (7, 10)]);
        assert_eq!(builder.buffer().len(), 2);

        let mut single = BlockBuilder::new(BuilderConfig::new(1, 0));
        single.set_session_url("s");
        assert_eq!(single.append(&message("x", 9)).unwrap().len(), 1);
        assert!(single.buffer().is_empty());
    }

    #[test]
    fn priming_moves_cursor_past_stored_ordinals() {
        let mut source = builder(5, 0);
        let mut stored = Vec::new();
        for n in 1..=5 {
            stored.extend(source.append(&message(&format!("m{n}"), n)).unwrap());
        }
        assert_eq!(stored[0].ordinal_range, OrdinalRange { start: 1, end: 5 });

        let mut builder = builder(5, 0);
        builder.prime_from_blocks(&stored);
        assert!(builder.buffer().is_empty());
        assert!(builder.append(&message("m3", 3)).unwrap().is_empty());
        assert!(builder.buffer().is_empty());

        let fresh = StructuredMessage {
            id: Some("new".into()),
            parts: vec![MessagePart::text("later")],
            ..Default::default()
        };
        builder.append(&fresh).unwrap();
        assert!(builder.buffer()[0].ordinal.unwrap() >= 6);
    }

    #[test]
    fn changing_session_resets_state() {
        let mut builder = builder(5, 0);
        builder.append(&message("a", 4)).unwrap();

        builder.set_session_url("https://chat.example/c/1");
        assert_eq!(builder.buffer().len(), 1);
        builder.set_session_url("   ");
        assert_eq!(builder.buffer().len(), 1);

        builder.set_session_url("https://chat.example/c/2");
        assert!(builder.buffer().is_empty());
        assert!(!builder.has_seen("a"));
        assert_eq!(builder.last_ordinal(), 0);
    }

    #[test]
    fn block_raw_text_and_ids() {
        let mut builder = builder(2, 0);
        let mut assistant = message("b", 2);
        assistant.role = Some("assistant".into());
        assistant.speaker = Some("Helper".into());
        builder.append(&message("a", 1)).unwrap();
        let block = builder.append(&assistant).unwrap().remove(0);

        assert_eq!(block.raw, "user: text a\n\nHelper: text b");
        assert!(block.id.starts_with("block-1-2-"));
        assert_eq!(block.session_url, "https://chat.example/c/1");
        assert_eq!(block.meta.unwrap().ordinals, vec![1, 2]);

        builder.append(&message("c", 3)).unwrap();
        let next = builder.append(&message("d", 4)).unwrap().remove(0);
        assert_ne!(block.id, next.id);
    }
}
