use serde::{Deserialize, Serialize};

use crate::arena::ElementHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    #[default]
    Text,
    Code,
    Quote,
    List,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(default)]
    pub kind: PartKind,
    pub text: String,
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: PartKind::Text,
            text: text.into(),
        }
    }
}

/// One chat message as classified by the host adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StructuredMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub ordinal: Option<u64>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl StructuredMessage {
    /// False while the surface has not rendered any text for this message yet.
    pub fn has_content(&self) -> bool {
        self.parts.iter().any(|part| !part.text.trim().is_empty())
    }

    pub fn label(&self) -> &str {
        self.speaker
            .as_deref()
            .or(self.role.as_deref())
            .unwrap_or("unknown")
    }

    pub fn plain_text(&self) -> String {
        self.parts
            .iter()
            .map(|part| part.text.trim_end())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrdinalRange {
    pub start: u64,
    pub end: u64,
}

impl OrdinalRange {
    /// Min/max ordinal over `messages`, ignoring messages without one.
    pub fn spanning(messages: &[StructuredMessage]) -> Option<Self> {
        let mut ordinals = messages.iter().filter_map(|msg| msg.ordinal);
        let first = ordinals.next()?;
        let (start, end) = ordinals.fold((first, first), |(lo, hi), ord| (lo.min(ord), hi.max(ord)));
        Some(Self { start, end })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub block_size: usize,
    pub overlap: usize,
    pub ordinals: Vec<u64>,
    #[serde(default)]
    pub partial: bool,
}

/// An immutable window of consecutive messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    pub session_url: String,
    pub ordinal_range: OrdinalRange,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub message_count: usize,
    pub messages: Vec<StructuredMessage>,
    pub raw: String,
    #[serde(default)]
    pub meta: Option<BlockMeta>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

/// Emitted by the indexer the first time it sees a message element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageSeen {
    pub element: ElementHandle,
    pub ordinal: u64,
    pub index: usize,
    pub message_id: Option<String>,
    pub channel: Option<String>,
    /// Epoch milliseconds.
    pub timestamp: i64,
}
