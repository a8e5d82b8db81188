//! Streaming capture of chat transcripts into overlapping, persisted blocks.
//!
//! [`indexer::Indexer`] watches a [`surface::MessageSurface`] and announces new
//! message elements; [`stream::MessageStream`] extracts them through a
//! [`surface::CaptureAdapter`], feeds a [`builder::BlockBuilder`] and saves the
//! resulting blocks through [`storage::BlockStorage`].

pub mod arena;
pub mod builder;
pub mod config;
pub mod error;
pub mod health;
pub mod indexer;
pub mod inspector;
pub mod metrics;
pub mod schema;
pub mod storage;
pub mod stream;
pub mod surface;

pub use builder::{BlockBuilder, BuilderConfig};
pub use config::Config;
pub use error::{BuildError, ConfigError, StorageError, StreamError, SurfaceError};
pub use indexer::{Indexer, IndexerConfig};
pub use schema::{Block, MessageSeen, StructuredMessage};
pub use storage::{BlockStorage, StorageConfig};
pub use stream::{MessageStream, StreamConfig};
