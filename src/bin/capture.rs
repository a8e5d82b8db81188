// Capture replay
// Feeds a JSON-lines transcript (one StructuredMessage per line) through the
// full indexer -> stream -> storage pipeline.
// Run with: cargo run --bin capture -- transcript.jsonl

use std::sync::Arc;

use chatlog_capture::{
    config::Config,
    indexer::Indexer,
    schema::StructuredMessage,
    storage::BlockStorage,
    stream::MessageStream,
    surface::MemorySurface,
};
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args()
        .nth(1)
        .ok_or("usage: capture <transcript.jsonl>")?;
    let cfg = Config::from_env()?;

    let storage = BlockStorage::open(&cfg.storage());
    let surface = Arc::new(MemorySurface::new(cfg.session_url.clone()));
    let indexer = Indexer::new(surface.clone(), cfg.indexer());
    let stream = MessageStream::new(cfg.stream(), surface.clone(), storage.clone());

    stream.start(indexer.subscribe_messages()).await?;
    indexer.start();
    info!(path = %path, backend = ?storage.backend_kind(), "Replaying transcript");

    let transcript = tokio::fs::read_to_string(&path).await?;
    let mut pushed = 0usize;
    for (line_no, line) in transcript.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StructuredMessage>(line) {
            Ok(message) => {
                surface.push(message);
                indexer.notify_mutation();
                pushed += 1;
            }
            Err(e) => warn!(line = line_no + 1, error = %e, "Skipping malformed transcript line"),
        }
    }

    // Let the last scan run and every settle timer fire before flushing.
    let stream_cfg = cfg.stream();
    tokio::time::sleep(cfg.indexer().frame_interval * 2 + stream_cfg.settle_delay * 2).await;

    let tail = stream.flush(true).await?;
    stream.stop().await;
    indexer.stop();

    let stats = storage.stats().await?;
    info!(
        pushed,
        partial_blocks = tail.len(),
        total_blocks = stats.total_blocks,
        total_messages = stats.total_messages,
        sessions = stats.sessions,
        "Replay finished"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
