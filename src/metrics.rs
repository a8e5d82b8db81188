use prometheus::{Counter, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tracing::error;

lazy_static::lazy_static! {
    // Indexer metrics
    pub static ref MESSAGES_SEEN: Counter = Counter::with_opts(
        Opts::new("capture_messages_seen_total", "Message elements observed for the first time")
    ).expect("valid metric options");

    pub static ref SCAN_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("capture_scan_duration_seconds", "Time spent scanning the message container")
    ).expect("valid metric options");

    // Stream metrics
    pub static ref MESSAGES_COMMITTED: Counter = Counter::with_opts(
        Opts::new("capture_messages_committed_total", "Messages committed to the block builder")
    ).expect("valid metric options");

    pub static ref MESSAGES_DROPPED: Counter = Counter::with_opts(
        Opts::new("capture_messages_dropped_total", "Messages dropped after exhausting extraction retries")
    ).expect("valid metric options");

    pub static ref EXTRACTION_RETRIES: Counter = Counter::with_opts(
        Opts::new("capture_extraction_retries_total", "Extraction attempts rescheduled because content was not rendered")
    ).expect("valid metric options");

    pub static ref PRIMED_BLOCKS: Counter = Counter::with_opts(
        Opts::new("capture_primed_blocks_total", "Stored blocks loaded to prime a session")
    ).expect("valid metric options");

    // Block metrics
    pub static ref BLOCKS_EMITTED: Counter = Counter::with_opts(
        Opts::new("capture_blocks_emitted_total", "Blocks cut by the block builder")
    ).expect("valid metric options");

    pub static ref BLOCKS_PERSISTED: Counter = Counter::with_opts(
        Opts::new("capture_blocks_persisted_total", "Blocks written to storage")
    ).expect("valid metric options");

    pub static ref BLOCK_PERSIST_FAILURES: Counter = Counter::with_opts(
        Opts::new("capture_block_persist_failures_total", "Block writes rejected by storage")
    ).expect("valid metric options");

    pub static ref BLOCK_SAVE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("capture_block_save_duration_seconds", "Time spent saving one block")
    ).expect("valid metric options");
}

pub struct MetricsRegistry {
    registry: Registry,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(MESSAGES_SEEN.clone()),
            Box::new(SCAN_DURATION.clone()),
            Box::new(MESSAGES_COMMITTED.clone()),
            Box::new(MESSAGES_DROPPED.clone()),
            Box::new(EXTRACTION_RETRIES.clone()),
            Box::new(PRIMED_BLOCKS.clone()),
            Box::new(BLOCKS_EMITTED.clone()),
            Box::new(BLOCKS_PERSISTED.clone()),
            Box::new(BLOCK_PERSIST_FAILURES.clone()),
            Box::new(BLOCK_SAVE_DURATION.clone()),
        ];
        for collector in collectors {
            if let Err(err) = registry.register(collector) {
                error!("Failed to register metric: {}", err);
            }
        }

        Self { registry }
    }

    pub fn gather_metrics(&self) -> String {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&metric_families).unwrap_or_else(|e| {
            error!("Failed to encode metrics: {}", e);
            String::new()
        })
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[macro_export]
macro_rules! record_duration {
    ($histogram:expr, $code:block) => {{
        let _timer = $histogram.start_timer();
        $code
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathered_text_names_capture_metrics() {
        let registry = MetricsRegistry::new();
        BLOCKS_EMITTED.inc();
        let text = registry.gather_metrics();
        assert!(text.contains("capture_blocks_emitted_total"));
        assert!(text.contains("capture_block_save_duration_seconds"));
    }
}
