//! Keeps message elements and their logical position in step.
//!
//! The host calls [`Indexer::notify_mutation`] whenever the message
//! container changes. Notifications are coalesced so at most one scan runs
//! per frame. Every scan tags each element with its index and ordinal
//! (1 = newest) and announces elements it has not seen before.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::arena::{ElementHandle, SeenRegistry};
use crate::metrics::{MESSAGES_SEEN, SCAN_DURATION};
use crate::record_duration;
use crate::schema::MessageSeen;
use crate::surface::{MessageSurface, NodeTag};

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Minimum spacing between two scans.
    pub frame_interval: Duration,
    pub event_capacity: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(16),
            event_capacity: 1024,
        }
    }
}

#[derive(Clone)]
pub struct Indexer {
    inner: Arc<IndexerInner>,
}

struct IndexerInner {
    surface: Arc<dyn MessageSurface>,
    config: IndexerConfig,
    event_tx: broadcast::Sender<MessageSeen>,
    state: Mutex<IndexerState>,
}

#[derive(Default)]
struct IndexerState {
    container: Option<ElementHandle>,
    registry: SeenRegistry,
    tracked: Vec<(ElementHandle, u64)>,
    mutation_tx: Option<mpsc::UnboundedSender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Indexer {
    pub fn new(surface: Arc<dyn MessageSurface>, config: IndexerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(IndexerInner {
                surface,
                config,
                event_tx,
                state: Mutex::new(IndexerState::default()),
            }),
        }
    }

    /// Begin observing. Runs an initial scan, then one scan per burst of
    /// mutation notifications. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut state = self.inner.state();
        if state.task.is_some() {
            debug!("Indexer already running");
            return;
        }

        let (mutation_tx, mutation_rx) = mpsc::unbounded_channel();
        state.mutation_tx = Some(mutation_tx);
        state.task = Some(spawn_observe_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.frame_interval,
            mutation_rx,
        ));
        info!("Indexer started");
    }

    /// Stop observing and forget every element seen so far; the next
    /// `start` behaves like a cold start.
    pub fn stop(&self) {
        let mut state = self.inner.state();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        *state = IndexerState::default();
        info!("Indexer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().task.is_some()
    }

    /// Host hook for container mutations.
    pub fn notify_mutation(&self) {
        if let Some(tx) = &self.inner.state().mutation_tx {
            let _ = tx.send(());
        }
    }

    /// Scan immediately, bypassing the frame debounce.
    pub fn scan_now(&self) -> Vec<MessageSeen> {
        self.inner.scan()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessageSeen> {
        self.inner.event_tx.subscribe()
    }

    /// Elements and ordinals from the most recent scan, oldest first.
    pub fn tracked(&self) -> Vec<(ElementHandle, u64)> {
        self.inner.state().tracked.clone()
    }
}

impl IndexerInner {
    fn state(&self) -> MutexGuard<'_, IndexerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reads and reconciles under one lock so concurrent scans apply their
    /// snapshots in the order they were taken.
    fn scan(&self) -> Vec<MessageSeen> {
        let mut state = self.state();
        let scan = match record_duration!(SCAN_DURATION, { self.surface.scan() }) {
            Ok(scan) => scan,
            Err(err) => {
                error!(error = %err, "Message container scan failed");
                return Vec::new();
            }
        };

        if state.container != Some(scan.container) {
            if state.container.is_some() {
                info!("Message container replaced, resetting seen elements");
            }
            state.registry.clear();
            state.container = Some(scan.container);
        }

        let total = scan.nodes.len();
        let timestamp = chrono::Utc::now().timestamp_millis();
        let mut tracked = Vec::with_capacity(total);
        let mut events = Vec::new();

        for (index, node) in scan.nodes.iter().enumerate() {
            let ordinal = (total - index) as u64;
            let tag = NodeTag {
                index,
                ordinal,
                role: node.role.clone(),
                channel: node.channel.clone(),
            };
            if let Err(err) = self.surface.tag(node.handle, &tag) {
                warn!(element = ?node.handle, error = %err, "Failed to tag message element");
            }
            tracked.push((node.handle, ordinal));

            if state.registry.insert(node.handle) {
                events.push(MessageSeen {
                    element: node.handle,
                    ordinal,
                    index,
                    message_id: node.message_id.clone(),
                    channel: node.channel.clone(),
                    timestamp,
                });
            }
        }

        let present: Vec<ElementHandle> = tracked.iter().map(|(handle, _)| *handle).collect();
        state.registry.retain(&present);
        state.tracked = tracked;
        drop(state);

        if !events.is_empty() {
            debug!(new = events.len(), total, "Indexed message elements");
        }
        for event in &events {
            MESSAGES_SEEN.inc();
            // No receivers is fine; the stream may not be attached yet.
            let _ = self.event_tx.send(event.clone());
        }
        events
    }
}

fn spawn_observe_loop(
    inner: Weak<IndexerInner>,
    frame_interval: Duration,
    mut mutation_rx: mpsc::UnboundedReceiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match inner.upgrade() {
            Some(indexer) => {
                indexer.scan();
            }
            None => return,
        }

        while mutation_rx.recv().await.is_some() {
            time::sleep(frame_interval).await;
            while mutation_rx.try_recv().is_ok() {}

            let Some(indexer) = inner.upgrade() else {
                break;
            };
            indexer.scan();
        }
        debug!("Indexer observe loop exited");
    })
}
