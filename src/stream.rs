//! Turns "element seen" events into committed messages and persisted blocks.
//!
//! ```text
//! MessageSeen ──> settle delay ──> extract ──┬─> commit ──> BlockBuilder ──> persist queue ──> storage
//!                                            └─> not rendered: retry (bounded), then drop
//! ```
//!
//! Nothing is extracted until the current session has been primed from
//! storage; events that arrive meanwhile wait in a backlog and are replayed
//! in arrival order. Blocks are saved by one worker, one at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::builder::{BlockBuilder, BuilderConfig};
use crate::error::{StorageResult, StreamError};
use crate::metrics::{
    BLOCKS_EMITTED, BLOCKS_PERSISTED, BLOCK_PERSIST_FAILURES, BLOCK_SAVE_DURATION,
    EXTRACTION_RETRIES, MESSAGES_COMMITTED, MESSAGES_DROPPED, PRIMED_BLOCKS,
};
use crate::schema::{Block, MessageSeen, StructuredMessage};
use crate::storage::BlockStorage;
use crate::surface::CaptureAdapter;

/// Session key used when the adapter cannot name one.
pub const UNKNOWN_SESSION: &str = "unknown-session";

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub builder: BuilderConfig,
    /// Wait before the first extraction attempt.
    pub settle_delay: Duration,
    pub retry_interval: Duration,
    /// Total extraction attempts per event, the first one included.
    pub max_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            builder: BuilderConfig::default(),
            settle_delay: Duration::from_millis(300),
            retry_interval: Duration::from_millis(250),
            max_attempts: 6,
        }
    }
}

#[derive(Clone)]
pub struct MessageStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    config: StreamConfig,
    adapter: Arc<dyn CaptureAdapter>,
    storage: BlockStorage,
    message_tx: broadcast::Sender<StructuredMessage>,
    block_tx: broadcast::Sender<Block>,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
    priming_tx: watch::Sender<bool>,
    /// Bumped by `stop`; work scheduled under an older epoch is inert.
    epoch: Arc<AtomicU64>,
    state: Mutex<StreamState>,
}

struct StreamState {
    running: bool,
    builder: BlockBuilder,
    primed_session: Option<String>,
    priming: Option<Priming>,
    prime_generation: u64,
    backlog: Vec<MessageSeen>,
    timers: HashMap<u64, JoinHandle<()>>,
    next_timer: u64,
    pump: Option<JoinHandle<()>>,
}

struct Priming {
    generation: u64,
    session: String,
    task: JoinHandle<()>,
}

enum PersistJob {
    Save { block: Block, epoch: u64 },
    Barrier(oneshot::Sender<()>),
}

impl MessageStream {
    /// Must be called inside a tokio runtime: spawns the persistence worker.
    pub fn new(config: StreamConfig, adapter: Arc<dyn CaptureAdapter>, storage: BlockStorage) -> Self {
        let (message_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (block_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let (priming_tx, _) = watch::channel(false);
        let epoch = Arc::new(AtomicU64::new(0));

        spawn_persist_worker(storage.clone(), block_tx.clone(), epoch.clone(), persist_rx);

        let builder = BlockBuilder::new(config.builder);
        Self {
            inner: Arc::new(StreamInner {
                config,
                adapter,
                storage,
                message_tx,
                block_tx,
                persist_tx,
                priming_tx,
                epoch,
                state: Mutex::new(StreamState {
                    running: false,
                    builder,
                    primed_session: None,
                    priming: None,
                    prime_generation: 0,
                    backlog: Vec::new(),
                    timers: HashMap::new(),
                    next_timer: 0,
                    pump: None,
                }),
            }),
        }
    }

    /// Start consuming indexer events.
    pub async fn start(&self, events: broadcast::Receiver<MessageSeen>) -> Result<(), StreamError> {
        let mut state = self.inner.state.lock().await;
        if state.running {
            return Err(StreamError::AlreadyRunning);
        }
        state.running = true;
        state.pump = Some(spawn_event_pump(Arc::downgrade(&self.inner), events));
        info!("Message stream started");
        Ok(())
    }

    /// Cancel every pending timer and drop the backlog. Once this returns no
    /// further message is committed and no subscriber is notified; a save
    /// that is already running still completes.
    pub async fn stop(&self) {
        let (timers, pump) = {
            let mut state = self.inner.state.lock().await;
            if !state.running {
                return;
            }
            state.running = false;
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);

            let timers: Vec<JoinHandle<()>> = state.timers.drain().map(|(_, timer)| timer).collect();
            for timer in &timers {
                timer.abort();
            }
            if let Some(priming) = state.priming.take() {
                priming.task.abort();
            }
            let dropped = state.backlog.len();
            state.backlog.clear();
            self.inner.priming_tx.send_replace(false);

            let pump = state.pump.take();
            if let Some(pump) = &pump {
                pump.abort();
            }
            info!(cancelled_timers = timers.len(), dropped_backlog = dropped, "Message stream stopped");
            (timers, pump)
        };

        futures::future::join_all(timers).await;
        if let Some(pump) = pump {
            let _ = pump.await;
        }
    }

    /// Feed one event directly, bypassing the indexer subscription.
    pub async fn ingest(&self, event: MessageSeen) {
        self.inner.handle_event(event).await;
    }

    /// Wait for priming, flush the builder, and wait until every queued
    /// block has been handed to storage.
    pub async fn flush(&self, include_partial: bool) -> Result<Vec<Block>, StreamError> {
        let mut priming = self.inner.priming_tx.subscribe();
        let _ = priming.wait_for(|in_flight| !*in_flight).await;

        let blocks: Vec<Block> = {
            let mut state = self.inner.state.lock().await;
            state.builder.flush(include_partial)?.into_iter().collect()
        };
        self.inner.enqueue_blocks(blocks.clone());
        self.inner.drain_persistence().await?;
        Ok(blocks)
    }

    pub fn subscribe_blocks(&self) -> broadcast::Receiver<Block> {
        self.inner.block_tx.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<StructuredMessage> {
        self.inner.message_tx.subscribe()
    }

    pub async fn get_buffer(&self) -> Vec<StructuredMessage> {
        self.inner.state.lock().await.builder.buffer().to_vec()
    }

    /// Session the builder is currently primed for.
    pub async fn session(&self) -> Option<String> {
        self.inner.state.lock().await.primed_session.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running
    }

    pub fn storage(&self) -> &BlockStorage {
        &self.inner.storage
    }
}

impl StreamInner {
    async fn handle_event(self: &Arc<Self>, event: MessageSeen) {
        let mut state = self.state.lock().await;
        if !state.running {
            debug!(element = ?event.element, "Ignoring event while stream is stopped");
            return;
        }

        self.ensure_session(&mut state);
        if state.priming.is_some() {
            state.backlog.push(event);
            return;
        }
        self.schedule(&mut state, vec![event], 1, self.config.settle_delay);
    }

    fn resolve_session(&self, state: &StreamState) -> String {
        self.adapter
            .session_url()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .or_else(|| state.priming.as_ref().map(|p| p.session.clone()))
            .or_else(|| state.primed_session.clone())
            .unwrap_or_else(|| UNKNOWN_SESSION.to_string())
    }

    /// Start priming when the adapter reports a session other than the one
    /// primed (or being primed).
    fn ensure_session(self: &Arc<Self>, state: &mut StreamState) {
        let session = self.resolve_session(state);
        let target = state
            .priming
            .as_ref()
            .map(|p| p.session.as_str())
            .or(state.primed_session.as_deref());
        if target == Some(session.as_str()) {
            return;
        }
        self.begin_priming(state, session);
    }

    fn begin_priming(self: &Arc<Self>, state: &mut StreamState, session: String) {
        if let Some(superseded) = state.priming.take() {
            superseded.task.abort();
            debug!(session = %superseded.session, generation = superseded.generation, "Superseded priming");
        }
        state.prime_generation += 1;
        let generation = state.prime_generation;
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.priming_tx.send_replace(true);

        let inner = Arc::clone(self);
        let target = session.clone();
        let task = tokio::spawn(async move {
            let loaded = inner.storage.get_by_session(&target).await;
            inner.finish_priming(generation, epoch, target, loaded).await;
        });
        info!(session = %session, generation, "Priming session from storage");
        state.priming = Some(Priming {
            generation,
            session,
            task,
        });
    }

    async fn finish_priming(
        self: &Arc<Self>,
        generation: u64,
        epoch: u64,
        session: String,
        loaded: StorageResult<Vec<Block>>,
    ) {
        let mut state = self.state.lock().await;
        let current = state.priming.as_ref().map(|p| p.generation);
        if current != Some(generation) || self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(session = %session, generation, "Discarding stale priming result");
            return;
        }
        state.priming = None;
        state.builder.set_session_url(&session);

        match loaded {
            Ok(blocks) => {
                PRIMED_BLOCKS.inc_by(blocks.len() as f64);
                state.builder.prime_from_blocks(&blocks);
                info!(session = %session, blocks = blocks.len(), "Session primed");
            }
            Err(err) => {
                warn!(session = %session, error = %err, "Failed to load stored blocks, continuing unprimed");
            }
        }
        state.primed_session = Some(session);
        self.priming_tx.send_replace(false);

        let backlog = std::mem::take(&mut state.backlog);
        if !backlog.is_empty() {
            debug!(events = backlog.len(), "Replaying events queued during priming");
            self.schedule(&mut state, backlog, 1, self.config.settle_delay);
        }
    }

    /// Run one extraction attempt for `events`, in order, after `delay`.
    fn schedule(self: &Arc<Self>, state: &mut StreamState, events: Vec<MessageSeen>, attempt: u32, delay: Duration) {
        let timer_id = state.next_timer;
        state.next_timer += 1;
        let epoch = self.epoch.load(Ordering::SeqCst);

        let inner = Arc::clone(self);
        let timer = tokio::spawn(async move {
            time::sleep(delay).await;
            inner.run_attempt(timer_id, epoch, events, attempt).await;
        });
        state.timers.insert(timer_id, timer);
    }

    async fn run_attempt(self: &Arc<Self>, timer_id: u64, epoch: u64, events: Vec<MessageSeen>, attempt: u32) {
        let mut state = self.state.lock().await;
        state.timers.remove(&timer_id);
        if !state.running || self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }

        self.ensure_session(&mut state);
        for event in events {
            if state.priming.is_some() {
                state.backlog.push(event);
                continue;
            }

            match self.adapter.collect_structured_message(event.element) {
                Some(message) if message.has_content() => self.commit(&mut state, &event, message),
                _ if attempt < self.config.max_attempts => {
                    EXTRACTION_RETRIES.inc();
                    debug!(element = ?event.element, attempt, "Message not rendered yet, retrying");
                    self.schedule(&mut state, vec![event], attempt + 1, self.config.retry_interval);
                }
                _ => {
                    MESSAGES_DROPPED.inc();
                    warn!(
                        element = ?event.element,
                        message_id = ?event.message_id,
                        attempts = attempt,
                        "Dropping message that never rendered content"
                    );
                }
            }
        }
    }

    fn commit(&self, state: &mut StreamState, event: &MessageSeen, mut message: StructuredMessage) {
        if message.id.is_none() {
            message.id = event.message_id.clone();
        }
        if message.ordinal.is_none() {
            message.ordinal = Some(event.ordinal);
        }
        if message.channel.is_none() {
            message.channel = event.channel.clone();
        }

        MESSAGES_COMMITTED.inc();
        let _ = self.message_tx.send(message.clone());

        match state.builder.append(&message) {
            Ok(blocks) => self.enqueue_blocks(blocks),
            Err(err) => error!(message_id = ?message.id, error = %err, "Block builder rejected message"),
        }
    }

    fn enqueue_blocks(&self, blocks: Vec<Block>) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        for block in blocks {
            BLOCKS_EMITTED.inc();
            let block_id = block.id.clone();
            if self.persist_tx.send(PersistJob::Save { block, epoch }).is_err() {
                error!(block_id = %block_id, "Persistence worker is gone, block lost");
            }
        }
    }

    async fn drain_persistence(&self) -> Result<(), StreamError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.persist_tx
            .send(PersistJob::Barrier(done_tx))
            .map_err(|_| StreamError::PersistenceClosed)?;
        done_rx.await.map_err(|_| StreamError::PersistenceClosed)
    }
}

fn spawn_event_pump(inner: Weak<StreamInner>, mut events: broadcast::Receiver<MessageSeen>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Some(stream) = inner.upgrade() else {
                        break;
                    };
                    stream.handle_event(event).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Message stream fell behind indexer events");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Message stream event pump exited");
    })
}

/// Single consumer of the persistence queue: exactly one save in flight.
fn spawn_persist_worker(
    storage: BlockStorage,
    block_tx: broadcast::Sender<Block>,
    epoch: Arc<AtomicU64>,
    mut jobs: mpsc::UnboundedReceiver<PersistJob>,
) {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            match job {
                PersistJob::Save { block, epoch: emitted_in } => {
                    let result = {
                        let _timer = BLOCK_SAVE_DURATION.start_timer();
                        storage.save(&block).await
                    };
                    match result {
                        Ok(()) => {
                            BLOCKS_PERSISTED.inc();
                            debug!(block_id = %block.id, session = %block.session_url, "Persisted block");
                        }
                        Err(err) => {
                            BLOCK_PERSIST_FAILURES.inc();
                            error!(block_id = %block.id, error = %err, class = ?err.class(), "Failed to persist block");
                        }
                    }
                    if epoch.load(Ordering::SeqCst) == emitted_in {
                        let _ = block_tx.send(block);
                    }
                }
                PersistJob::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Block persistence worker exited");
    });
}
