//! The export service — follows the chain and keeps the warehouse in sync.
//!
//! # Lifecycle
//! `Stopped → Starting → Running ⇄ Reconciling → Stopping → Stopped`, or
//! `Failed` when a fatal error ends the loop.
//!
//! # Loop
//! One task consumes the block subscription. For each block:
//!   - Verify parent linkage against the tracked head (reorg check)
//!   - Fill height gaps by lookup, skip re-delivered identical blocks
//!   - Extract records and append them to the batch buffer
//!   - When a flush is due, hand the drained batch to the export task
//!
//! At most one export runs at a time. While it runs and a full batch is
//! already buffered, the loop stops reading the chain, so batches stay close
//! to `batch_size`. The cursor moves to the batch's last block after the
//! export succeeds, and only if that block is still canonical.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

use crate::buffer::{BatchBuffer, ExportBatch};
use crate::builder::ServiceBuilder;
use crate::checkpoint::{CursorManager, CursorStore};
use crate::cursor::Cursor;
use crate::error::IndexerError;
use crate::exporter::{ExportReport, WarehouseExporter, WarehouseSink};
use crate::extractor;
use crate::feed::{BlockStream, ChainFeed};
use crate::indexer::{IndexerState, ServiceConfig};
use crate::reorg;
use crate::tracker::BlockTracker;
use crate::types::{BlockRef, BlockWithReceipts};

/// How many times one incoming block may trigger reconciliation before the
/// service gives up on a chain that keeps changing underneath it.
const MAX_RECONCILE_ATTEMPTS: usize = 8;

/// Upper bound on the flush timer period.
const MAX_TICK: Duration = Duration::from_secs(1);

/// A long-running component managed by the host node.
#[async_trait]
pub trait Service: Send + Sync {
    /// Service name for logs.
    fn name(&self) -> &str;

    /// Load state and spawn the background loop. Returns once the loop is
    /// subscribed to the chain.
    async fn start(&self) -> Result<(), IndexerError>;

    /// Shut down and wait for the loop to finish. Returns the loop's fatal
    /// error, if it failed.
    async fn stop(&self) -> Result<(), IndexerError>;
}

/// Metrics snapshot for the export service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMetrics {
    pub blocks_processed: u64,
    pub records_extracted: u64,
    pub batches_exported: u64,
    pub records_exported: u64,
    pub export_attempts: u64,
    pub reorgs: u64,
    pub records_discarded: u64,
    pub resubscriptions: u64,
}

/// State shared between the service handle and its loop.
#[derive(Clone)]
struct Shared {
    state: Arc<watch::Sender<IndexerState>>,
    metrics: Arc<Mutex<ServiceMetrics>>,
    cursor: Arc<Mutex<Option<Cursor>>>,
}

impl Shared {
    fn set_state(&self, state: IndexerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "service state changed");
        }
    }

    fn record(&self, update: impl FnOnce(&mut ServiceMetrics)) {
        if let Ok(mut metrics) = self.metrics.lock() {
            update(&mut metrics);
        }
    }

    fn publish_cursor(&self, cursor: Option<Cursor>) {
        if let Ok(mut current) = self.cursor.lock() {
            *current = cursor;
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), IndexerError>>,
}

/// Exports every canonical block's records to the warehouse.
///
/// ```rust,no_run
/// # async fn example() -> Result<(), etherquery_core::IndexerError> {
/// use std::sync::Arc;
/// use etherquery_core::{IndexerService, MemoryChainFeed, MemoryCursorStore, MemorySink, Service, ServiceConfig};
///
/// let service = IndexerService::new(
///     ServiceConfig::default(),
///     Arc::new(MemoryChainFeed::new()),
///     Arc::new(MemoryCursorStore::new()),
///     Arc::new(MemorySink::new()),
/// );
/// service.start().await?;
/// service.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct IndexerService {
    config: ServiceConfig,
    feed: Arc<dyn ChainFeed>,
    store: Arc<dyn CursorStore>,
    sink: Arc<dyn WarehouseSink>,
    shared: Shared,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl IndexerService {
    pub fn new(
        config: ServiceConfig,
        feed: Arc<dyn ChainFeed>,
        store: Arc<dyn CursorStore>,
        sink: Arc<dyn WarehouseSink>,
    ) -> Self {
        let (state, _) = watch::channel(IndexerState::Stopped);
        Self {
            config,
            feed,
            store,
            sink,
            shared: Shared {
                state: Arc::new(state),
                metrics: Arc::new(Mutex::new(ServiceMetrics::default())),
                cursor: Arc::new(Mutex::new(None)),
            },
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Fluent construction.
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> IndexerState {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<IndexerState> {
        self.shared.state.subscribe()
    }

    /// The last persisted cursor.
    pub fn cursor(&self) -> Option<Cursor> {
        self.shared.cursor.lock().map(|c| *c).unwrap_or(None)
    }

    /// Returns a snapshot of current metrics.
    pub fn metrics(&self) -> ServiceMetrics {
        self.shared
            .metrics
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Wait until the loop terminates on its own (fatal error or a `stop`
    /// from elsewhere), then return its result.
    pub async fn wait(&self) -> Result<(), IndexerError> {
        let mut state = self.subscribe_state();
        let _ = state.wait_for(|s| !s.is_active()).await;
        self.stop().await
    }
}

#[async_trait]
impl Service for IndexerService {
    fn name(&self) -> &str {
        "etherquery"
    }

    async fn start(&self) -> Result<(), IndexerError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                return Err(IndexerError::InvalidState {
                    state: self.state(),
                });
            }
        }
        self.config.validate()?;
        self.shared.set_state(IndexerState::Starting);

        let mut worker = Worker::new(
            self.config.clone(),
            Arc::clone(&self.feed),
            Arc::clone(&self.store),
            Arc::clone(&self.sink),
            self.shared.clone(),
        );
        let stream = match worker.prepare().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "service failed to start");
                self.shared.set_state(IndexerState::Failed);
                return Err(e);
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(stream, shutdown_rx));
        *running = Some(Running { shutdown, handle });
        tracing::info!(
            project = %self.config.project,
            dataset = %self.config.dataset,
            sink = self.sink.name(),
            "export service started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), IndexerError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        // The loop may already be gone; that is fine.
        let _ = running.shutdown.send(true);
        match running.handle.await {
            Ok(result) => result,
            Err(e) => {
                self.shared.set_state(IndexerState::Failed);
                Err(IndexerError::Aborted {
                    reason: format!("service task failed: {e}"),
                })
            }
        }
    }
}

// ─── Loop ─────────────────────────────────────────────────────────────────────

struct InFlight {
    last_block: BlockRef,
    handle: JoinHandle<Result<ExportReport, IndexerError>>,
}

enum FeedState {
    Live(BlockStream),
    Backoff(Instant),
}

enum Event {
    Shutdown,
    ExportDone(Result<Result<ExportReport, IndexerError>, JoinError>),
    Tick,
    Block(Option<Result<BlockWithReceipts, IndexerError>>),
    Resubscribe,
}

enum Ingest {
    Done,
    Diverged { at: u64 },
}

struct Worker {
    config: ServiceConfig,
    feed: Arc<dyn ChainFeed>,
    exporter: Arc<WarehouseExporter>,
    cursor: CursorManager,
    tracker: BlockTracker,
    buffer: BatchBuffer,
    in_flight: Option<InFlight>,
    /// Height to accept first while the tracker is empty.
    first_height: u64,
    shared: Shared,
}

impl Worker {
    fn new(
        config: ServiceConfig,
        feed: Arc<dyn ChainFeed>,
        store: Arc<dyn CursorStore>,
        sink: Arc<dyn WarehouseSink>,
        shared: Shared,
    ) -> Self {
        let window = usize::try_from(config.max_reorg_depth)
            .unwrap_or(usize::MAX)
            .saturating_add(1);
        Self {
            exporter: Arc::new(WarehouseExporter::new(sink, config.retry_config())),
            cursor: CursorManager::new(store, config.cursor_key()),
            tracker: BlockTracker::new(window),
            buffer: BatchBuffer::new(config.batch_size, config.batch_interval()),
            in_flight: None,
            first_height: config.start_block,
            feed,
            shared,
            config,
        }
    }

    /// Load the cursor, seed the tracker and subscribe.
    async fn prepare(&mut self) -> Result<BlockStream, IndexerError> {
        match self.cursor.load().await? {
            Some(cursor) => {
                tracing::info!(
                    block = cursor.block_number,
                    hash = %cursor.block_hash,
                    "Resuming from cursor"
                );
                let resume = self.resume_point(cursor).await?;
                if resume.number != cursor.block_number || resume.hash != cursor.block_hash {
                    tracing::warn!(
                        cursor = %cursor,
                        ancestor = %resume,
                        "cursor block was reorged out while stopped, rewinding"
                    );
                    self.cursor.rewind(resume.into()).await?;
                }
                self.tracker.seed(resume);
            }
            None => {
                tracing::info!(from = self.config.start_block, "No cursor, starting fresh");
            }
        }
        self.shared.publish_cursor(self.cursor.current());

        let from = self.next_height();
        let stream = self.feed.subscribe(from).await?;
        tracing::info!(from, "subscribed to chain feed");
        Ok(stream)
    }

    /// Find the newest canonical block at or below the cursor by following
    /// parent hashes from the cursor block.
    async fn resume_point(&self, cursor: Cursor) -> Result<BlockRef, IndexerError> {
        let mut block = match self.feed.block_by_hash(cursor.block_hash).await {
            Ok(b) => b.block_ref(),
            Err(IndexerError::NotAvailable(_)) => {
                // Node has not synced up to the cursor yet.
                return Ok(BlockRef {
                    number: cursor.block_number,
                    hash: cursor.block_hash,
                    parent_hash: alloy_primitives::B256::ZERO,
                });
            }
            Err(e) => return Err(e),
        };
        for _ in 0..=self.config.max_reorg_depth {
            if self.feed.canonical_hash(block.number).await? == Some(block.hash) {
                return Ok(block);
            }
            if block.number == 0 {
                break;
            }
            block = self.feed.block_by_hash(block.parent_hash).await?.block_ref();
        }
        Err(IndexerError::ReorgTooDeep {
            block_number: cursor.block_number,
            max_depth: self.config.max_reorg_depth,
        })
    }

    fn next_height(&self) -> u64 {
        match self.tracker.head() {
            Some(head) => head.number + 1,
            None => self.first_height,
        }
    }

    async fn run(
        mut self,
        stream: BlockStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), IndexerError> {
        let result = match self.follow(stream, &mut shutdown).await {
            Ok(()) => self.shutdown().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.shared.set_state(IndexerState::Stopped);
                tracing::info!("export service stopped");
                Ok(())
            }
            Err(e) => {
                if let Some(in_flight) = self.in_flight.take() {
                    in_flight.handle.abort();
                }
                tracing::error!(error = %e, "export service failed");
                self.shared.set_state(IndexerState::Failed);
                Err(e)
            }
        }
    }

    /// Consume the chain until shutdown is requested.
    async fn follow(
        &mut self,
        stream: BlockStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), IndexerError> {
        let mut feed = FeedState::Live(stream);
        let mut tick = tokio::time::interval(self.config.batch_interval().min(MAX_TICK));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.shared.set_state(IndexerState::Running);

        loop {
            // A full batch is waiting behind the running export: stop reading
            // the chain until that export completes.
            let backpressured =
                self.in_flight.is_some() && self.buffer.len() >= self.config.batch_size;
            let event = tokio::select! {
                biased;
                _ = shutdown.changed() => Event::Shutdown,
                done = wait_export(&mut self.in_flight) => Event::ExportDone(done),
                _ = tick.tick() => Event::Tick,
                event = next_feed_event(&mut feed), if !backpressured => event,
            };

            match event {
                Event::Shutdown => return Ok(()),
                Event::ExportDone(done) => {
                    if let Some(in_flight) = self.in_flight.take() {
                        self.complete_export(done, in_flight.last_block).await?;
                    }
                }
                Event::Tick => {}
                Event::Block(Some(Ok(block))) => {
                    if let Err(e) = self.on_block(block).await {
                        if !e.is_retryable() {
                            return Err(e);
                        }
                        tracing::warn!(error = %e, "block processing interrupted, resubscribing");
                        feed = self.backoff();
                    }
                    self.shared.set_state(IndexerState::Running);
                }
                Event::Block(Some(Err(e))) => {
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    tracing::warn!(error = %e, "chain feed error, resubscribing");
                    feed = self.backoff();
                }
                Event::Block(None) => {
                    tracing::warn!("chain feed closed, resubscribing");
                    feed = self.backoff();
                }
                Event::Resubscribe => {
                    let from = self.next_height();
                    self.shared.record(|m| m.resubscriptions += 1);
                    feed = match self.feed.subscribe(from).await {
                        Ok(stream) => {
                            tracing::info!(from, "resubscribed to chain feed");
                            FeedState::Live(stream)
                        }
                        Err(e) if e.is_retryable() => {
                            tracing::warn!(from, error = %e, "resubscribe failed");
                            self.backoff()
                        }
                        Err(e) => return Err(e),
                    };
                }
            }

            self.maybe_flush();
        }
    }

    fn backoff(&self) -> FeedState {
        FeedState::Backoff(Instant::now() + self.config.resubscribe_backoff())
    }

    // ─── Blocks ───────────────────────────────────────────────────────────────

    async fn on_block(&mut self, block: BlockWithReceipts) -> Result<(), IndexerError> {
        for _ in 0..MAX_RECONCILE_ATTEMPTS {
            match self.ingest(&block).await? {
                Ingest::Done => return Ok(()),
                Ingest::Diverged { at } => self.reconcile(at).await?,
            }
        }
        Err(IndexerError::Aborted {
            reason: format!(
                "chain kept reorganizing while reconciling block {}",
                block.number()
            ),
        })
    }

    /// Accept `block`, filling any gap below it. Reports where the chain
    /// diverges from the tracked head instead of accepting a block that does
    /// not link.
    async fn ingest(&mut self, block: &BlockWithReceipts) -> Result<Ingest, IndexerError> {
        let incoming = block.block_ref();
        let next = self.next_height();

        if incoming.number < next {
            if self.tracker.is_empty() {
                tracing::debug!(block = incoming.number, "block below start height skipped");
                return Ok(Ingest::Done);
            }
            return match self.tracker.get(incoming.number) {
                Some(known) if known.hash == incoming.hash => {
                    tracing::debug!(block = incoming.number, "duplicate block skipped");
                    Ok(Ingest::Done)
                }
                _ => Ok(Ingest::Diverged {
                    at: incoming.number,
                }),
            };
        }

        for number in next..incoming.number {
            let fill = self.feed.block_by_number(number).await?;
            if !self.links(&fill.block_ref()) {
                return Ok(Ingest::Diverged { at: number });
            }
            tracing::debug!(block = number, "filled gap in subscription");
            self.accept(&fill)?;
        }

        if !self.links(&incoming) {
            return Ok(Ingest::Diverged {
                at: incoming.number,
            });
        }
        self.accept(block)?;
        Ok(Ingest::Done)
    }

    fn links(&self, block: &BlockRef) -> bool {
        match self.tracker.head() {
            Some(head) => block.extends(head),
            None => true,
        }
    }

    fn accept(&mut self, block: &BlockWithReceipts) -> Result<(), IndexerError> {
        let extracted =
            extractor::extract(&block.block, &block.receipts).map_err(|source| {
                IndexerError::Extract {
                    block_number: block.number(),
                    source,
                }
            })?;
        let records = extracted.record_count() as u64;
        self.tracker.push(block.block_ref())?;
        self.buffer.append(extracted)?;
        self.shared.record(|m| {
            m.blocks_processed += 1;
            m.records_extracted += records;
        });
        tracing::trace!(block = block.number(), records, "block buffered");
        Ok(())
    }

    /// Roll everything above the common ancestor back. The caller replays
    /// the new branch by ingesting the diverging block again.
    async fn reconcile(&mut self, at: u64) -> Result<(), IndexerError> {
        self.shared.set_state(IndexerState::Reconciling);
        self.shared.record(|m| m.reorgs += 1);
        self.finish_export().await?;

        let event = reorg::roll_back(
            &mut self.tracker,
            self.feed.as_ref(),
            at,
            self.config.max_reorg_depth,
        )
        .await?;
        let ancestor = event.common_ancestor;

        let discarded = self.buffer.discard_after(ancestor.number);
        self.shared.record(|m| m.records_discarded += discarded as u64);

        if let Some(cursor) = self.cursor.current() {
            if cursor.block_number > ancestor.number {
                tracing::warn!(
                    cursor = %cursor,
                    ancestor = %ancestor,
                    "reorg reaches below the cursor; rows of the replaced blocks stay in the warehouse"
                );
                self.cursor.rewind(ancestor.into()).await?;
                self.shared.publish_cursor(self.cursor.current());
            }
        }

        tracing::info!(
            ancestor = ancestor.number,
            depth = event.depth,
            discarded,
            "rolled back to common ancestor"
        );
        Ok(())
    }

    // ─── Export ───────────────────────────────────────────────────────────────

    fn maybe_flush(&mut self) {
        if self.in_flight.is_none() && self.buffer.should_flush() {
            if let Some(batch) = self.buffer.drain() {
                self.spawn_export(batch);
            }
        }
    }

    fn spawn_export(&mut self, batch: ExportBatch) {
        tracing::info!(
            first = batch.first_block.number,
            last = batch.last_block.number,
            rows = batch.len(),
            "flushing batch"
        );
        let last_block = batch.last_block;
        let exporter = Arc::clone(&self.exporter);
        let handle = tokio::spawn(async move { exporter.export(&batch).await });
        self.in_flight = Some(InFlight { last_block, handle });
    }

    /// Wait for the in-flight export, if any, and apply its outcome.
    async fn finish_export(&mut self) -> Result<(), IndexerError> {
        if let Some(in_flight) = self.in_flight.take() {
            let done = in_flight.handle.await;
            self.complete_export(done, in_flight.last_block).await?;
        }
        Ok(())
    }

    async fn complete_export(
        &mut self,
        done: Result<Result<ExportReport, IndexerError>, JoinError>,
        last_block: BlockRef,
    ) -> Result<(), IndexerError> {
        let report = done.map_err(|e| IndexerError::Aborted {
            reason: format!("export task failed: {e}"),
        })??;
        self.shared.record(|m| {
            m.batches_exported += 1;
            m.records_exported += report.rows as u64;
            m.export_attempts += u64::from(report.attempts);
        });
        self.advance_cursor(last_block).await
    }

    /// Move the cursor to `block` if it is still on the canonical chain.
    async fn advance_cursor(&mut self, block: BlockRef) -> Result<(), IndexerError> {
        match self.feed.canonical_hash(block.number).await {
            Ok(Some(hash)) if hash == block.hash => {}
            Ok(_) => {
                tracing::warn!(block = %block, "exported block is no longer canonical, cursor held");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(block = %block, error = %e, "could not confirm exported block, cursor held");
                return Ok(());
            }
        }
        match self.cursor.advance(block.into()).await {
            Ok(()) => {
                self.shared.publish_cursor(self.cursor.current());
                tracing::debug!(cursor = %block, "cursor advanced");
                Ok(())
            }
            Err(IndexerError::Storage(reason)) => {
                tracing::warn!(block = %block, reason = %reason, "failed to persist cursor");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ─── Shutdown ─────────────────────────────────────────────────────────────

    async fn shutdown(&mut self) -> Result<(), IndexerError> {
        self.shared.set_state(IndexerState::Stopping);
        self.finish_export().await?;

        let timeout = self.config.shutdown_timeout();
        match tokio::time::timeout(timeout, self.final_flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "final export failed"),
            Err(_) => tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "final export timed out"
            ),
        }

        if let Err(e) = self.cursor.flush().await {
            tracing::warn!(error = %e, "failed to persist cursor on shutdown");
        }
        Ok(())
    }

    async fn final_flush(&mut self) -> Result<(), IndexerError> {
        let Some(batch) = self.buffer.drain() else {
            return Ok(());
        };
        tracing::info!(
            first = batch.first_block.number,
            last = batch.last_block.number,
            rows = batch.len(),
            "flushing remaining records"
        );
        let report = self.exporter.export(&batch).await;
        self.complete_export(Ok(report), batch.last_block).await
    }
}

async fn wait_export(
    in_flight: &mut Option<InFlight>,
) -> Result<Result<ExportReport, IndexerError>, JoinError> {
    match in_flight {
        Some(in_flight) => (&mut in_flight.handle).await,
        None => std::future::pending().await,
    }
}

async fn next_feed_event(feed: &mut FeedState) -> Event {
    match feed {
        FeedState::Live(stream) => Event::Block(stream.next().await),
        FeedState::Backoff(until) => {
            tokio::time::sleep_until(*until).await;
            Event::Resubscribe
        }
    }
}
