//! End-to-end tests of the export service against the in-memory feed,
//! cursor store and sink.
//!
//! Each test builds a chain with `block()`, runs an `IndexerService` over it
//! and polls metrics / cursor until the expected state is reached.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;

use etherquery_core::{
    BlockWithReceipts, Checkpoint, Cursor, CursorStore, IndexerError, IndexerService,
    IndexerState, MemoryChainFeed, MemoryCursorStore, MemorySink, RawBlock, RawHeader, RawLog,
    RawReceipt, RawTransaction, Record, RecordKind, Service, ServiceConfig, SinkError, TxStatus,
    WarehouseSink,
};

// ─── Helpers ──────────────────────────────────────────────────────────────────

const TXS_PER_BLOCK: u8 = 2;

/// Hash of block `number` on branch `fork`.
fn hash(number: u64, fork: u8) -> B256 {
    let mut h = B256::from(U256::from(number));
    h.0[0] = fork;
    h
}

fn tx_hash(number: u64, fork: u8, index: u8) -> B256 {
    let mut h = hash(number, fork);
    h.0[1] = 0xee;
    h.0[2] = index;
    h
}

/// Block `number` on branch `fork`, child of the block on `parent_fork`.
/// Every transaction emits one log.
fn block(number: u64, fork: u8, parent_fork: u8) -> BlockWithReceipts {
    let transactions: Vec<RawTransaction> = (0..TXS_PER_BLOCK)
        .map(|i| RawTransaction {
            hash: tx_hash(number, fork, i),
            nonce: u64::from(i),
            from: Address::repeat_byte(0x11),
            to: Some(Address::repeat_byte(0x22)),
            value: U256::from(1_000_000_000u64),
            gas_price: U256::from(20_000_000_000u64),
            gas: U256::from(21_000u64),
            input: Bytes::new(),
        })
        .collect();
    let receipts = transactions
        .iter()
        .enumerate()
        .map(|(i, tx)| RawReceipt {
            transaction_hash: tx.hash,
            status: TxStatus::Success,
            gas_used: U256::from(21_000u64),
            contract_address: None,
            logs: vec![RawLog {
                address: Address::repeat_byte(0x33),
                topics: vec![B256::repeat_byte(0xdd)],
                data: Bytes::from(vec![fork, i as u8]),
                log_index: i as u64,
            }],
        })
        .collect();
    BlockWithReceipts::new(
        RawBlock {
            header: RawHeader {
                number,
                hash: hash(number, fork),
                parent_hash: hash(number.wrapping_sub(1), parent_fork),
                timestamp: U256::from(1_500_000_000 + number * 12),
                miner: Address::repeat_byte(0x44),
                gas_used: U256::from(42_000u64),
                gas_limit: U256::from(8_000_000u64),
            },
            transactions,
        },
        receipts,
    )
}

/// Blocks `range` on branch `fork`; the first one is a child of `parent_fork`.
fn branch(range: std::ops::RangeInclusive<u64>, fork: u8, parent_fork: u8) -> Vec<BlockWithReceipts> {
    let start = *range.start();
    range
        .map(|n| block(n, fork, if n == start { parent_fork } else { fork }))
        .collect()
}

fn push_all(feed: &MemoryChainFeed, blocks: Vec<BlockWithReceipts>) {
    for b in blocks {
        feed.push(b).unwrap();
    }
}

fn config() -> ServiceConfig {
    ServiceConfig {
        batch_interval_ms: 20,
        batch_size: 10_000,
        export_max_retries: 3,
        export_initial_backoff_ms: 1,
        export_max_backoff_ms: 5,
        shutdown_timeout_ms: 2_000,
        resubscribe_backoff_ms: 10,
        ..ServiceConfig::default()
    }
}

fn service(
    config: ServiceConfig,
    feed: &MemoryChainFeed,
    store: Arc<dyn CursorStore>,
    sink: Arc<dyn WarehouseSink>,
) -> IndexerService {
    IndexerService::new(config, Arc::new(feed.clone()), store, sink)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn block_heights(sink: &MemorySink) -> Vec<(u64, B256)> {
    sink.rows(RecordKind::Block)
        .iter()
        .map(|r| (r.block_number(), r.block_hash()))
        .collect()
}

/// Records every cursor saved through it.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryCursorStore,
    saved: Mutex<Vec<Cursor>>,
}

#[async_trait]
impl CursorStore for RecordingStore {
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>, IndexerError> {
        self.inner.load(key).await
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<(), IndexerError> {
        self.saved.lock().unwrap().push(checkpoint.cursor);
        self.inner.save(checkpoint).await
    }

    async fn delete(&self, key: &str) -> Result<(), IndexerError> {
        self.inner.delete(key).await
    }
}

/// Reorganizes the feed while the first batch reaching `at` is being written.
struct ReorgDuringWrite {
    inner: MemorySink,
    feed: MemoryChainFeed,
    at: u64,
    replacement: Mutex<Option<Vec<BlockWithReceipts>>>,
}

#[async_trait]
impl WarehouseSink for ReorgDuringWrite {
    fn name(&self) -> &str {
        "reorg-during-write"
    }

    async fn write(&self, records: &[Record]) -> Result<(), SinkError> {
        if records.iter().any(|r| r.block_number() >= self.at) {
            if let Some(blocks) = self.replacement.lock().unwrap().take() {
                self.feed.reorg(self.at, blocks).unwrap();
            }
        }
        self.inner.write(records).await
    }
}

/// Takes `delay` per write and records the size of every write.
struct SlowSink {
    inner: MemorySink,
    delay: Duration,
    sizes: Mutex<Vec<usize>>,
}

impl SlowSink {
    fn new(delay: Duration) -> Self {
        Self {
            inner: MemorySink::new(),
            delay,
            sizes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl WarehouseSink for SlowSink {
    fn name(&self) -> &str {
        "slow"
    }

    async fn write(&self, records: &[Record]) -> Result<(), SinkError> {
        self.sizes.lock().unwrap().push(records.len());
        tokio::time::sleep(self.delay).await;
        self.inner.write(records).await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn exports_every_record_exactly_once_in_order() {
    let feed = MemoryChainFeed::new();
    push_all(&feed, branch(0..=9, 0, 0));
    let store = Arc::new(MemoryCursorStore::new());
    let sink = Arc::new(MemorySink::new());
    let svc = service(config(), &feed, store, sink.clone());

    svc.start().await.unwrap();
    eventually("cursor at 9", || svc.cursor() == Some(Cursor::new(9, hash(9, 0)))).await;
    svc.stop().await.unwrap();

    assert_eq!(svc.state(), IndexerState::Stopped);
    assert_eq!(sink.rows_received() as usize, sink.row_count());

    let blocks: Vec<u64> = block_heights(&sink).iter().map(|(n, _)| *n).collect();
    assert_eq!(blocks, (0..=9).collect::<Vec<_>>());

    let txs = sink.rows(RecordKind::Transaction);
    assert_eq!(txs.len(), 10 * TXS_PER_BLOCK as usize);
    let order: Vec<(u64, u32)> = txs.iter().map(|r| (r.block_number(), r.index())).collect();
    let mut sorted = order.clone();
    sorted.sort();
    assert_eq!(order, sorted);
    assert_eq!(sink.rows(RecordKind::Log).len(), 10 * TXS_PER_BLOCK as usize);

    let metrics = svc.metrics();
    assert_eq!(metrics.blocks_processed, 10);
    assert_eq!(metrics.records_extracted, metrics.records_exported);
    assert_eq!(metrics.reorgs, 0);
}

#[tokio::test]
async fn reorg_before_flush_replaces_buffered_blocks() {
    let feed = MemoryChainFeed::new();
    push_all(&feed, branch(0..=12, 0, 0));
    let sink = Arc::new(MemorySink::new());
    let cfg = ServiceConfig {
        batch_interval_ms: 60_000,
        ..config()
    };
    let svc = service(cfg, &feed, Arc::new(MemoryCursorStore::new()), sink.clone());

    svc.start().await.unwrap();
    eventually("13 blocks buffered", || svc.metrics().blocks_processed == 13).await;
    assert_eq!(sink.write_calls(), 0);

    // 10, 11, 12 are replaced and 13 extends the new branch
    feed.reorg(10, branch(10..=13, 1, 0)).unwrap();
    eventually("new branch buffered", || svc.metrics().blocks_processed == 17).await;
    svc.stop().await.unwrap();

    let metrics = svc.metrics();
    assert_eq!(metrics.reorgs, 1);
    assert_eq!(metrics.records_discarded, 3 * (1 + 2 * TXS_PER_BLOCK as u64));

    let mut expected: Vec<(u64, B256)> = (0..=9).map(|n| (n, hash(n, 0))).collect();
    expected.extend((10..=13).map(|n| (n, hash(n, 1))));
    assert_eq!(block_heights(&sink), expected);
    // nothing of the old branch reached the warehouse
    assert_eq!(sink.rows_received() as usize, sink.row_count());
    assert_eq!(svc.cursor(), Some(Cursor::new(13, hash(13, 1))));
}

#[tokio::test]
async fn reorg_after_flush_rewinds_cursor() {
    let feed = MemoryChainFeed::new();
    push_all(&feed, branch(0..=12, 0, 0));
    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(RecordingStore::default());
    let cfg = ServiceConfig {
        batch_size: 1,
        ..config()
    };
    let svc = service(cfg, &feed, store.clone(), sink.clone());

    svc.start().await.unwrap();
    eventually("cursor at 12", || svc.cursor() == Some(Cursor::new(12, hash(12, 0)))).await;

    feed.reorg(10, branch(10..=13, 1, 0)).unwrap();
    eventually("cursor on new branch", || {
        svc.cursor() == Some(Cursor::new(13, hash(13, 1)))
    })
    .await;
    svc.stop().await.unwrap();

    assert_eq!(svc.metrics().reorgs, 1);
    // the cursor went back to the common ancestor before moving on
    assert!(store
        .saved
        .lock()
        .unwrap()
        .contains(&Cursor::new(9, hash(9, 0))));

    // rows of the replaced blocks stay behind next to the new ones
    let blocks = block_heights(&sink);
    for n in 10..=12 {
        assert!(blocks.contains(&(n, hash(n, 0))));
        assert!(blocks.contains(&(n, hash(n, 1))));
    }
    assert!(blocks.contains(&(13, hash(13, 1))));
    assert_eq!(blocks.len(), 13 + 4);
}

#[tokio::test]
async fn one_transient_failure_yields_one_successful_write_per_batch() {
    let feed = MemoryChainFeed::new();
    push_all(&feed, branch(0..=2, 0, 0));
    let sink = Arc::new(MemorySink::new());
    sink.fail_next(SinkError::Http("connection reset by peer".into()));
    let svc = service(config(), &feed, Arc::new(MemoryCursorStore::new()), sink.clone());

    svc.start().await.unwrap();
    eventually("cursor at 2", || svc.cursor() == Some(Cursor::new(2, hash(2, 0)))).await;
    svc.stop().await.unwrap();

    let metrics = svc.metrics();
    assert_eq!(sink.write_calls(), sink.successful_writes() + 1);
    assert_eq!(metrics.batches_exported, sink.successful_writes());
    assert_eq!(metrics.export_attempts, sink.write_calls());
    assert_eq!(sink.rows_received() as usize, sink.row_count());
}

#[tokio::test]
async fn export_failure_after_retries_stops_the_service() {
    let feed = MemoryChainFeed::new();
    push_all(&feed, branch(0..=1, 0, 0));
    let sink = Arc::new(MemorySink::new());
    for _ in 0..10 {
        sink.fail_next(SinkError::Timeout { ms: 30_000 });
    }
    let cfg = ServiceConfig {
        export_max_retries: 2,
        ..config()
    };
    let svc = service(cfg, &feed, Arc::new(MemoryCursorStore::new()), sink.clone());

    svc.start().await.unwrap();
    let err = svc.wait().await.unwrap_err();
    assert!(matches!(err, IndexerError::ExportFailed { attempts: 3, .. }));
    assert_eq!(svc.state(), IndexerState::Failed);
    assert_eq!(sink.write_calls(), 3);
    assert_eq!(sink.row_count(), 0);
    assert_eq!(svc.cursor(), None);
}

#[tokio::test]
async fn shutdown_exports_buffered_records() {
    let feed = MemoryChainFeed::new();
    push_all(&feed, branch(0..=4, 0, 0));
    let store = Arc::new(MemoryCursorStore::new());
    let sink = Arc::new(MemorySink::new());
    let cfg = ServiceConfig {
        batch_interval_ms: 60_000,
        ..config()
    };
    let svc = service(cfg.clone(), &feed, store.clone(), sink.clone());

    svc.start().await.unwrap();
    eventually("5 blocks buffered", || svc.metrics().blocks_processed == 5).await;
    assert_eq!(sink.row_count(), 0);

    svc.stop().await.unwrap();
    assert_eq!(svc.state(), IndexerState::Stopped);
    assert_eq!(sink.rows(RecordKind::Block).len(), 5);

    let saved = store.load(&cfg.cursor_key()).await.unwrap().unwrap();
    assert_eq!(saved.cursor, Cursor::new(4, hash(4, 0)));
}

#[tokio::test]
async fn restart_resumes_from_cursor() {
    let feed = MemoryChainFeed::new();
    push_all(&feed, branch(0..=4, 0, 0));
    let store = Arc::new(MemoryCursorStore::new());

    let first_sink = Arc::new(MemorySink::new());
    let first = service(config(), &feed, store.clone(), first_sink.clone());
    first.start().await.unwrap();
    eventually("cursor at 4", || first.cursor() == Some(Cursor::new(4, hash(4, 0)))).await;
    first.stop().await.unwrap();

    push_all(&feed, branch(5..=7, 0, 0));
    let second_sink = Arc::new(MemorySink::new());
    let second = service(config(), &feed, store, second_sink.clone());
    second.start().await.unwrap();
    assert_eq!(second.cursor(), Some(Cursor::new(4, hash(4, 0))));
    eventually("cursor at 7", || second.cursor() == Some(Cursor::new(7, hash(7, 0)))).await;
    second.stop().await.unwrap();

    let heights: Vec<u64> = block_heights(&second_sink).iter().map(|(n, _)| *n).collect();
    assert_eq!(heights, vec![5, 6, 7]);
}

#[tokio::test]
async fn starts_at_configured_block_without_cursor() {
    let feed = MemoryChainFeed::new();
    push_all(&feed, branch(0..=9, 0, 0));
    let sink = Arc::new(MemorySink::new());
    let cfg = ServiceConfig {
        start_block: 6,
        ..config()
    };
    let svc = service(cfg, &feed, Arc::new(MemoryCursorStore::new()), sink.clone());

    svc.start().await.unwrap();
    eventually("cursor at 9", || svc.cursor() == Some(Cursor::new(9, hash(9, 0)))).await;
    svc.stop().await.unwrap();

    let heights: Vec<u64> = block_heights(&sink).iter().map(|(n, _)| *n).collect();
    assert_eq!(heights, vec![6, 7, 8, 9]);
}

#[tokio::test]
async fn cursor_never_points_at_a_replaced_block() {
    let feed = MemoryChainFeed::new();
    push_all(&feed, branch(0..=6, 0, 0));
    let store = Arc::new(RecordingStore::default());
    let sink = Arc::new(ReorgDuringWrite {
        inner: MemorySink::new(),
        feed: feed.clone(),
        at: 5,
        replacement: Mutex::new(Some(branch(5..=6, 1, 0))),
    });
    let cfg = ServiceConfig {
        batch_size: 1,
        ..config()
    };
    let svc = service(cfg, &feed, store.clone(), sink.clone());

    svc.start().await.unwrap();
    eventually("cursor on new branch", || {
        svc.cursor() == Some(Cursor::new(6, hash(6, 1)))
    })
    .await;
    svc.stop().await.unwrap();

    for cursor in store.saved.lock().unwrap().iter() {
        let fork = if cursor.block_number < 5 { 0 } else { 1 };
        assert_eq!(cursor.block_hash, hash(cursor.block_number, fork), "saved {cursor}");
    }
}

#[tokio::test]
async fn reorg_below_cursor_after_restart() {
    let feed = MemoryChainFeed::new();
    push_all(&feed, branch(0..=12, 0, 0));
    let store = Arc::new(RecordingStore::default());

    let first = service(config(), &feed, store.clone(), Arc::new(MemorySink::new()));
    first.start().await.unwrap();
    eventually("cursor at 12", || first.cursor() == Some(Cursor::new(12, hash(12, 0)))).await;
    first.stop().await.unwrap();

    let sink = Arc::new(MemorySink::new());
    let second = service(config(), &feed, store.clone(), sink.clone());
    second.start().await.unwrap();
    feed.push(block(13, 0, 0)).unwrap();
    eventually("block 13 processed", || second.metrics().blocks_processed == 1).await;

    // 10..=12 sit below the restarted tracker's only known block
    feed.reorg(10, branch(10..=14, 1, 0)).unwrap();
    eventually("cursor on new branch", || {
        second.cursor() == Some(Cursor::new(14, hash(14, 1)))
    })
    .await;
    second.stop().await.unwrap();

    assert_eq!(second.state(), IndexerState::Stopped);
    assert_eq!(second.metrics().reorgs, 1);
    assert!(store
        .saved
        .lock()
        .unwrap()
        .contains(&Cursor::new(9, hash(9, 0))));
    let blocks = block_heights(&sink);
    for n in 10..=14 {
        assert!(blocks.contains(&(n, hash(n, 1))), "block {n} of the new branch");
    }
}

#[tokio::test]
async fn reorg_of_the_start_block() {
    let feed = MemoryChainFeed::new();
    push_all(&feed, branch(0..=9, 0, 0));
    let sink = Arc::new(MemorySink::new());
    let cfg = ServiceConfig {
        start_block: 6,
        ..config()
    };
    let svc = service(cfg, &feed, Arc::new(MemoryCursorStore::new()), sink.clone());

    svc.start().await.unwrap();
    eventually("cursor at 9", || svc.cursor() == Some(Cursor::new(9, hash(9, 0)))).await;

    feed.reorg(6, branch(6..=10, 1, 0)).unwrap();
    eventually("cursor on new branch", || {
        svc.cursor() == Some(Cursor::new(10, hash(10, 1)))
    })
    .await;
    svc.stop().await.unwrap();

    assert_eq!(svc.metrics().reorgs, 1);
    let blocks = block_heights(&sink);
    for n in 6..=10 {
        assert!(blocks.contains(&(n, hash(n, 1))), "block {n} of the new branch");
    }
    assert!(blocks.iter().all(|(n, _)| *n >= 6));
}

#[tokio::test]
async fn slow_sink_gets_bounded_batches() {
    const RECORDS_PER_BLOCK: usize = 1 + 2 * TXS_PER_BLOCK as usize;
    let feed = MemoryChainFeed::new();
    push_all(&feed, branch(0..=39, 0, 0));
    let sink = Arc::new(SlowSink::new(Duration::from_millis(30)));
    let cfg = ServiceConfig {
        batch_size: 2 * RECORDS_PER_BLOCK,
        ..config()
    };
    let svc = service(cfg.clone(), &feed, Arc::new(MemoryCursorStore::new()), sink.clone());

    svc.start().await.unwrap();
    eventually("cursor at 39", || svc.cursor() == Some(Cursor::new(39, hash(39, 0)))).await;
    svc.stop().await.unwrap();

    let sizes = sink.sizes.lock().unwrap().clone();
    assert!(sizes.len() > 1);
    for size in &sizes {
        assert!(
            *size <= cfg.batch_size + RECORDS_PER_BLOCK,
            "write of {size} records, sizes {sizes:?}"
        );
    }
    assert_eq!(sink.inner.rows(RecordKind::Block).len(), 40);
    assert_eq!(sizes.iter().sum::<usize>(), 40 * RECORDS_PER_BLOCK);
}
