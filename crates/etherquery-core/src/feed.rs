//! `ChainFeed` trait — the service's only view of the host node.
//!
//! The host's blockchain service implements this; the export service only
//! subscribes to new canonical blocks and looks up historical ones.

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use alloy_primitives::B256;
use async_trait::async_trait;
use futures::Stream;
use tokio::sync::watch;

use crate::error::IndexerError;
use crate::types::BlockWithReceipts;

/// A stream of canonical blocks in height order.
pub type BlockStream = Pin<Box<dyn Stream<Item = Result<BlockWithReceipts, IndexerError>> + Send>>;

/// Narrow interface over the host node's blockchain service.
///
/// Lookups for blocks the node does not have yet (not synced, pruned) fail
/// with [`IndexerError::NotAvailable`].
#[async_trait]
pub trait ChainFeed: Send + Sync {
    /// Stream canonical blocks starting at height `from`, as they are produced.
    async fn subscribe(&self, from: u64) -> Result<BlockStream, IndexerError>;

    /// Look up the canonical block at `number` together with its receipts.
    async fn block_by_number(&self, number: u64) -> Result<BlockWithReceipts, IndexerError>;

    /// Look up any known block (canonical or not) by hash.
    async fn block_by_hash(&self, hash: B256) -> Result<BlockWithReceipts, IndexerError>;

    /// The canonical hash at `number`, or `None` if the chain is not that long.
    async fn canonical_hash(&self, number: u64) -> Result<Option<B256>, IndexerError>;
}

// ─── In-memory feed ───────────────────────────────────────────────────────────

#[derive(Default)]
struct ChainState {
    /// Canonical chain; `canonical[i]` is the block at height `first + i`.
    canonical: Vec<BlockWithReceipts>,
    first: u64,
    /// Every block ever inserted, including ones reorged out.
    known: std::collections::HashMap<B256, BlockWithReceipts>,
    /// Bumped on every reorg so subscriptions rewind to `fork_height`.
    epoch: u64,
    fork_height: u64,
    closed: bool,
}

impl ChainState {
    fn get(&self, number: u64) -> Option<&BlockWithReceipts> {
        let idx = number.checked_sub(self.first)? as usize;
        self.canonical.get(idx)
    }

    fn next_height(&self) -> u64 {
        self.first + self.canonical.len() as u64
    }
}

/// In-memory chain for tests and embedded use.
///
/// Blocks are appended with [`MemoryChainFeed::push`] and replaced with
/// [`MemoryChainFeed::reorg`]. Live subscriptions observe new blocks and,
/// after a reorg, re-deliver the chain from the fork height.
#[derive(Clone)]
pub struct MemoryChainFeed {
    state: Arc<Mutex<ChainState>>,
    notify: Arc<watch::Sender<u64>>,
}

impl Default for MemoryChainFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChainFeed {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(ChainState::default())),
            notify: Arc::new(tx),
        }
    }

    /// Append a block at the tip.
    ///
    /// The first block pushed fixes the chain's starting height.
    pub fn push(&self, block: BlockWithReceipts) -> Result<(), IndexerError> {
        {
            let mut st = self.state.lock().unwrap();
            if st.canonical.is_empty() {
                st.first = block.number();
            } else if block.number() != st.next_height() {
                return Err(IndexerError::OutOfOrder {
                    last: st.next_height().saturating_sub(1),
                    got: block.number(),
                });
            }
            st.known.insert(block.hash(), block.clone());
            st.canonical.push(block);
        }
        self.bump();
        Ok(())
    }

    /// Replace the canonical chain from `fork_height` with `blocks`.
    pub fn reorg(&self, fork_height: u64, blocks: Vec<BlockWithReceipts>) -> Result<(), IndexerError> {
        {
            let mut st = self.state.lock().unwrap();
            if fork_height < st.first || fork_height > st.next_height() {
                return Err(IndexerError::NotAvailable(format!(
                    "fork height {fork_height} outside the chain"
                )));
            }
            for (i, block) in blocks.iter().enumerate() {
                if block.number() != fork_height + i as u64 {
                    return Err(IndexerError::OutOfOrder {
                        last: fork_height + i as u64,
                        got: block.number(),
                    });
                }
            }
            let keep = (fork_height - st.first) as usize;
            st.canonical.truncate(keep);
            for block in blocks {
                st.known.insert(block.hash(), block.clone());
                st.canonical.push(block);
            }
            st.epoch += 1;
            st.fork_height = fork_height;
        }
        tracing::debug!(fork_height, "memory chain reorganized");
        self.bump();
        Ok(())
    }

    /// End all live subscriptions.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.bump();
    }

    /// Current tip height, if any block was pushed.
    pub fn head(&self) -> Option<u64> {
        let st = self.state.lock().unwrap();
        (!st.canonical.is_empty()).then(|| st.next_height() - 1)
    }

    fn bump(&self) {
        self.notify.send_modify(|v| *v += 1);
    }
}

#[async_trait]
impl ChainFeed for MemoryChainFeed {
    async fn subscribe(&self, from: u64) -> Result<BlockStream, IndexerError> {
        let state = Arc::clone(&self.state);
        let rx = self.notify.subscribe();
        let epoch = state.lock().unwrap().epoch;

        let stream = futures::stream::unfold(
            (state, rx, from, epoch),
            |(state, mut rx, mut next, mut epoch)| async move {
                loop {
                    let ready = {
                        let st = state.lock().unwrap();
                        if st.closed {
                            return None;
                        }
                        if st.epoch != epoch {
                            epoch = st.epoch;
                            next = next.min(st.fork_height);
                        }
                        st.get(next).cloned()
                    };
                    if let Some(block) = ready {
                        next += 1;
                        return Some((Ok(block), (state, rx, next, epoch)));
                    }
                    if rx.changed().await.is_err() {
                        return None;
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn block_by_number(&self, number: u64) -> Result<BlockWithReceipts, IndexerError> {
        self.state
            .lock()
            .unwrap()
            .get(number)
            .cloned()
            .ok_or_else(|| IndexerError::NotAvailable(format!("block {number}")))
    }

    async fn block_by_hash(&self, hash: B256) -> Result<BlockWithReceipts, IndexerError> {
        self.state
            .lock()
            .unwrap()
            .known
            .get(&hash)
            .cloned()
            .ok_or_else(|| IndexerError::NotAvailable(format!("block {hash:#x}")))
    }

    async fn canonical_hash(&self, number: u64) -> Result<Option<B256>, IndexerError> {
        Ok(self.state.lock().unwrap().get(number).map(|b| b.hash()))
    }
}
