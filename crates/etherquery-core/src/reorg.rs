//! Reorg recovery — locate the last block shared with the canonical chain.
//!
//! A reorg shows up in one of two ways:
//! 1. **Parent mismatch**: the next block does not extend the tracked head
//! 2. **Re-delivery**: the feed hands us a height we already accepted, with a
//!    different hash
//!
//! Either way the walk is the same: step down from the tracked head, asking
//! the feed for its canonical hash at each height, until the hashes agree.
//! Below the tracker's window the walk continues through the feed by parent
//! hash.

use alloy_primitives::B256;

use crate::error::IndexerError;
use crate::feed::ChainFeed;
use crate::tracker::BlockTracker;
use crate::types::BlockRef;

/// Describes a chain reorganization that has been rolled back.
#[derive(Debug, Clone)]
pub struct ReorgEvent {
    /// Height of the block that revealed the fork.
    pub detected_at: u64,
    /// The newest block still on the canonical chain.
    pub common_ancestor: BlockRef,
    /// The tracked blocks that were dropped, most recent first.
    pub dropped_blocks: Vec<BlockRef>,
    /// The depth of the reorg (number of blocks rolled back).
    pub depth: u64,
}

/// Walk backwards from below `detected_at` until a block matches the feed's
/// canonical hash at its height.
///
/// Heights inside the tracker's window come from the tracker. Below it the
/// walk follows parent hashes through [`ChainFeed::block_by_hash`], so a
/// freshly seeded tracker can still reach an ancestor below its only block.
///
/// Gives up with [`IndexerError::ReorgTooDeep`] after `max_depth` heights, at
/// genesis, or when a parent hash is unknown.
pub async fn find_common_ancestor(
    tracker: &BlockTracker,
    feed: &dyn ChainFeed,
    detected_at: u64,
    max_depth: u64,
) -> Result<BlockRef, IndexerError> {
    let too_deep = || IndexerError::ReorgTooDeep {
        block_number: detected_at,
        max_depth,
    };
    let mut current = *tracker.head().ok_or_else(too_deep)?;
    let Some(below) = detected_at.checked_sub(1) else {
        return Err(too_deep());
    };
    let top = below.min(current.number);

    while current.number > top {
        current = parent_of(tracker, feed, &current).await?.ok_or_else(too_deep)?;
    }
    loop {
        if top - current.number >= max_depth {
            return Err(too_deep());
        }
        if feed.canonical_hash(current.number).await? == Some(current.hash) {
            return Ok(current);
        }
        current = parent_of(tracker, feed, &current).await?.ok_or_else(too_deep)?;
    }
}

/// The block below `block` on its own branch. `None` at genesis or when the
/// parent hash is unknown (a seed without ancestry).
async fn parent_of(
    tracker: &BlockTracker,
    feed: &dyn ChainFeed,
    block: &BlockRef,
) -> Result<Option<BlockRef>, IndexerError> {
    let Some(number) = block.number.checked_sub(1) else {
        return Ok(None);
    };
    if let Some(known) = tracker.get(number) {
        return Ok(Some(*known));
    }
    if block.parent_hash == B256::ZERO {
        return Ok(None);
    }
    let parent = feed.block_by_hash(block.parent_hash).await?.block_ref();
    Ok((parent.number == number).then_some(parent))
}

/// Find the common ancestor and rewind `tracker` to it.
///
/// When the ancestor lies below the window the tracker restarts from it.
pub async fn roll_back(
    tracker: &mut BlockTracker,
    feed: &dyn ChainFeed,
    detected_at: u64,
    max_depth: u64,
) -> Result<ReorgEvent, IndexerError> {
    let ancestor = find_common_ancestor(tracker, feed, detected_at, max_depth).await?;
    let head = tracker.head().map_or(ancestor.number, |h| h.number);
    let dropped_blocks = tracker.rewind_to(ancestor.number);
    if tracker.is_empty() {
        tracker.seed(ancestor);
    }
    let depth = head - ancestor.number;
    tracing::warn!(
        depth,
        at = detected_at,
        ancestor = ancestor.number,
        "Reorg detected"
    );
    Ok(ReorgEvent {
        detected_at,
        common_ancestor: ancestor,
        dropped_blocks,
        depth,
    })
}
