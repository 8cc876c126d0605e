//! Resolved checkpoints and the reorg limits they impose.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::node::BlockHash;
use crate::pool::CheckpointEvent;
use crate::threshold::is_persistent_checkpoint;

/// A block attested by its checkpoint quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    pub block_hash: BlockHash,
    pub signatures: Vec<(u16, Vec<u8>)>,
}

impl From<CheckpointEvent> for Checkpoint {
    fn from(event: CheckpointEvent) -> Self {
        Self {
            height: event.height,
            block_hash: event.block_hash,
            signatures: event.signatures,
        }
    }
}

/// Checkpoints held in memory.
///
/// Heights on the persistence interval are also written to storage by the
/// caller. The rest only matter for reorg checks and are dropped once they
/// fall more than `max_reorg_blocks` behind the newest checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    persist_interval: u64,
    max_reorg_blocks: u64,
    checkpoints: BTreeMap<u64, Checkpoint>,
}

impl CheckpointStore {
    pub fn new(persist_interval: u64, max_reorg_blocks: u64) -> Self {
        Self {
            persist_interval,
            max_reorg_blocks,
            checkpoints: BTreeMap::new(),
        }
    }

    /// Keep a checkpoint. Returns true if it must be persisted.
    pub fn insert(&mut self, checkpoint: Checkpoint) -> bool {
        let persistent = is_persistent_checkpoint(checkpoint.height, self.persist_interval);
        self.checkpoints.insert(checkpoint.height, checkpoint);
        self.prune();
        persistent
    }

    pub fn get(&self, height: u64) -> Option<&Checkpoint> {
        self.checkpoints.get(&height)
    }

    /// Newest checkpoint.
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Drop ephemeral checkpoints too old to bound a reorg.
    pub fn prune(&mut self) {
        let Some(newest) = self.checkpoints.keys().next_back().copied() else {
            return;
        };
        let horizon = newest.saturating_sub(self.max_reorg_blocks);
        let interval = self.persist_interval;
        self.checkpoints
            .retain(|&h, _| h >= horizon || is_persistent_checkpoint(h, interval));
    }

    /// Whether the chain at `tip` may be reorganised from `fork_height` up.
    ///
    /// Checkpointed blocks are final, and no reorg may be deeper than
    /// `max_reorg_blocks`.
    pub fn reorg_allowed(&self, tip: u64, fork_height: u64) -> bool {
        if tip.saturating_sub(fork_height) > self.max_reorg_blocks {
            return false;
        }
        match self.latest() {
            Some(cp) => fork_height > cp.height,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(height: u64) -> Checkpoint {
        Checkpoint {
            height,
            block_hash: BlockHash([height as u8; 32]),
            signatures: Vec::new(),
        }
    }

    fn store() -> CheckpointStore {
        CheckpointStore::new(60, 11)
    }

    #[test]
    fn persistence_cadence() {
        let mut s = store();
        assert!(!s.insert(cp(104)));
        assert!(s.insert(cp(120)));
        assert!(!s.insert(cp(124)));
        assert!(s.insert(cp(180)));
    }

    #[test]
    fn ephemeral_checkpoints_pruned() {
        let mut s = store();
        for h in (100..=140).step_by(4) {
            s.insert(cp(h));
        }
        // Newest is 140: keep 129..=140 and the persistent 120.
        let heights: Vec<u64> = (100..=140).filter(|h| s.get(*h).is_some()).collect();
        assert_eq!(heights, vec![120, 132, 136, 140]);
        assert_eq!(s.latest().map(|c| c.height), Some(140));
    }

    #[test]
    fn reorg_limits() {
        let mut s = store();
        assert!(s.reorg_allowed(100, 90));
        assert!(!s.reorg_allowed(100, 88));
        s.insert(cp(96));
        assert!(!s.reorg_allowed(100, 96));
        assert!(!s.reorg_allowed(100, 95));
        assert!(s.reorg_allowed(100, 97));
    }

    #[test]
    fn from_event() {
        let event = CheckpointEvent {
            height: 8,
            block_hash: BlockHash([1; 32]),
            signatures: vec![(0, vec![1, 2, 3])],
        };
        let c = Checkpoint::from(event);
        assert_eq!(c.height, 8);
        assert_eq!(c.signatures.len(), 1);
    }
}
