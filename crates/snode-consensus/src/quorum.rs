//! Deterministic quorum construction.
//!
//! A quorum is a function of the node list at a height and the hash of the
//! block at that height. Candidates are sorted by key, then validators (and,
//! for state change quorums, workers) are drawn without replacement from a
//! generator seeded with the block hash. The same inputs always produce the
//! same ordered quorum.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RulesConfig;
use crate::error::QuorumError;
use crate::node::{BlockHash, NodeKey, NodeState};
use crate::selector::{sample_without_replacement, seeded_rng, QuorumSeed, SeedDomain};
use crate::threshold::is_checkpoint_height;

/// Kind of quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QuorumType {
    /// Tests workers and votes to change their state.
    StateChange,
    /// Attests a block.
    Checkpoint,
}

impl QuorumType {
    pub const ALL: [QuorumType; 2] = [QuorumType::StateChange, QuorumType::Checkpoint];

    pub(crate) const fn tag(self) -> u8 {
        match self {
            QuorumType::StateChange => 0,
            QuorumType::Checkpoint => 1,
        }
    }

    const fn seed_domain(self) -> SeedDomain {
        match self {
            QuorumType::StateChange => SeedDomain::StateChangeQuorum,
            QuorumType::Checkpoint => SeedDomain::CheckpointQuorum,
        }
    }
}

impl std::fmt::Display for QuorumType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuorumType::StateChange => f.write_str("state change"),
            QuorumType::Checkpoint => f.write_str("checkpoint"),
        }
    }
}

/// A built quorum. Also the persisted per-height snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quorum {
    pub quorum_type: QuorumType,
    pub height: u64,
    /// Voters, in draw order. A vote's voter index points here.
    pub validators: Vec<NodeKey>,
    /// Nodes under test, in draw order. Empty for checkpoint quorums.
    pub workers: Vec<NodeKey>,
}

impl Quorum {
    pub fn validator(&self, index: u16) -> Option<&NodeKey> {
        self.validators.get(index as usize)
    }

    pub fn worker(&self, index: u16) -> Option<&NodeKey> {
        self.workers.get(index as usize)
    }

    /// Position of `key` among the validators.
    pub fn validator_index(&self, key: &NodeKey) -> Option<u16> {
        self.validators
            .iter()
            .position(|k| k == key)
            .and_then(|i| u16::try_from(i).ok())
    }

    /// Position of `key` among the workers.
    pub fn worker_index(&self, key: &NodeKey) -> Option<u16> {
        self.workers
            .iter()
            .position(|k| k == key)
            .and_then(|i| u16::try_from(i).ok())
    }
}

/// What the builder needs to know about a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumCandidate {
    pub key: NodeKey,
    pub state: NodeState,
    pub registration_height: u64,
}

/// Build the quorum of `quorum_type` for `height`.
///
/// `block_hash` is the hash of the block at `height`.
pub fn build_quorum(
    config: &RulesConfig,
    candidates: &[QuorumCandidate],
    height: u64,
    quorum_type: QuorumType,
    block_hash: &BlockHash,
) -> Result<Quorum, QuorumError> {
    if quorum_type == QuorumType::Checkpoint && !is_checkpoint_height(height, config.checkpoint_interval) {
        return Err(QuorumError::NotACheckpointHeight(height));
    }

    let mut sorted: Vec<&QuorumCandidate> = candidates
        .iter()
        .filter(|c| c.state != NodeState::Deregistered)
        .collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let min_age = config.min_blocks_before_voting();
    let eligible: Vec<NodeKey> = sorted
        .iter()
        .filter(|c| c.state == NodeState::Active && height.saturating_sub(c.registration_height) >= min_age)
        .map(|c| c.key)
        .collect();

    let size = config.quorum_size_for(quorum_type);
    if eligible.len() < size {
        return Err(QuorumError::InsufficientEligibleNodes {
            quorum_type,
            needed: size,
            available: eligible.len(),
        });
    }

    let seed = QuorumSeed::derive(block_hash, quorum_type.seed_domain(), height);
    let mut rng = seeded_rng(&seed);
    let validators = sample_without_replacement(&mut rng, eligible, size);

    let workers = match quorum_type {
        QuorumType::Checkpoint => Vec::new(),
        QuorumType::StateChange => {
            let total = sorted.len();
            let remaining: Vec<NodeKey> = sorted
                .iter()
                .map(|c| c.key)
                .filter(|k| !validators.contains(k))
                .collect();
            let wanted = (total / config.state_change_nth_of_network_to_test)
                .max(config.state_change_min_nodes_to_test);
            sample_without_replacement(&mut rng, remaining, wanted)
        }
    };

    debug!(
        height,
        quorum_type = %quorum_type,
        validators = validators.len(),
        workers = workers.len(),
        "Built quorum"
    );

    Ok(Quorum {
        quorum_type,
        height,
        validators,
        workers,
    })
}

/// Newest height whose state change quorum local validators should test.
///
/// Stays `REORG_SAFETY_BUFFER_IN_BLOCKS` behind the tip so the tested
/// quorum cannot be reorganised away.
pub fn latest_safe_height(config: &RulesConfig, tip: u64) -> Option<u64> {
    tip.checked_sub(config.reorg_safety_buffer_in_blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn key(i: u32) -> NodeKey {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&i.to_be_bytes());
        NodeKey(bytes)
    }

    fn candidates(n: u32) -> Vec<QuorumCandidate> {
        (0..n)
            .map(|i| QuorumCandidate {
                key: key(i),
                state: NodeState::Active,
                registration_height: 100,
            })
            .collect()
    }

    #[test]
    fn state_change_quorum_shape() {
        let config = RulesConfig::default();
        let q = build_quorum(&config, &candidates(60), 104, QuorumType::StateChange, &BlockHash([1; 32]))
            .unwrap();
        assert_eq!(q.validators.len(), 10);
        assert_eq!(q.workers.len(), 50);
        let v: BTreeSet<_> = q.validators.iter().collect();
        let w: BTreeSet<_> = q.workers.iter().collect();
        assert_eq!(v.len(), 10);
        assert_eq!(w.len(), 50);
        assert!(v.is_disjoint(&w));
    }

    #[test]
    fn worker_count_is_capped_by_remaining() {
        let config = RulesConfig::default();
        let q = build_quorum(&config, &candidates(25), 7, QuorumType::StateChange, &BlockHash([1; 32]))
            .unwrap();
        assert_eq!(q.workers.len(), 15);
    }

    #[test]
    fn large_network_tests_a_fraction() {
        let config = RulesConfig {
            state_change_min_nodes_to_test: 5,
            ..RulesConfig::default()
        };
        let q = build_quorum(&config, &candidates(1_000), 7, QuorumType::StateChange, &BlockHash([1; 32]))
            .unwrap();
        assert_eq!(q.workers.len(), 10);
    }

    #[test]
    fn checkpoint_quorum_has_no_workers() {
        let config = RulesConfig::default();
        let q = build_quorum(&config, &candidates(60), 104, QuorumType::Checkpoint, &BlockHash([1; 32]))
            .unwrap();
        assert_eq!(q.validators.len(), 20);
        assert!(q.workers.is_empty());
    }

    #[test]
    fn checkpoint_only_on_interval() {
        let config = RulesConfig::default();
        assert_eq!(
            build_quorum(&config, &candidates(60), 105, QuorumType::Checkpoint, &BlockHash([1; 32])),
            Err(QuorumError::NotACheckpointHeight(105))
        );
    }

    #[test]
    fn too_few_nodes() {
        let config = RulesConfig::default();
        assert_eq!(
            build_quorum(&config, &candidates(19), 104, QuorumType::Checkpoint, &BlockHash([1; 32])),
            Err(QuorumError::InsufficientEligibleNodes {
                quorum_type: QuorumType::Checkpoint,
                needed: 20,
                available: 19
            })
        );
    }

    #[test]
    fn decommissioned_nodes_are_workers_not_validators() {
        let config = RulesConfig::default();
        let mut c = candidates(30);
        for cand in c.iter_mut().take(5) {
            cand.state = NodeState::Decommissioned;
        }
        let q = build_quorum(&config, &c, 50, QuorumType::StateChange, &BlockHash([2; 32])).unwrap();
        let decommissioned: BTreeSet<NodeKey> = c.iter().take(5).map(|c| c.key).collect();
        assert!(q.validators.iter().all(|v| !decommissioned.contains(v)));
        assert!(decommissioned.iter().all(|d| q.workers.contains(d)));
    }

    #[test]
    fn young_nodes_do_not_validate() {
        let config = RulesConfig {
            min_time_in_s_before_voting: 120 * 10,
            ..RulesConfig::default()
        };
        let mut c = candidates(15);
        for cand in c.iter_mut().take(6) {
            cand.registration_height = 105;
        }
        // Nine nodes are old enough; a quorum needs ten.
        assert!(matches!(
            build_quorum(&config, &c, 110, QuorumType::StateChange, &BlockHash([3; 32])),
            Err(QuorumError::InsufficientEligibleNodes { available: 9, .. })
        ));
    }

    #[test]
    fn input_order_does_not_matter() {
        let config = RulesConfig::default();
        let c = candidates(60);
        let mut reversed = c.clone();
        reversed.reverse();
        let hash = BlockHash([9; 32]);
        assert_eq!(
            build_quorum(&config, &c, 104, QuorumType::StateChange, &hash),
            build_quorum(&config, &reversed, 104, QuorumType::StateChange, &hash)
        );
    }

    #[test]
    fn different_blocks_differ() {
        let config = RulesConfig::default();
        let c = candidates(60);
        let a = build_quorum(&config, &c, 104, QuorumType::Checkpoint, &BlockHash([1; 32])).unwrap();
        let b = build_quorum(&config, &c, 104, QuorumType::Checkpoint, &BlockHash([2; 32])).unwrap();
        assert_ne!(a.validators, b.validators);
    }

    #[test]
    fn index_lookup() {
        let config = RulesConfig::default();
        let q = build_quorum(&config, &candidates(60), 104, QuorumType::StateChange, &BlockHash([1; 32]))
            .unwrap();
        let v = q.validators[3];
        assert_eq!(q.validator_index(&v), Some(3));
        assert_eq!(q.validator(3), Some(&v));
        assert_eq!(q.worker_index(&v), None);
        assert!(q.worker(50).is_none());
    }

    #[test]
    fn safe_height_trails_tip() {
        let config = RulesConfig::default();
        assert_eq!(latest_safe_height(&config, 120), Some(100));
        assert_eq!(latest_safe_height(&config, 10), None);
    }
}
