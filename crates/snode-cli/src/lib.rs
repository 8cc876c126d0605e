//! Deterministic chain simulation.
//!
//! Registers a set of solo-staked nodes, advances a hash chain and plays the
//! validators: every online validator votes on each checkpoint and tests the
//! workers of the state change quorum at the latest safe height. Nodes whose
//! index is a multiple of `offline_every` never respond, so they stop
//! voting and get voted off the network.

use std::collections::BTreeMap;

use ed25519_dalek::SigningKey;
use snode_consensus::{
    BlockHash, NewBlock, NodeKey, QuorumType, Registration, RulesConfig, ServiceNodeList, StateChangeTx,
    ThresholdEvent, Vote, VoteOutcome,
};
use serde::Serialize;
use snode_staking::{get_staking_requirement, KeyImage};
use tracing::{debug, info};

/// Simulation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    pub nodes: u32,
    pub blocks: u64,
    /// Every n-th node is offline. Zero keeps everyone online.
    pub offline_every: u32,
    /// Height of the first block.
    pub start_height: u64,
}

impl SimConfig {
    pub const DEFAULT: SimConfig = SimConfig {
        nodes: 60,
        blocks: 200,
        offline_every: 10,
        start_height: 1,
    };
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Counters collected over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    pub blocks: u64,
    pub registered: usize,
    pub checkpoint_votes: usize,
    pub state_change_votes: usize,
    pub rejected_votes: usize,
    pub checkpoints: usize,
    pub state_changes_applied: usize,
    pub state_changes_rejected: usize,
    pub quorums_built: usize,
    pub swarms_created: usize,
}

struct SimNode {
    index: u32,
    signer: SigningKey,
}

pub struct Simulation {
    config: SimConfig,
    list: ServiceNodeList,
    nodes: BTreeMap<NodeKey, SimNode>,
    hash: BlockHash,
    next_height: u64,
    last_tested: Option<u64>,
    pending: Vec<StateChangeTx>,
    stats: SimStats,
}

fn signer(index: u32) -> SigningKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"snode-sim/node");
    hasher.update(&index.to_le_bytes());
    SigningKey::from_bytes(hasher.finalize().as_bytes())
}

fn next_hash(prev: &BlockHash, height: u64) -> BlockHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&prev.0);
    hasher.update(&height.to_le_bytes());
    BlockHash(*hasher.finalize().as_bytes())
}

impl Simulation {
    pub fn new(rules: RulesConfig, config: SimConfig) -> snode_consensus::Result<Self> {
        let nodes = (0..config.nodes)
            .map(|index| {
                let signer = signer(index);
                (NodeKey::from(&signer.verifying_key()), SimNode { index, signer })
            })
            .collect();
        Ok(Self {
            list: ServiceNodeList::in_memory(rules)?,
            nodes,
            hash: BlockHash::default(),
            next_height: config.start_height,
            last_tested: None,
            pending: Vec::new(),
            stats: SimStats::default(),
            config,
        })
    }

    pub fn list(&self) -> &ServiceNodeList {
        &self.list
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    /// Whether the node with `key` is simulated as unresponsive.
    pub fn is_offline(&self, key: &NodeKey) -> bool {
        self.nodes
            .get(key)
            .is_some_and(|n| self.config.offline_every != 0 && n.index % self.config.offline_every == 0)
    }

    fn online_signer(&self, key: &NodeKey) -> Option<&SigningKey> {
        if self.is_offline(key) {
            return None;
        }
        self.nodes.get(key).map(|n| &n.signer)
    }

    fn registrations(&self, height: u64) -> Vec<Registration> {
        let amount = get_staking_requirement(self.list.config().nettype, height);
        self.nodes
            .iter()
            .map(|(key, node)| {
                let key_image = KeyImage(*blake3::hash(key.as_bytes()).as_bytes());
                Registration::solo(*key, node.signer.verifying_key().to_bytes(), key_image, amount)
            })
            .collect()
    }

    /// Run every configured block.
    pub fn run(&mut self) -> snode_consensus::Result<&SimStats> {
        for _ in 0..self.config.blocks {
            self.step()?;
        }
        Ok(&self.stats)
    }

    /// Apply one block, then vote on what it produced.
    pub fn step(&mut self) -> snode_consensus::Result<()> {
        let height = self.next_height;
        let hash = next_hash(&self.hash, height);
        let mut block = NewBlock::empty(height, hash);
        if height == self.config.start_height {
            block.registrations = self.registrations(height);
        }
        block.state_changes = std::mem::take(&mut self.pending);

        let summary = self.list.apply_block(block)?;
        self.hash = hash;
        self.next_height = height + 1;

        self.stats.blocks += 1;
        self.stats.registered += summary.registered.len();
        self.stats.state_changes_applied += summary.state_changes.len();
        self.stats.state_changes_rejected += summary.rejected_state_changes.len();
        self.stats.quorums_built += summary.quorums_built.len();
        self.stats.swarms_created += summary.swarms.created.len();
        if !summary.state_changes.is_empty() || !summary.swarms.is_empty() {
            info!(
                height,
                state_changes = summary.state_changes.len(),
                swarms_created = summary.swarms.created.len(),
                swarms_dissolved = summary.swarms.dissolved.len(),
                "Block"
            );
        }

        self.vote_checkpoint(height, hash);
        self.test_workers();
        Ok(())
    }

    fn vote_checkpoint(&mut self, height: u64, hash: BlockHash) {
        let Some(quorum) = self.list.quorum(height, QuorumType::Checkpoint) else {
            return;
        };
        let votes: Vec<Vote> = quorum
            .validators
            .iter()
            .enumerate()
            .filter_map(|(index, key)| {
                let signer = self.online_signer(key)?;
                let index = u16::try_from(index).ok()?;
                Some(Vote::sign_checkpoint(signer, height, index, hash))
            })
            .collect();
        self.stats.checkpoint_votes += votes.len();

        for result in self.list.add_votes(&votes) {
            match result {
                Ok(VoteOutcome::ThresholdReached(ThresholdEvent::Checkpoint(event))) => {
                    debug!(height = event.height, signatures = event.signatures.len(), "Checkpoint reached");
                    self.stats.checkpoints += 1;
                }
                Ok(_) => {}
                Err(_) => self.stats.rejected_votes += 1,
            }
        }
    }

    /// Online validators vote against every offline worker of the quorum at
    /// the latest safe height.
    fn test_workers(&mut self) {
        let Some(height) = self.list.latest_safe_height() else {
            return;
        };
        if self.last_tested.is_some_and(|h| h >= height) {
            return;
        }
        self.last_tested = Some(height);
        let Some(quorum) = self.list.quorum(height, QuorumType::StateChange) else {
            return;
        };

        let mut votes = Vec::new();
        for (worker_index, worker) in quorum.workers.iter().enumerate() {
            if !self.is_offline(worker) {
                continue;
            }
            let (Some(state), Ok(worker_index)) = (self.list.penalty_for(worker), u16::try_from(worker_index)) else {
                continue;
            };
            for (voter_index, key) in quorum.validators.iter().enumerate() {
                let (Some(signer), Ok(voter_index)) = (self.online_signer(key), u16::try_from(voter_index)) else {
                    continue;
                };
                votes.push(Vote::sign_state_change(signer, height, voter_index, worker_index, state));
            }
        }
        self.stats.state_change_votes += votes.len();

        for result in self.list.add_votes(&votes) {
            match result {
                Ok(VoteOutcome::ThresholdReached(ThresholdEvent::StateChange(event))) => {
                    info!(node = %event.worker, state = ?event.state, height = event.height, "Voted off");
                    self.pending.push(StateChangeTx::from(&event));
                }
                Ok(_) => {}
                Err(_) => self.stats.rejected_votes += 1,
            }
        }
    }
}
