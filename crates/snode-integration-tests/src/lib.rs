//! Test harness for cross-crate scenarios.
//!
//! [`TestChain`] wraps a [`ServiceNodeList`] with deterministic keys and
//! block hashes and signs votes on behalf of its nodes.

use std::collections::BTreeMap;

use ed25519_dalek::SigningKey;
use snode_consensus::{
    BlockHash, BlockSummary, NewBlock, NewState, NodeKey, Quorum, QuorumType, Registration, RulesConfig,
    ServiceNodeList, Vote, VoteOutcome,
};
use snode_staking::{get_staking_requirement, KeyImage, NetworkType};

pub fn signing_key(i: u32) -> SigningKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"snode-test/node");
    hasher.update(&i.to_le_bytes());
    SigningKey::from_bytes(hasher.finalize().as_bytes())
}

pub fn node_key(i: u32) -> NodeKey {
    NodeKey::from(&signing_key(i).verifying_key())
}

pub fn key_image(i: u32) -> KeyImage {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"snode-test/key-image");
    hasher.update(&i.to_le_bytes());
    KeyImage(*hasher.finalize().as_bytes())
}

pub fn block_hash(height: u64) -> BlockHash {
    BlockHash(*blake3::hash(&height.to_le_bytes()).as_bytes())
}

/// Node `i` staking the full requirement alone.
pub fn full_stake_registration(nettype: NetworkType, i: u32, height: u64) -> Registration {
    Registration::solo(
        node_key(i),
        signing_key(i).verifying_key().to_bytes(),
        key_image(i),
        get_staking_requirement(nettype, height),
    )
}

pub struct TestChain {
    pub list: ServiceNodeList,
    signers: BTreeMap<NodeKey, SigningKey>,
}

impl TestChain {
    pub fn new(config: RulesConfig) -> Self {
        snode_logging::init_for_tests();
        Self {
            list: ServiceNodeList::in_memory(config).expect("valid rules"),
            signers: BTreeMap::new(),
        }
    }

    pub fn mainnet() -> Self {
        Self::new(RulesConfig::default())
    }

    /// Start the chain at `height` with `count` fully staked nodes.
    pub fn with_nodes(config: RulesConfig, count: u32, height: u64) -> Self {
        let mut chain = Self::new(config);
        let nettype = chain.list.config().nettype;
        let block = NewBlock {
            registrations: (0..count).map(|i| full_stake_registration(nettype, i, height)).collect(),
            ..NewBlock::empty(height, block_hash(height))
        };
        let summary = chain.apply(block);
        assert_eq!(summary.registered.len(), count as usize, "{:?}", summary.rejected_registrations);
        for i in 0..count {
            chain.signers.insert(node_key(i), signing_key(i));
        }
        chain
    }

    pub fn tip(&self) -> u64 {
        self.list.tip().expect("chain started")
    }

    pub fn apply(&mut self, block: NewBlock) -> BlockSummary {
        self.list.apply_block(block).expect("consecutive block")
    }

    /// Apply empty blocks up to and including `height`.
    pub fn advance_to(&mut self, height: u64) -> Vec<BlockSummary> {
        let mut summaries = Vec::new();
        for h in self.tip() + 1..=height {
            summaries.push(self.list.on_new_block(h, block_hash(h)).expect("consecutive block"));
        }
        summaries
    }

    /// As [`advance_to`](Self::advance_to), with every checkpoint validator
    /// not in `silent` voting on each new checkpoint block.
    pub fn advance_voting(&mut self, height: u64, silent: &[NodeKey]) -> Vec<BlockSummary> {
        let mut summaries = Vec::new();
        for h in self.tip() + 1..=height {
            summaries.push(self.list.on_new_block(h, block_hash(h)).expect("consecutive block"));
            self.vote_checkpoint(h, silent);
        }
        summaries
    }

    /// Every validator of the checkpoint quorum at `height` not in `silent`
    /// votes for the chain's block. Does nothing off the interval.
    pub fn vote_checkpoint(&mut self, height: u64, silent: &[NodeKey]) {
        let Some(quorum) = self.list.quorum(height, QuorumType::Checkpoint) else {
            return;
        };
        let votes: Vec<Vote> = (0..quorum.validators.len() as u16)
            .filter(|&i| !silent.contains(&quorum.validators[i as usize]))
            .map(|i| self.checkpoint_vote(&quorum, i))
            .collect();
        for result in self.list.add_votes(&votes) {
            result.expect("checkpoint vote accepted");
        }
    }

    pub fn quorum(&self, height: u64, quorum_type: QuorumType) -> std::sync::Arc<Quorum> {
        self.list.quorum(height, quorum_type).expect("quorum built")
    }

    fn signer(&self, key: &NodeKey) -> &SigningKey {
        self.signers.get(key).expect("known node")
    }

    /// Checkpoint vote by validator `voter_index` on the chain's block.
    pub fn checkpoint_vote(&self, quorum: &Quorum, voter_index: u16) -> Vote {
        let key = &quorum.validators[voter_index as usize];
        Vote::sign_checkpoint(self.signer(key), quorum.height, voter_index, block_hash(quorum.height))
    }

    pub fn state_change_vote(&self, quorum: &Quorum, voter_index: u16, worker_index: u16, state: NewState) -> Vote {
        let key = &quorum.validators[voter_index as usize];
        Vote::sign_state_change(self.signer(key), quorum.height, voter_index, worker_index, state)
    }

    /// Have validators `0..count` vote `state` for a worker; returns the
    /// outcome of the last vote.
    pub fn vote_state_change(&mut self, quorum: &Quorum, worker_index: u16, state: NewState, count: u16) -> VoteOutcome {
        let mut last = VoteOutcome::Recorded;
        for voter in 0..count {
            let vote = self.state_change_vote(quorum, voter, worker_index, state);
            last = self.list.add_vote(&vote).expect("state change vote accepted");
        }
        last
    }
}
