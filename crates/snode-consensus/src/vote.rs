//! Quorum votes and their signing digests.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::node::{BlockHash, NodeKey};
use crate::quorum::QuorumType;

const VOTE_DOMAIN: &[u8] = b"snode/vote/v1";

/// Which list of the quorum the voter index points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VoteGroup {
    Validator,
    Worker,
}

impl VoteGroup {
    const fn tag(self) -> u8 {
        match self {
            VoteGroup::Validator => 0,
            VoteGroup::Worker => 1,
        }
    }
}

/// State a state change vote proposes for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NewState {
    Deregister,
    Decommission,
    Recommission,
}

impl NewState {
    const fn tag(self) -> u8 {
        match self {
            NewState::Deregister => 0,
            NewState::Decommission => 1,
            NewState::Recommission => 2,
        }
    }
}

/// What a vote is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VotePayload {
    StateChange { worker_index: u16, state: NewState },
    Checkpoint { block_hash: BlockHash },
}

/// A signed quorum vote, as received from the relay layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub height: u64,
    pub group: VoteGroup,
    pub voter_index: u16,
    pub payload: VotePayload,
    pub signature: [u8; 64],
}

impl Vote {
    /// Quorum the vote belongs to.
    pub fn quorum_type(&self) -> QuorumType {
        match self.payload {
            VotePayload::StateChange { .. } => QuorumType::StateChange,
            VotePayload::Checkpoint { .. } => QuorumType::Checkpoint,
        }
    }

    /// Worker a state change vote is about.
    pub fn worker_index(&self) -> Option<u16> {
        match self.payload {
            VotePayload::StateChange { worker_index, .. } => Some(worker_index),
            VotePayload::Checkpoint { .. } => None,
        }
    }

    /// Digest the voter signs.
    pub fn signing_digest(&self) -> [u8; 32] {
        signing_digest(self.height, self.group, self.voter_index, &self.payload)
    }

    /// Check the signature against the voter's key.
    pub fn verify(&self, voter: &NodeKey) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(voter.as_bytes()) else {
            return false;
        };
        let signature = Signature::from_bytes(&self.signature);
        key.verify_strict(&self.signing_digest(), &signature).is_ok()
    }

    /// Sign a validator vote.
    pub fn sign(key: &SigningKey, height: u64, voter_index: u16, payload: VotePayload) -> Self {
        let digest = signing_digest(height, VoteGroup::Validator, voter_index, &payload);
        Self {
            height,
            group: VoteGroup::Validator,
            voter_index,
            payload,
            signature: key.sign(&digest).to_bytes(),
        }
    }

    /// Sign a vote to move worker `worker_index` to `state`.
    pub fn sign_state_change(
        key: &SigningKey,
        height: u64,
        voter_index: u16,
        worker_index: u16,
        state: NewState,
    ) -> Self {
        Self::sign(key, height, voter_index, VotePayload::StateChange { worker_index, state })
    }

    /// Sign a vote attesting `block_hash` at `height`.
    pub fn sign_checkpoint(key: &SigningKey, height: u64, voter_index: u16, block_hash: BlockHash) -> Self {
        Self::sign(key, height, voter_index, VotePayload::Checkpoint { block_hash })
    }
}

fn signing_digest(height: u64, group: VoteGroup, voter_index: u16, payload: &VotePayload) -> [u8; 32] {
    let quorum_type = match payload {
        VotePayload::StateChange { .. } => QuorumType::StateChange,
        VotePayload::Checkpoint { .. } => QuorumType::Checkpoint,
    };
    let mut hasher = blake3::Hasher::new();
    hasher.update(VOTE_DOMAIN);
    hasher.update(&[quorum_type.tag()]);
    hasher.update(&height.to_le_bytes());
    hasher.update(&[group.tag()]);
    hasher.update(&voter_index.to_le_bytes());
    match payload {
        VotePayload::StateChange { worker_index, state } => {
            hasher.update(&worker_index.to_le_bytes());
            hasher.update(&[state.tag()]);
        }
        VotePayload::Checkpoint { block_hash } => {
            hasher.update(&block_hash.0);
        }
    }
    *hasher.finalize().as_bytes()
}
