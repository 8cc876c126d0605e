//! Vote collection and threshold detection.
//!
//! Votes are keyed by height and quorum type. Checkpoint votes are unique
//! per voter; state change votes per voter and worker, since every validator
//! tests every worker. The first vote that takes a target to its threshold
//! resolves it and yields the event. Later votes for a resolved target are
//! kept for audit but never yield a second event.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RulesConfig;
use crate::error::VoteError;
use crate::node::{BlockHash, NodeKey};
use crate::quorum::{Quorum, QuorumType};
use crate::threshold::meets_threshold;
use crate::vote::{NewState, Vote, VoteGroup, VotePayload};

/// A worker's state change that reached its threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    /// Height of the quorum that voted.
    pub height: u64,
    pub worker_index: u16,
    pub worker: NodeKey,
    pub state: NewState,
    /// Voter index and signature of each agreeing vote.
    pub signatures: Vec<(u16, Vec<u8>)>,
}

/// A block attested by its checkpoint quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEvent {
    pub height: u64,
    pub block_hash: BlockHash,
    pub signatures: Vec<(u16, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThresholdEvent {
    StateChange(StateChangeEvent),
    Checkpoint(CheckpointEvent),
}

/// Result of an accepted vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    Recorded,
    ThresholdReached(ThresholdEvent),
    /// The target was already resolved; the vote changed nothing.
    AlreadyResolved,
}

#[derive(Debug, Default)]
struct StateChangeEntry {
    tallies: BTreeMap<(u16, NewState), BTreeMap<u16, [u8; 64]>>,
    /// (worker, voter) pairs seen.
    voted: BTreeSet<(u16, u16)>,
    resolved: BTreeSet<u16>,
}

#[derive(Debug, Default)]
struct CheckpointEntry {
    votes: BTreeMap<u16, [u8; 64]>,
    resolved: bool,
}

/// Pending votes for every live height.
#[derive(Debug)]
pub struct VotePool {
    vote_lifetime: u64,
    checkpoint_vote_lifetime: u64,
    state_change_min_votes: usize,
    checkpoint_min_votes: usize,
    state_changes: BTreeMap<u64, StateChangeEntry>,
    checkpoints: BTreeMap<u64, CheckpointEntry>,
}

impl VotePool {
    pub fn new(config: &RulesConfig) -> Self {
        Self {
            vote_lifetime: config.vote_lifetime,
            checkpoint_vote_lifetime: config.checkpoint_vote_lifetime,
            state_change_min_votes: config.state_change_min_votes,
            checkpoint_min_votes: config.checkpoint_min_votes,
            state_changes: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
        }
    }

    fn lifetime(&self, quorum_type: QuorumType) -> u64 {
        match quorum_type {
            QuorumType::StateChange => self.vote_lifetime,
            QuorumType::Checkpoint => self.checkpoint_vote_lifetime,
        }
    }

    /// Whether a vote for `height` may still be accepted at `tip`.
    pub fn check_window(&self, height: u64, quorum_type: QuorumType, tip: u64) -> Result<(), VoteError> {
        if height > tip {
            return Err(VoteError::FutureHeight { height, tip });
        }
        if tip - height > self.lifetime(quorum_type) {
            return Err(VoteError::StaleHeight { height, tip });
        }
        Ok(())
    }

    /// Validate and record a vote.
    ///
    /// `quorum` is the quorum of the vote's type at its height, if one was
    /// built, and `block_hash` the chain's hash at that height.
    pub fn add_vote(
        &mut self,
        vote: &Vote,
        quorum: Option<&Quorum>,
        block_hash: Option<&BlockHash>,
        tip: u64,
    ) -> Result<VoteOutcome, VoteError> {
        self.add_vote_checked(vote, quorum, block_hash, tip, None)
    }

    /// As [`add_vote`](Self::add_vote), with the signature check already done
    /// when `signature_ok` is set.
    pub(crate) fn add_vote_checked(
        &mut self,
        vote: &Vote,
        quorum: Option<&Quorum>,
        block_hash: Option<&BlockHash>,
        tip: u64,
        signature_ok: Option<bool>,
    ) -> Result<VoteOutcome, VoteError> {
        let quorum_type = vote.quorum_type();
        self.check_window(vote.height, quorum_type, tip)?;

        let quorum = quorum
            .filter(|q| q.height == vote.height && q.quorum_type == quorum_type)
            .ok_or(VoteError::NoQuorum {
                height: vote.height,
                quorum_type,
            })?;

        if vote.group != VoteGroup::Validator {
            return Err(VoteError::InvalidVoterGroup);
        }
        let voter = quorum.validator(vote.voter_index).ok_or(VoteError::VoterNotInQuorum {
            voter_index: vote.voter_index,
        })?;

        match vote.payload {
            VotePayload::StateChange { worker_index, .. } => {
                if quorum.worker(worker_index).is_none() {
                    return Err(VoteError::InvalidWorker { worker_index });
                }
            }
            VotePayload::Checkpoint { block_hash: voted } => {
                if block_hash != Some(&voted) {
                    return Err(VoteError::BlockHashMismatch { height: vote.height });
                }
            }
        }

        let valid = signature_ok.unwrap_or_else(|| vote.verify(voter));
        if !valid {
            return Err(VoteError::InvalidSignature {
                voter_index: vote.voter_index,
            });
        }

        match vote.payload {
            VotePayload::StateChange { worker_index, state } => {
                self.record_state_change(vote, quorum, worker_index, state)
            }
            VotePayload::Checkpoint { block_hash } => self.record_checkpoint(vote, block_hash),
        }
    }

    fn record_state_change(
        &mut self,
        vote: &Vote,
        quorum: &Quorum,
        worker_index: u16,
        state: NewState,
    ) -> Result<VoteOutcome, VoteError> {
        let required = self.state_change_min_votes;
        let entry = self.state_changes.entry(vote.height).or_default();
        let resolved = entry.resolved.contains(&worker_index);

        if !entry.voted.insert((worker_index, vote.voter_index)) {
            return if resolved {
                Ok(VoteOutcome::AlreadyResolved)
            } else {
                Err(VoteError::DuplicateVote {
                    voter_index: vote.voter_index,
                })
            };
        }

        let tally = entry.tallies.entry((worker_index, state)).or_default();
        tally.insert(vote.voter_index, vote.signature);
        if resolved {
            return Ok(VoteOutcome::AlreadyResolved);
        }
        if !meets_threshold(tally.len(), required) {
            debug!(height = vote.height, worker_index, votes = tally.len(), "Recorded state change vote");
            return Ok(VoteOutcome::Recorded);
        }

        entry.resolved.insert(worker_index);
        let worker = quorum.workers[worker_index as usize];
        info!(
            height = vote.height,
            worker = %worker,
            state = ?state,
            votes = tally.len(),
            "State change reached threshold"
        );
        Ok(VoteOutcome::ThresholdReached(ThresholdEvent::StateChange(StateChangeEvent {
            height: vote.height,
            worker_index,
            worker,
            state,
            signatures: tally.iter().map(|(i, s)| (*i, s.to_vec())).collect(),
        })))
    }

    fn record_checkpoint(&mut self, vote: &Vote, block_hash: BlockHash) -> Result<VoteOutcome, VoteError> {
        let required = self.checkpoint_min_votes;
        let entry = self.checkpoints.entry(vote.height).or_default();

        if entry.votes.contains_key(&vote.voter_index) {
            return if entry.resolved {
                Ok(VoteOutcome::AlreadyResolved)
            } else {
                Err(VoteError::DuplicateVote {
                    voter_index: vote.voter_index,
                })
            };
        }

        entry.votes.insert(vote.voter_index, vote.signature);
        if entry.resolved {
            return Ok(VoteOutcome::AlreadyResolved);
        }
        if !meets_threshold(entry.votes.len(), required) {
            debug!(height = vote.height, votes = entry.votes.len(), "Recorded checkpoint vote");
            return Ok(VoteOutcome::Recorded);
        }

        entry.resolved = true;
        info!(height = vote.height, block = %block_hash, votes = entry.votes.len(), "Checkpoint reached threshold");
        Ok(VoteOutcome::ThresholdReached(ThresholdEvent::Checkpoint(CheckpointEvent {
            height: vote.height,
            block_hash,
            signatures: entry.votes.iter().map(|(i, s)| (*i, s.to_vec())).collect(),
        })))
    }

    /// Validator indices that voted on the checkpoint at `height`.
    pub fn checkpoint_voters(&self, height: u64) -> BTreeSet<u16> {
        self.checkpoints
            .get(&height)
            .map(|e| e.votes.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Votes held for a height and quorum type.
    pub fn vote_count(&self, height: u64, quorum_type: QuorumType) -> usize {
        match quorum_type {
            QuorumType::StateChange => self
                .state_changes
                .get(&height)
                .map(|e| e.voted.len())
                .unwrap_or(0),
            QuorumType::Checkpoint => self.checkpoints.get(&height).map(|e| e.votes.len()).unwrap_or(0),
        }
    }

    /// Drop entries that fell out of their vote lifetime at `tip`.
    ///
    /// Returns the number of heights dropped.
    pub fn purge(&mut self, tip: u64) -> usize {
        let before = self.state_changes.len() + self.checkpoints.len();
        let (vote_lifetime, checkpoint_lifetime) = (self.vote_lifetime, self.checkpoint_vote_lifetime);
        self.state_changes.retain(|h, _| h.saturating_add(vote_lifetime) >= tip);
        self.checkpoints.retain(|h, _| h.saturating_add(checkpoint_lifetime) >= tip);
        before - (self.state_changes.len() + self.checkpoints.len())
    }

    pub fn is_empty(&self) -> bool {
        self.state_changes.is_empty() && self.checkpoints.is_empty()
    }
}
