//! Error types for snode-consensus.
//!
//! Every failure crossing the rule-engine boundary is a value. Callers use
//! [`VoteError::is_rule_violation`] to decide whether the peer that relayed
//! a vote should be penalised.

use snode_staking::{StakingError, UnstakeError};
use thiserror::Error;

use crate::node::{NodeKey, NodeState};
use crate::quorum::QuorumType;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum Error {
    /// Blocks must arrive exactly once, in height order.
    #[error("out of order block: expected height {expected}, got {got}")]
    OutOfOrderBlock { expected: u64, got: u64 },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Quorum(#[from] QuorumError),

    #[error(transparent)]
    Vote(#[from] VoteError),
}

/// A named configuration invariant does not hold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("initial decommission credit {initial} exceeds maximum {max}")]
    InitialCreditAboveMax { initial: u64, max: u64 },

    #[error("decommission minimum {minimum} exceeds maximum credit {max}")]
    MinimumCreditAboveMax { minimum: u64, max: u64 },

    #[error("checkpoint missable votes {missable} must be below required quorums {required}")]
    MissableVotesNotBelowRequired { missable: usize, required: usize },

    #[error("{quorum_type} quorum needs {min_votes} votes but only has {size} members")]
    ThresholdAboveQuorumSize {
        quorum_type: QuorumType,
        min_votes: usize,
        size: usize,
    },

    #[error("{quorum_type} quorum of {size} resolves on {min_votes} votes, which is not a strict majority")]
    ThresholdNotMajority {
        quorum_type: QuorumType,
        min_votes: usize,
        size: usize,
    },

    #[error("reorg safety buffer {buffer} must be below vote lifetime {lifetime}")]
    SafetyBufferNotBelowVoteLifetime { buffer: u64, lifetime: u64 },

    #[error("swarm sizes must satisfy min <= ideal <= max and min <= new <= max (min {min}, ideal {ideal}, new {new}, max {max})")]
    SwarmSizesOutOfOrder {
        min: usize,
        ideal: usize,
        new: usize,
        max: usize,
    },

    #[error("swarm excess base {base} must be at least the minimum swarm size {min}")]
    ExcessBaseBelowMinimum { base: usize, min: usize },

    #[error("{name} percentile {value} is above 100")]
    PercentileOutOfRange { name: &'static str, value: usize },

    #[error("{name} must be non-zero")]
    Zero { name: &'static str },

    #[error("quorum lifetime {quorum_lifetime} is shorter than vote lifetime {vote_lifetime}")]
    QuorumLifetimeTooShort { quorum_lifetime: u64, vote_lifetime: u64 },

    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Quorum construction failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuorumError {
    /// Transient: the network is too small. No quorum exists for the height.
    #[error("insufficient eligible nodes for {quorum_type} quorum: need {needed}, have {available}")]
    InsufficientEligibleNodes {
        quorum_type: QuorumType,
        needed: usize,
        available: usize,
    },

    /// No retained snapshot for the height.
    #[error("no node list snapshot for height {0}")]
    UnknownHeight(u64),

    #[error("height {0} is not a checkpoint height")]
    NotACheckpointHeight(u64),
}

/// Vote rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoteError {
    #[error("vote for height {height} is older than the lifetime allows at tip {tip}")]
    StaleHeight { height: u64, tip: u64 },

    #[error("vote for height {height} is ahead of tip {tip}")]
    FutureHeight { height: u64, tip: u64 },

    #[error("no {quorum_type} quorum at height {height}")]
    NoQuorum { height: u64, quorum_type: QuorumType },

    #[error("only validators may vote")]
    InvalidVoterGroup,

    #[error("voter index {voter_index} is not a validator of the quorum")]
    VoterNotInQuorum { voter_index: u16 },

    #[error("worker index {worker_index} is not a worker of the quorum")]
    InvalidWorker { worker_index: u16 },

    #[error("checkpoint vote names a different block than height {height}")]
    BlockHashMismatch { height: u64 },

    #[error("signature of voter {voter_index} does not verify")]
    InvalidSignature { voter_index: u16 },

    #[error("voter {voter_index} already voted")]
    DuplicateVote { voter_index: u16 },
}

impl VoteError {
    /// Whether the vote breaks consensus rules (hostile or buggy peer), as
    /// opposed to arriving late, early or twice.
    pub fn is_rule_violation(&self) -> bool {
        matches!(
            self,
            VoteError::InvalidVoterGroup
                | VoteError::VoterNotInQuorum { .. }
                | VoteError::InvalidWorker { .. }
                | VoteError::BlockHashMismatch { .. }
                | VoteError::InvalidSignature { .. }
        )
    }
}

/// Decommission credit ledger failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CreditError {
    #[error("node {0} has no credit account")]
    UnknownNode(NodeKey),

    #[error("node {node} has {credit} credit, needs {minimum} to decommission")]
    InsufficientCredit {
        node: NodeKey,
        credit: u64,
        minimum: u64,
    },

    #[error("node {0} is already decommissioned")]
    AlreadyDecommissioned(NodeKey),

    #[error("node {0} is not decommissioned")]
    NotDecommissioned(NodeKey),
}

/// Registration rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("node {0} is already registered")]
    AlreadyRegistered(NodeKey),

    #[error("registration has no contributions")]
    NoContributions,

    #[error("registration has {0} contributors")]
    TooManyContributors(usize),

    #[error("contributor {contributor} locks {count} key images")]
    TooManyKeyImages { contributor: String, count: usize },

    #[error("key image {0} is already locked")]
    DuplicateKeyImage(String),

    #[error("contribution {index} of {amount} is below the minimum {minimum}")]
    BelowMinimum { index: usize, amount: u64, minimum: u64 },

    #[error("contributor portions are invalid or oversubscribed")]
    InvalidPortions,

    #[error("stake {total} does not meet requirement {requirement}")]
    Underfunded { total: u64, requirement: u64 },

    #[error("operator fee {0} exceeds the portion total")]
    InvalidOperatorFee(u64),

    #[error(transparent)]
    Staking(#[from] StakingError),
}

/// State changes carried by a block that cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateChangeError {
    #[error("node {0} is not registered")]
    UnknownNode(NodeKey),

    #[error("node {node} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        node: NodeKey,
        from: NodeState,
        to: NodeState,
    },

    #[error("worker {worker_index} of the quorum at height {height} is not {node}")]
    WorkerMismatch {
        node: NodeKey,
        height: u64,
        worker_index: u16,
    },

    #[error("no state change quorum retained for height {0}")]
    NoQuorum(u64),

    #[error("state change for height {height} is not valid in block {block_height}")]
    Expired { height: u64, block_height: u64 },

    #[error(transparent)]
    Credit(#[from] CreditError),
}

/// Unlock requests carried by a block that cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnlockError {
    #[error("unlock transaction carries no key image")]
    MissingKeyImage,

    #[error("key image {0} is not locked by any service node")]
    UnknownKeyImage(String),

    #[error("{0}")]
    Rejected(#[from] UnstakeError),
}

/// Persistence sink failures.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_violations_are_classified() {
        assert!(VoteError::InvalidSignature { voter_index: 1 }.is_rule_violation());
        assert!(VoteError::VoterNotInQuorum { voter_index: 99 }.is_rule_violation());
        assert!(VoteError::BlockHashMismatch { height: 4 }.is_rule_violation());
        assert!(!VoteError::DuplicateVote { voter_index: 1 }.is_rule_violation());
        assert!(!VoteError::StaleHeight { height: 1, tip: 100 }.is_rule_violation());
        assert!(!VoteError::FutureHeight { height: 101, tip: 100 }.is_rule_violation());
    }

    #[test]
    fn unlock_rejection_keeps_reason() {
        let err = UnlockError::from(UnstakeError::MissingUnlockField);
        assert_eq!(err.to_string(), UnstakeError::MissingUnlockField.reason());
    }
}
