//! Service Node Consensus Rules
//!
//! A deterministic rule engine for a staked service node network. Every
//! node on the chain runs the same rules over the same blocks and arrives
//! at the same answer, so nothing here reads a clock, a thread-local RNG or
//! the network.
//!
//! # Per block
//!
//! 1. Registrations, unlock requests and state changes carried by the block
//!    are applied to a copy of the previous node list
//! 2. Decommission credit accrues and checkpoint participation is tallied
//! 3. Swarms are rebalanced with randomness seeded from the block hash
//! 4. Quorums for the new height are built and persisted
//!
//! # Votes
//!
//! Validators in a quorum sign votes. The [`VotePool`] collects them and
//! reports when a threshold is first reached; the resulting
//! [`StateChangeEvent`] or [`CheckpointEvent`] is what goes into a later
//! block or the checkpoint store.
//!
//! # Determinism
//!
//! All selection goes through [`selector`]: a ChaCha20 stream seeded by
//! `blake3(domain, block hash, height)` and a rejection-sampled uniform
//! draw that gives the same values on every platform.

pub mod checkpoint;
pub mod config;
pub mod credit;
pub mod error;
pub mod list;
pub mod node;
pub mod pool;
pub mod quorum;
pub mod selector;
pub mod store;
pub mod swarm;
pub mod threshold;
pub mod vote;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{RulesConfig, SwarmConfig, CONFIG_ENV_VAR};
pub use credit::{CreditAccount, CreditLedger};
pub use error::{
    ConfigError, CreditError, Error, QuorumError, RegistrationError, Result, SinkError,
    StateChangeError, UnlockError, VoteError,
};
pub use list::{BlockSummary, ListSnapshot, NewBlock, ServiceNodeList, StateChangeTx};
pub use node::{
    BlockHash, Contributor, NodeKey, NodeState, Registration, RegistrationContribution, ServiceNode,
};
pub use pool::{CheckpointEvent, StateChangeEvent, ThresholdEvent, VoteOutcome, VotePool};
pub use quorum::{build_quorum, latest_safe_height, Quorum, QuorumCandidate, QuorumType};
pub use selector::{
    sample_without_replacement, seeded_rng, shuffle_portable, uniform_distribution_portable,
    QuorumSeed, SeedDomain,
};
pub use store::{MemoryStateSink, NodeRecord, StateSink};
pub use swarm::{RebalanceReport, SwarmHealth, SwarmId, SwarmManager, QUEUE_SWARM_ID, UNASSIGNED_SWARM_ID};
pub use threshold::{allows_conflicting_outcomes, is_checkpoint_height, is_persistent_checkpoint, meets_threshold};
pub use vote::{NewState, Vote, VoteGroup, VotePayload};
