//! Consensus rules configuration.
//!
//! Every threshold the rule engine uses lives in [`RulesConfig`]. The
//! relationships between them are checked once by [`RulesConfig::validate`]
//! and the engine refuses to start from a configuration that fails it.

use std::path::Path;

use serde::{Deserialize, Serialize};
use snode_staking::{blocks_expected_in_days, blocks_expected_in_hours, NetworkType, TARGET_BLOCK_TIME_SECS};

use crate::error::ConfigError;
use crate::quorum::QuorumType;
use crate::threshold::allows_conflicting_outcomes;

/// Environment variable naming a JSON rules file.
pub const CONFIG_ENV_VAR: &str = "SNODE_RULES_CONFIG";

/// Swarm sizing and rebalancing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub ideal_size: usize,
    pub new_size: usize,
    /// Nodes above this size count as spare when deciding to build a new swarm.
    pub excess_base: usize,
    pub fill_lower_percentile: usize,
    pub redistribution_lower_percentile: usize,
    pub stealing_upper_percentile: usize,
    /// Queue slack kept before a new swarm is carved out.
    pub buffer: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 10,
            ideal_size: 7,
            new_size: 7,
            excess_base: 5,
            fill_lower_percentile: 25,
            redistribution_lower_percentile: 0,
            stealing_upper_percentile: 75,
            buffer: 5,
        }
    }
}

/// Consensus thresholds. `Default` is mainnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub nettype: NetworkType,

    // Decommission credit, in blocks of allowed downtime.
    pub decommission_credit_per_day: u64,
    pub decommission_initial_credit: u64,
    pub decommission_max_credit: u64,
    pub decommission_minimum: u64,

    // Checkpointing.
    pub checkpoint_interval: u64,
    pub checkpoint_store_persistently_interval: u64,
    pub checkpoint_vote_lifetime: u64,
    pub checkpoint_min_quorums_before_deregister_check: usize,
    pub checkpoint_max_missable_votes: usize,
    pub checkpoint_quorum_size: usize,
    pub checkpoint_min_votes: usize,

    // State change quorums.
    pub state_change_nth_of_network_to_test: usize,
    pub state_change_min_nodes_to_test: usize,
    pub state_change_quorum_size: usize,
    pub state_change_min_votes: usize,
    pub vote_lifetime: u64,
    pub min_time_in_s_before_voting: u64,

    pub max_reorg_blocks: u64,
    pub reorg_safety_buffer_in_blocks: u64,
    /// Blocks a built quorum and its node list snapshot are retained.
    pub quorum_lifetime: u64,

    // Uptime proof IP tracking; carried for completeness.
    pub ip_change_window_in_seconds: u64,
    pub ip_change_buffer_in_seconds: u64,

    pub swarm: SwarmConfig,
}

impl Default for RulesConfig {
    fn default() -> Self {
        let vote_lifetime = blocks_expected_in_hours(2);
        Self {
            nettype: NetworkType::Mainnet,
            decommission_credit_per_day: blocks_expected_in_hours(24) / 30,
            decommission_initial_credit: 0,
            decommission_max_credit: blocks_expected_in_hours(24),
            decommission_minimum: blocks_expected_in_hours(8),
            checkpoint_interval: 4,
            checkpoint_store_persistently_interval: 60,
            checkpoint_vote_lifetime: 60,
            checkpoint_min_quorums_before_deregister_check: 8,
            checkpoint_max_missable_votes: 4,
            checkpoint_quorum_size: 20,
            checkpoint_min_votes: 13,
            state_change_nth_of_network_to_test: 100,
            state_change_min_nodes_to_test: 50,
            state_change_quorum_size: 10,
            state_change_min_votes: 7,
            vote_lifetime,
            min_time_in_s_before_voting: 0,
            max_reorg_blocks: 11,
            reorg_safety_buffer_in_blocks: 20,
            quorum_lifetime: 6 * vote_lifetime,
            ip_change_window_in_seconds: 24 * 60 * 60,
            ip_change_buffer_in_seconds: 2 * 60 * 60,
            swarm: SwarmConfig::default(),
        }
    }
}

impl RulesConfig {
    /// Mainnet thresholds on another network.
    pub fn for_network(nettype: NetworkType) -> Self {
        Self {
            nettype,
            ..Self::default()
        }
    }

    /// Load and validate a JSON rules file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `SNODE_RULES_CONFIG`, or the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::from_json_file(path.trim()),
            _ => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Check the named invariants between thresholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("checkpoint_interval", self.checkpoint_interval),
            ("checkpoint_store_persistently_interval", self.checkpoint_store_persistently_interval),
            ("vote_lifetime", self.vote_lifetime),
            ("checkpoint_vote_lifetime", self.checkpoint_vote_lifetime),
            ("decommission_credit_per_day", self.decommission_credit_per_day),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        for (name, value) in [
            ("checkpoint_quorum_size", self.checkpoint_quorum_size),
            ("checkpoint_min_votes", self.checkpoint_min_votes),
            ("state_change_quorum_size", self.state_change_quorum_size),
            ("state_change_min_votes", self.state_change_min_votes),
            ("state_change_nth_of_network_to_test", self.state_change_nth_of_network_to_test),
            ("swarm.min_size", self.swarm.min_size),
            ("swarm.new_size", self.swarm.new_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }

        if self.decommission_initial_credit > self.decommission_max_credit {
            return Err(ConfigError::InitialCreditAboveMax {
                initial: self.decommission_initial_credit,
                max: self.decommission_max_credit,
            });
        }
        if self.decommission_minimum > self.decommission_max_credit {
            return Err(ConfigError::MinimumCreditAboveMax {
                minimum: self.decommission_minimum,
                max: self.decommission_max_credit,
            });
        }
        if self.checkpoint_max_missable_votes >= self.checkpoint_min_quorums_before_deregister_check {
            return Err(ConfigError::MissableVotesNotBelowRequired {
                missable: self.checkpoint_max_missable_votes,
                required: self.checkpoint_min_quorums_before_deregister_check,
            });
        }
        if self.state_change_min_votes > self.state_change_quorum_size {
            return Err(ConfigError::ThresholdAboveQuorumSize {
                quorum_type: QuorumType::StateChange,
                min_votes: self.state_change_min_votes,
                size: self.state_change_quorum_size,
            });
        }
        if self.checkpoint_min_votes > self.checkpoint_quorum_size {
            return Err(ConfigError::ThresholdAboveQuorumSize {
                quorum_type: QuorumType::Checkpoint,
                min_votes: self.checkpoint_min_votes,
                size: self.checkpoint_quorum_size,
            });
        }
        for (quorum_type, min_votes, size) in [
            (QuorumType::StateChange, self.state_change_min_votes, self.state_change_quorum_size),
            (QuorumType::Checkpoint, self.checkpoint_min_votes, self.checkpoint_quorum_size),
        ] {
            if allows_conflicting_outcomes(size, min_votes) {
                return Err(ConfigError::ThresholdNotMajority { quorum_type, min_votes, size });
            }
        }
        if self.reorg_safety_buffer_in_blocks >= self.vote_lifetime {
            return Err(ConfigError::SafetyBufferNotBelowVoteLifetime {
                buffer: self.reorg_safety_buffer_in_blocks,
                lifetime: self.vote_lifetime,
            });
        }
        let longest_vote_lifetime = self.vote_lifetime.max(self.checkpoint_vote_lifetime);
        if self.quorum_lifetime < longest_vote_lifetime {
            return Err(ConfigError::QuorumLifetimeTooShort {
                quorum_lifetime: self.quorum_lifetime,
                vote_lifetime: longest_vote_lifetime,
            });
        }

        let s = &self.swarm;
        let ordered = s.min_size <= s.ideal_size
            && s.ideal_size <= s.max_size
            && s.min_size <= s.new_size
            && s.new_size <= s.max_size;
        if !ordered {
            return Err(ConfigError::SwarmSizesOutOfOrder {
                min: s.min_size,
                ideal: s.ideal_size,
                new: s.new_size,
                max: s.max_size,
            });
        }
        if s.excess_base < s.min_size {
            return Err(ConfigError::ExcessBaseBelowMinimum {
                base: s.excess_base,
                min: s.min_size,
            });
        }
        for (name, value) in [
            ("fill_lower", s.fill_lower_percentile),
            ("redistribution_lower", s.redistribution_lower_percentile),
            ("stealing_upper", s.stealing_upper_percentile),
        ] {
            if value > 100 {
                return Err(ConfigError::PercentileOutOfRange { name, value });
            }
        }
        Ok(())
    }

    /// Blocks a node must have been registered before it may validate.
    pub fn min_blocks_before_voting(&self) -> u64 {
        self.min_time_in_s_before_voting / TARGET_BLOCK_TIME_SECS
    }

    /// Blocks a state change carried in a block stays valid for.
    pub fn state_change_tx_lifetime(&self) -> u64 {
        self.vote_lifetime
    }

    /// Expected blocks per day; the unit of credit accrual.
    pub fn blocks_per_day(&self) -> u64 {
        blocks_expected_in_days(1)
    }

    /// Vote lifetime for a quorum type.
    pub fn vote_lifetime_for(&self, quorum_type: QuorumType) -> u64 {
        match quorum_type {
            QuorumType::StateChange => self.vote_lifetime,
            QuorumType::Checkpoint => self.checkpoint_vote_lifetime,
        }
    }

    /// Votes needed to resolve a quorum of the given type.
    pub fn min_votes_for(&self, quorum_type: QuorumType) -> usize {
        match quorum_type {
            QuorumType::StateChange => self.state_change_min_votes,
            QuorumType::Checkpoint => self.checkpoint_min_votes,
        }
    }

    /// Validators in a quorum of the given type.
    pub fn quorum_size_for(&self, quorum_type: QuorumType) -> usize {
        match quorum_type {
            QuorumType::StateChange => self.state_change_quorum_size,
            QuorumType::Checkpoint => self.checkpoint_quorum_size,
        }
    }
}
