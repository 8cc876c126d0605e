//! Error types for snode-staking.

use thiserror::Error;

/// Result type for staking arithmetic.
pub type Result<T> = std::result::Result<T, StakingError>;

/// Failures of the staking arithmetic.
///
/// These reject the transaction being validated; none of them is fatal to
/// the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StakingError {
    /// An intermediate or final value does not fit in 64 bits.
    #[error("arithmetic overflow computing {0}")]
    ArithmeticOverflow(&'static str),

    /// Division by a zero staking requirement.
    #[error("staking requirement must be non-zero")]
    ZeroStakingRequirement,

    /// Every contributor slot is already taken.
    #[error("no contribution slots left ({used} of {max} used)")]
    NoContributionSlots { used: usize, max: usize },

    /// The reserved amount already covers the requirement.
    #[error("reserved amount {reserved} already meets requirement {requirement}")]
    RequirementAlreadyMet { reserved: u64, requirement: u64 },

    /// A percentage string could not be parsed or is outside [0, 100].
    #[error("invalid percentage {0:?}")]
    InvalidPercent(String),
}

/// Reasons an unlock (unstake) request is rejected.
///
/// The `Display` text is the human-readable reason handed back to the
/// transaction validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnstakeError {
    #[error("unlock transaction must not have inputs or outputs (inputs: {inputs}, outputs: {outputs})")]
    HasInputsOrOutputs { inputs: usize, outputs: usize },

    #[error("could not find key image unlock in transaction extra")]
    MissingUnlockField,

    #[error("key image {0} does not belong to the referenced contribution")]
    KeyImageMismatch(String),

    #[error("unlock already requested for key image {key_image}, unlocks at height {unlock_height}")]
    AlreadyRequested { key_image: String, unlock_height: u64 },

    #[error("unlock signature does not verify against contributor key")]
    InvalidSignature,

    #[error("unlock requested at height {height} before registration at height {registered}")]
    BeforeRegistration { height: u64, registered: u64 },
}

impl UnstakeError {
    /// Human-readable rejection reason.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}
