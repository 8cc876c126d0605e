//! Service Node Staking Rules
//!
//! Pure, deterministic arithmetic shared by every node that validates
//! service node registrations and stake unlocks.
//!
//! # Portions
//!
//! A stake is split between up to [`MAX_NUMBER_OF_CONTRIBUTORS`] contributors.
//! Each share is expressed in fixed-point **portions** out of
//! [`STAKING_PORTIONS_TOTAL`], so a share never depends on the (height
//! dependent) staking requirement it is later applied to.
//!
//! ```text
//! amount   = floor(portions * requirement / STAKING_PORTIONS_TOTAL)
//! portions = ceil(amount * STAKING_PORTIONS_TOTAL / requirement)
//! ```
//!
//! Both directions use a 128-bit intermediate. Rounding the inverse up makes
//! `amount -> portions -> amount` exact.
//!
//! # Lock Periods
//!
//! Contributions are locked for [`staking_num_lock_blocks`] after
//! registration. An unlock request signed by the contributor schedules the
//! release at the end of the current lock period.

mod error;
mod network;
mod portions;
mod requirement;
mod unlock;

pub use error::{Result, StakingError, UnstakeError};
pub use network::{
    blocks_expected_in_days, blocks_expected_in_hours, staking_num_lock_blocks, NetworkType,
    BLOCKS_PER_DAY, COIN, TARGET_BLOCK_TIME_SECS,
};
pub use portions::{
    check_service_node_portions, get_min_node_contribution,
    get_min_node_contribution_in_portions, get_portions_from_percent_str,
    get_portions_to_make_amount, portions_to_amount, MAX_KEY_IMAGES_PER_CONTRIBUTOR,
    MAX_NUMBER_OF_CONTRIBUTORS, MIN_PORTIONS, STAKING_PORTIONS_TOTAL,
};
pub use requirement::{get_staking_requirement, StakingEpoch, MAINNET_STAKING_SCHEDULE};
pub use unlock::{
    generate_request_stake_unlock_hash, get_locked_key_image_unlock_height, validate_unstake_tx,
    KeyImage, KeyImageUnlock, LockedContribution, UnstakeTx, KEY_IMAGE_AWAITING_UNLOCK_HEIGHT,
};

// u64::MAX was the historical "could not compute" marker; it must never be a
// legal portion total.
const _: () = assert!(STAKING_PORTIONS_TOTAL != u64::MAX);

// Every contributor slot must be able to hold the minimum share.
const _: () = assert!(
    MIN_PORTIONS as u128 * MAX_NUMBER_OF_CONTRIBUTORS as u128 <= STAKING_PORTIONS_TOTAL as u128
);
