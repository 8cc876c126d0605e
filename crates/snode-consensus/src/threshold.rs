//! Vote thresholds and fault tolerance of fixed-size quorums.
//!
//! A quorum of `size` validators resolves once `required` of them agree:
//! - state change: 7 of 10
//! - checkpoint: 13 of 20
//!
//! `required` must be a strict majority of `size`, otherwise two conflicting
//! outcomes could both resolve.

/// Check if a vote count meets the threshold.
pub const fn meets_threshold(votes: usize, required: usize) -> bool {
    votes >= required
}

/// Whether two conflicting outcomes could both reach `required` votes.
///
/// Never true when `required` is a strict majority of the quorum.
pub const fn allows_conflicting_outcomes(quorum_size: usize, required: usize) -> bool {
    2 * required <= quorum_size
}

/// Whether `height` carries a checkpoint quorum.
pub const fn is_checkpoint_height(height: u64, interval: u64) -> bool {
    interval != 0 && height % interval == 0
}

/// Whether a checkpoint at `height` is written to durable storage.
pub const fn is_persistent_checkpoint(height: u64, persist_interval: u64) -> bool {
    persist_interval != 0 && height % persist_interval == 0
}
