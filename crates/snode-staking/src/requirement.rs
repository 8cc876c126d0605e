//! Staking requirement schedule.

use crate::network::{NetworkType, COIN};

/// One step of the staking requirement schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakingEpoch {
    /// First height the requirement applies to.
    pub from_height: u64,
    /// Required total stake in atomic units.
    pub requirement: u64,
}

/// Mainnet schedule, sorted by height and non-decreasing in requirement.
pub const MAINNET_STAKING_SCHEDULE: &[StakingEpoch] = &[
    StakingEpoch { from_height: 0, requirement: 25_000 * COIN },
    StakingEpoch { from_height: 262_800, requirement: 30_000 * COIN },
    StakingEpoch { from_height: 525_600, requirement: 35_000 * COIN },
    StakingEpoch { from_height: 788_400, requirement: 40_000 * COIN },
    StakingEpoch { from_height: 1_051_200, requirement: 45_000 * COIN },
    StakingEpoch { from_height: 1_314_000, requirement: 50_000 * COIN },
];

/// Flat requirement on the test networks.
const TEST_NETWORK_REQUIREMENT: u64 = 100 * COIN;

/// Total stake a service node needs at `height`.
pub fn get_staking_requirement(nettype: NetworkType, height: u64) -> u64 {
    match nettype {
        NetworkType::Testnet | NetworkType::Stagenet => TEST_NETWORK_REQUIREMENT,
        NetworkType::Mainnet => {
            // Schedule starts at height 0, so partition_point is always >= 1.
            let idx = MAINNET_STAKING_SCHEDULE.partition_point(|e| e.from_height <= height);
            MAINNET_STAKING_SCHEDULE[idx.saturating_sub(1)].requirement
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_sorted_and_non_decreasing() {
        assert_eq!(MAINNET_STAKING_SCHEDULE[0].from_height, 0);
        for pair in MAINNET_STAKING_SCHEDULE.windows(2) {
            assert!(pair[0].from_height < pair[1].from_height);
            assert!(pair[0].requirement <= pair[1].requirement);
        }
    }

    #[test]
    fn step_boundaries() {
        assert_eq!(get_staking_requirement(NetworkType::Mainnet, 0), 25_000 * COIN);
        assert_eq!(get_staking_requirement(NetworkType::Mainnet, 262_799), 25_000 * COIN);
        assert_eq!(get_staking_requirement(NetworkType::Mainnet, 262_800), 30_000 * COIN);
        assert_eq!(get_staking_requirement(NetworkType::Mainnet, u64::MAX), 50_000 * COIN);
    }

    #[test]
    fn test_networks_are_flat() {
        for height in [0, 1_000, 10_000_000] {
            assert_eq!(get_staking_requirement(NetworkType::Testnet, height), 100 * COIN);
            assert_eq!(get_staking_requirement(NetworkType::Stagenet, height), 100 * COIN);
        }
    }

    #[test]
    fn monotonic_over_heights() {
        let mut prev = 0;
        for height in (0..2_000_000).step_by(9_973) {
            let r = get_staking_requirement(NetworkType::Mainnet, height);
            assert!(r >= prev);
            prev = r;
        }
    }
}
