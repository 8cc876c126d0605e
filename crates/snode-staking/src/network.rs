//! Network types and block timing.

/// Target block time in seconds.
pub const TARGET_BLOCK_TIME_SECS: u64 = 120;

/// Atomic units per coin.
pub const COIN: u64 = 1_000_000_000;

/// Blocks expected in `hours` at the target block time.
pub const fn blocks_expected_in_hours(hours: u64) -> u64 {
    hours * 3600 / TARGET_BLOCK_TIME_SECS
}

/// Blocks expected in `days` at the target block time.
pub const fn blocks_expected_in_days(days: u64) -> u64 {
    blocks_expected_in_hours(days * 24)
}

/// Blocks expected per day.
pub const BLOCKS_PER_DAY: u64 = blocks_expected_in_days(1);

/// Which chain the rules are evaluated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum NetworkType {
    #[default]
    Mainnet,
    Testnet,
    Stagenet,
}

impl NetworkType {
    /// Short lowercase name, as used in config files.
    pub const fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Mainnet => "mainnet",
            NetworkType::Testnet => "testnet",
            NetworkType::Stagenet => "stagenet",
        }
    }
}

impl std::fmt::Display for NetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of blocks a contribution stays locked after registration.
///
/// Two days on the test networks, thirty on mainnet.
pub const fn staking_num_lock_blocks(nettype: NetworkType) -> u64 {
    match nettype {
        NetworkType::Testnet | NetworkType::Stagenet => blocks_expected_in_days(2),
        NetworkType::Mainnet => blocks_expected_in_days(30),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_timing() {
        assert_eq!(blocks_expected_in_hours(1), 30);
        assert_eq!(blocks_expected_in_hours(24), 720);
        assert_eq!(BLOCKS_PER_DAY, 720);
    }

    #[test]
    fn lock_periods() {
        assert_eq!(staking_num_lock_blocks(NetworkType::Testnet), 1440);
        assert_eq!(staking_num_lock_blocks(NetworkType::Stagenet), 1440);
        assert_eq!(staking_num_lock_blocks(NetworkType::Mainnet), 21600);
    }
}
