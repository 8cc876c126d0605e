//! Fixed-point stake portions.

use crate::error::{Result, StakingError};

/// Portions representing a complete stake.
///
/// Divisible by four so every contributor slot can hold exactly a quarter.
pub const STAKING_PORTIONS_TOTAL: u64 = 0xffff_ffff_ffff_fffc;

/// Contributors that may share one service node.
pub const MAX_NUMBER_OF_CONTRIBUTORS: usize = 4;

/// Smallest share a contributor may hold while the stake is not yet full.
pub const MIN_PORTIONS: u64 = STAKING_PORTIONS_TOTAL / MAX_NUMBER_OF_CONTRIBUTORS as u64;

/// Locked outputs (key images) a single contributor may use.
pub const MAX_KEY_IMAGES_PER_CONTRIBUTOR: usize = 1;

/// Longest fractional part accepted by [`get_portions_from_percent_str`].
const MAX_PERCENT_DECIMALS: u32 = 16;

/// Convert portions into an absolute amount of a staking requirement.
///
/// Truncates. Fails only when `portions` exceeds the total by enough to
/// overflow 64 bits.
pub fn portions_to_amount(portions: u64, staking_requirement: u64) -> Result<u64> {
    let wide = portions as u128 * staking_requirement as u128 / STAKING_PORTIONS_TOTAL as u128;
    u64::try_from(wide).map_err(|_| StakingError::ArithmeticOverflow("portions_to_amount"))
}

/// Smallest number of portions worth at least `amount`.
///
/// Rounds up, so `portions_to_amount(get_portions_to_make_amount(r, a), r) == a`
/// for every `a <= r <= STAKING_PORTIONS_TOTAL`.
pub fn get_portions_to_make_amount(staking_requirement: u64, amount: u64) -> Result<u64> {
    if staking_requirement == 0 {
        return Err(StakingError::ZeroStakingRequirement);
    }
    let numerator = amount as u128 * STAKING_PORTIONS_TOTAL as u128;
    let wide = numerator.div_ceil(staking_requirement as u128);
    u64::try_from(wide).map_err(|_| StakingError::ArithmeticOverflow("get_portions_to_make_amount"))
}

/// Minimum amount the next contributor must lock.
///
/// The still-needed amount is split evenly over the remaining slots, so a
/// contributor cannot take a share that leaves the stake unfillable.
pub fn get_min_node_contribution(
    staking_requirement: u64,
    total_reserved: u64,
    num_contributions: usize,
) -> Result<u64> {
    let max_slots = MAX_NUMBER_OF_CONTRIBUTORS * MAX_KEY_IMAGES_PER_CONTRIBUTOR;
    if num_contributions >= max_slots {
        return Err(StakingError::NoContributionSlots {
            used: num_contributions,
            max: max_slots,
        });
    }
    if total_reserved >= staking_requirement {
        return Err(StakingError::RequirementAlreadyMet {
            reserved: total_reserved,
            requirement: staking_requirement,
        });
    }

    let needed = staking_requirement - total_reserved;
    let remaining_slots = (max_slots - num_contributions) as u64;
    Ok(needed / remaining_slots)
}

/// [`get_min_node_contribution`] expressed in portions.
pub fn get_min_node_contribution_in_portions(
    staking_requirement: u64,
    total_reserved: u64,
    num_contributions: usize,
) -> Result<u64> {
    let amount = get_min_node_contribution(staking_requirement, total_reserved, num_contributions)?;
    get_portions_to_make_amount(staking_requirement, amount)
}

/// Check a registration's contributor shares.
///
/// Rejects an empty list, more than [`MAX_NUMBER_OF_CONTRIBUTORS`] entries,
/// any share below `min(MIN_PORTIONS, remaining)` and a sum above
/// [`STAKING_PORTIONS_TOTAL`].
pub fn check_service_node_portions(portions: &[u64]) -> bool {
    if portions.is_empty() || portions.len() > MAX_NUMBER_OF_CONTRIBUTORS {
        return false;
    }

    let mut reserved: u64 = 0;
    for &share in portions {
        let remaining = match STAKING_PORTIONS_TOTAL.checked_sub(reserved) {
            Some(remaining) => remaining,
            None => return false,
        };
        if share < MIN_PORTIONS.min(remaining) {
            return false;
        }
        reserved = match reserved.checked_add(share) {
            Some(sum) => sum,
            None => return false,
        };
    }

    reserved <= STAKING_PORTIONS_TOTAL
}

/// Parse a percentage such as `"12.5%"` into portions.
///
/// Exact decimal arithmetic; the trailing `%` is optional.
pub fn get_portions_from_percent_str(input: &str) -> Result<u64> {
    let invalid = || StakingError::InvalidPercent(input.to_string());

    let trimmed = input.trim();
    let number = trimmed.strip_suffix('%').unwrap_or(trimmed);
    let (int_part, frac_part) = match number.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (number, ""),
    };

    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    if frac_part.len() > MAX_PERCENT_DECIMALS as usize {
        return Err(invalid());
    }
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int_part) || !all_digits(frac_part) {
        return Err(invalid());
    }

    let scale = 10u128.pow(frac_part.len() as u32);
    let mut value: u128 = 0;
    for b in int_part.bytes().chain(frac_part.bytes()) {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u128))
            .ok_or_else(invalid)?;
        if value > 100 * 10u128.pow(MAX_PERCENT_DECIMALS) {
            return Err(invalid());
        }
    }

    if value > 100 * scale {
        return Err(invalid());
    }

    let portions = value * STAKING_PORTIONS_TOTAL as u128 / (100 * scale);
    u64::try_from(portions).map_err(|_| invalid())
}
