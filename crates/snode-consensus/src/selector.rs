//! Portable deterministic selection.
//!
//! Every node must draw the same numbers from the same seed, independent of
//! platform word size. Draws come from a ChaCha20 stream read as `u64`s and
//! are mapped into a range by rejection sampling, never by a bare modulo.

use rand::RngCore;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;

use crate::node::BlockHash;

const SEED_DOMAIN: &[u8] = b"snode/seed/v1";

/// What a seed is used for. Each purpose gets an independent stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeedDomain {
    StateChangeQuorum,
    CheckpointQuorum,
    Swarm,
}

impl SeedDomain {
    const fn tag(self) -> u8 {
        match self {
            SeedDomain::StateChangeQuorum => 0,
            SeedDomain::CheckpointQuorum => 1,
            SeedDomain::Swarm => 2,
        }
    }
}

/// A 32-byte generator seed derived from chain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumSeed(pub [u8; 32]);

impl QuorumSeed {
    /// Derive the seed for `domain` from the block at `height`.
    pub fn derive(block_hash: &BlockHash, domain: SeedDomain, height: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(SEED_DOMAIN);
        hasher.update(&[domain.tag()]);
        hasher.update(&height.to_le_bytes());
        hasher.update(&block_hash.0);
        Self(*hasher.finalize().as_bytes())
    }
}

/// Generator for a derived seed.
pub fn seeded_rng(seed: &QuorumSeed) -> ChaCha20Rng {
    ChaCha20Rng::from_seed(seed.0)
}

/// Unbiased integer in `[0, n)`. Returns 0 when `n` is 0.
///
/// Draws above the largest multiple of `n` are rejected and redrawn, then
/// the accepted draw is divided down into the range.
pub fn uniform_distribution_portable<R: RngCore + ?Sized>(rng: &mut R, n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let secure_max = u64::MAX - u64::MAX % n;
    loop {
        let x = rng.next_u64();
        if x < secure_max {
            return x / (secure_max / n);
        }
    }
}

/// Fisher-Yates shuffle driven by [`uniform_distribution_portable`].
pub fn shuffle_portable<T, R: RngCore + ?Sized>(rng: &mut R, items: &mut [T]) {
    for i in (1..items.len()).rev() {
        let j = uniform_distribution_portable(rng, i as u64 + 1) as usize;
        items.swap(i, j);
    }
}

/// Draw up to `k` items without replacement, in draw order.
///
/// Each pick is removed from the pool before the next draw.
pub fn sample_without_replacement<T, R: RngCore + ?Sized>(
    rng: &mut R,
    mut pool: Vec<T>,
    k: usize,
) -> Vec<T> {
    let take = k.min(pool.len());
    let mut picked = Vec::with_capacity(take);
    for _ in 0..take {
        let idx = uniform_distribution_portable(rng, pool.len() as u64) as usize;
        picked.push(pool.swap_remove(idx));
    }
    picked
}
