//! Stake unlock (unstake) requests.
//!
//! A contributor releases a locked contribution by publishing a transaction
//! whose extra field names the locked key image, a nonce, and a signature
//! over [`generate_request_stake_unlock_hash`] made with the contributor key.
//! The contribution is released at the end of the lock period the request
//! lands in.

use ed25519_dalek::{Signature, VerifyingKey};

use crate::error::UnstakeError;
use crate::network::{staking_num_lock_blocks, NetworkType};

/// Unlock height of a contribution that has not requested an unlock.
pub const KEY_IMAGE_AWAITING_UNLOCK_HEIGHT: u64 = 0;

/// Domain tag for unlock request digests.
const UNLOCK_HASH_DOMAIN: &[u8] = b"snode/stake-unlock/v1";

/// Key image of a locked staking output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeyImage(pub [u8; 32]);

impl KeyImage {
    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for KeyImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

/// The key image unlock field carried in a transaction's extra.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyImageUnlock {
    pub key_image: KeyImage,
    pub nonce: u32,
    pub signature: [u8; 64],
}

/// The parts of an unlock transaction the staking rules look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnstakeTx {
    pub inputs: usize,
    pub outputs: usize,
    pub unlock: Option<KeyImageUnlock>,
}

impl UnstakeTx {
    /// An input-less, output-less transaction carrying `unlock`.
    pub fn new(unlock: KeyImageUnlock) -> Self {
        Self {
            inputs: 0,
            outputs: 0,
            unlock: Some(unlock),
        }
    }
}

/// A contribution locked into a service node.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LockedContribution {
    pub key_image: KeyImage,
    /// Ed25519 key the contributor signs unlock requests with.
    pub contributor_key: [u8; 32],
    pub amount: u64,
    /// Height the owning service node registered at.
    pub registration_height: u64,
    /// [`KEY_IMAGE_AWAITING_UNLOCK_HEIGHT`] until an unlock is requested.
    pub unlock_height: u64,
}

impl LockedContribution {
    /// Whether an unlock has already been scheduled.
    pub fn unlock_requested(&self) -> bool {
        self.unlock_height != KEY_IMAGE_AWAITING_UNLOCK_HEIGHT
    }
}

/// Digest a contributor signs to request an unlock.
pub fn generate_request_stake_unlock_hash(nonce: u32) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(UNLOCK_HASH_DOMAIN);
    hasher.update(&nonce.to_le_bytes());
    *hasher.finalize().as_bytes()
}

/// Height at which a contribution unlocks if the request lands at `curr_height`.
///
/// The end of the lock period containing `curr_height`; inside the first
/// period that is `node_register_height + staking_num_lock_blocks(nettype)`.
pub fn get_locked_key_image_unlock_height(
    nettype: NetworkType,
    node_register_height: u64,
    curr_height: u64,
) -> u64 {
    let lock = staking_num_lock_blocks(nettype);
    let periods = curr_height.saturating_sub(node_register_height) / lock + 1;
    node_register_height.saturating_add(lock.saturating_mul(periods))
}

/// Validate an unlock request against the contribution it names.
///
/// Returns the height the contribution unlocks at.
pub fn validate_unstake_tx(
    nettype: NetworkType,
    blockchain_height: u64,
    tx: &UnstakeTx,
    contribution: &LockedContribution,
) -> Result<u64, UnstakeError> {
    if tx.inputs != 0 || tx.outputs != 0 {
        return Err(UnstakeError::HasInputsOrOutputs {
            inputs: tx.inputs,
            outputs: tx.outputs,
        });
    }

    let unlock = tx.unlock.as_ref().ok_or(UnstakeError::MissingUnlockField)?;

    if unlock.key_image != contribution.key_image {
        return Err(UnstakeError::KeyImageMismatch(unlock.key_image.to_hex()));
    }

    if contribution.unlock_requested() {
        return Err(UnstakeError::AlreadyRequested {
            key_image: unlock.key_image.to_hex(),
            unlock_height: contribution.unlock_height,
        });
    }

    if blockchain_height < contribution.registration_height {
        return Err(UnstakeError::BeforeRegistration {
            height: blockchain_height,
            registered: contribution.registration_height,
        });
    }

    let key = VerifyingKey::from_bytes(&contribution.contributor_key)
        .map_err(|_| UnstakeError::InvalidSignature)?;
    let signature = Signature::from_bytes(&unlock.signature);
    let digest = generate_request_stake_unlock_hash(unlock.nonce);
    key.verify_strict(&digest, &signature)
        .map_err(|_| UnstakeError::InvalidSignature)?;

    Ok(get_locked_key_image_unlock_height(
        nettype,
        contribution.registration_height,
        blockchain_height,
    ))
}
