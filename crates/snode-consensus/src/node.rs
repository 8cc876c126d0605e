//! Service node identities, records and registrations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snode_staking::{
    check_service_node_portions, get_min_node_contribution, get_portions_to_make_amount,
    get_staking_requirement, KeyImage, LockedContribution, NetworkType,
    KEY_IMAGE_AWAITING_UNLOCK_HEIGHT, MAX_KEY_IMAGES_PER_CONTRIBUTOR, MAX_NUMBER_OF_CONTRIBUTORS,
    STAKING_PORTIONS_TOTAL,
};

use crate::error::RegistrationError;
use crate::swarm::{SwarmId, UNASSIGNED_SWARM_ID};

/// A service node identity: its Ed25519 public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey(pub [u8; 32]);

impl NodeKey {
    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl From<&ed25519_dalek::VerifyingKey> for NodeKey {
    fn from(key: &ed25519_dalek::VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

/// Hash of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

/// Operational state of a service node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Eligible for quorums and swarms.
    Active,
    /// Temporarily suspended; reversible.
    Decommissioned,
    /// Permanently removed.
    Deregistered,
}

/// One contributor's locked stake in a service node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    /// Key the contributor signs unlock requests with.
    pub address: [u8; 32],
    /// At most `MAX_KEY_IMAGES_PER_CONTRIBUTOR` entries.
    pub locked: Vec<LockedContribution>,
}

impl Contributor {
    /// Total amount this contributor has locked.
    pub fn amount(&self) -> u64 {
        self.locked.iter().map(|c| c.amount).sum()
    }
}

/// A registered service node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub key: NodeKey,
    pub registration_height: u64,
    pub state: NodeState,
    pub swarm_id: SwarmId,
    /// Operator fee in portions.
    pub operator_fee: u64,
    /// Operator first, then the other contributors in registration order.
    pub contributors: Vec<Contributor>,
    /// Height the node leaves the list after a contributor requested an unlock.
    pub unlock_height: Option<u64>,
}

impl ServiceNode {
    /// Total locked stake.
    pub fn total_contributed(&self) -> u64 {
        self.contributors.iter().map(Contributor::amount).sum()
    }

    /// Whether the node is active.
    pub fn is_active(&self) -> bool {
        self.state == NodeState::Active
    }

    /// Find a locked contribution by key image.
    pub fn contribution(&self, key_image: &KeyImage) -> Option<&LockedContribution> {
        self.contributors
            .iter()
            .flat_map(|c| c.locked.iter())
            .find(|c| c.key_image == *key_image)
    }

    pub(crate) fn contribution_mut(&mut self, key_image: &KeyImage) -> Option<&mut LockedContribution> {
        self.contributors
            .iter_mut()
            .flat_map(|c| c.locked.iter_mut())
            .find(|c| c.key_image == *key_image)
    }

    /// Every key image locked by this node.
    pub fn key_images(&self) -> impl Iterator<Item = &KeyImage> {
        self.contributors
            .iter()
            .flat_map(|c| c.locked.iter())
            .map(|c| &c.key_image)
    }
}

/// A single locked output offered in a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationContribution {
    pub contributor: [u8; 32],
    pub key_image: KeyImage,
    pub amount: u64,
}

/// A registration transaction, as accepted by the transaction validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub key: NodeKey,
    /// Operator fee in portions.
    pub operator_fee: u64,
    /// Operator contribution first.
    pub contributions: Vec<RegistrationContribution>,
}

impl Registration {
    /// A registration fully funded by the operator alone.
    pub fn solo(key: NodeKey, contributor: [u8; 32], key_image: KeyImage, amount: u64) -> Self {
        Self {
            key,
            operator_fee: STAKING_PORTIONS_TOTAL,
            contributions: vec![RegistrationContribution {
                contributor,
                key_image,
                amount,
            }],
        }
    }

    /// Check the staking rules for a registration landing at `height`.
    ///
    /// Every contribution must meet the minimum for its slot, the shares
    /// must form a valid portion list and the stake must be exactly the
    /// requirement.
    pub fn validate(&self, nettype: NetworkType, height: u64) -> Result<(), RegistrationError> {
        if self.contributions.is_empty() {
            return Err(RegistrationError::NoContributions);
        }
        if self.operator_fee > STAKING_PORTIONS_TOTAL {
            return Err(RegistrationError::InvalidOperatorFee(self.operator_fee));
        }

        let mut per_contributor: BTreeMap<[u8; 32], usize> = BTreeMap::new();
        let mut seen_images = Vec::with_capacity(self.contributions.len());
        for c in &self.contributions {
            if seen_images.contains(&c.key_image) {
                return Err(RegistrationError::DuplicateKeyImage(c.key_image.to_hex()));
            }
            seen_images.push(c.key_image);
            *per_contributor.entry(c.contributor).or_default() += 1;
        }
        if per_contributor.len() > MAX_NUMBER_OF_CONTRIBUTORS {
            return Err(RegistrationError::TooManyContributors(per_contributor.len()));
        }
        if let Some((contributor, &count)) = per_contributor
            .iter()
            .find(|(_, &count)| count > MAX_KEY_IMAGES_PER_CONTRIBUTOR)
        {
            return Err(RegistrationError::TooManyKeyImages {
                contributor: hex::encode(contributor),
                count,
            });
        }

        let requirement = get_staking_requirement(nettype, height);
        let mut reserved: u64 = 0;
        let mut portions = Vec::with_capacity(self.contributions.len());
        for (index, c) in self.contributions.iter().enumerate() {
            let minimum = get_min_node_contribution(requirement, reserved, index)?;
            if c.amount < minimum {
                return Err(RegistrationError::BelowMinimum {
                    index,
                    amount: c.amount,
                    minimum,
                });
            }
            portions.push(get_portions_to_make_amount(requirement, c.amount)?);
            reserved = reserved.saturating_add(c.amount);
        }

        if !check_service_node_portions(&portions) {
            return Err(RegistrationError::InvalidPortions);
        }
        if reserved != requirement {
            return Err(RegistrationError::Underfunded {
                total: reserved,
                requirement,
            });
        }
        Ok(())
    }

    /// Build the node record for a registration accepted at `height`.
    pub(crate) fn into_node(self, height: u64) -> ServiceNode {
        let mut contributors: Vec<Contributor> = Vec::new();
        for c in self.contributions {
            let locked = LockedContribution {
                key_image: c.key_image,
                contributor_key: c.contributor,
                amount: c.amount,
                registration_height: height,
                unlock_height: KEY_IMAGE_AWAITING_UNLOCK_HEIGHT,
            };
            match contributors.iter_mut().find(|x| x.address == c.contributor) {
                Some(existing) => existing.locked.push(locked),
                None => contributors.push(Contributor {
                    address: c.contributor,
                    locked: vec![locked],
                }),
            }
        }

        ServiceNode {
            key: self.key,
            registration_height: height,
            state: NodeState::Active,
            swarm_id: UNASSIGNED_SWARM_ID,
            operator_fee: self.operator_fee,
            contributors,
            unlock_height: None,
        }
    }
}
