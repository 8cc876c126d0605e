//! The service node list: per-height state and the block transition.
//!
//! Each block produces a new immutable [`ListSnapshot`]. Readers hold
//! `Arc`s to snapshots and never observe a transition in progress. The list
//! keeps snapshots and built quorums for `quorum_lifetime` blocks so votes
//! and state changes for recent heights can be checked against them.

use std::collections::BTreeMap;
use std::sync::Arc;

use snode_staking::{validate_unstake_tx, KeyImage, NetworkType, UnstakeTx};
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::RulesConfig;
use crate::credit::CreditLedger;
use crate::error::{
    Error, QuorumError, RegistrationError, Result, StateChangeError, UnlockError, VoteError,
};
use crate::node::{BlockHash, NodeKey, NodeState, Registration, ServiceNode};
use crate::pool::{StateChangeEvent, ThresholdEvent, VoteOutcome, VotePool};
use crate::quorum::{self, Quorum, QuorumCandidate, QuorumType};
use crate::selector::{seeded_rng, QuorumSeed, SeedDomain};
use crate::store::{MemoryStateSink, NodeRecord, StateSink};
use crate::swarm::{RebalanceReport, SwarmManager, UNASSIGNED_SWARM_ID};
use crate::threshold::is_checkpoint_height;
use crate::vote::{NewState, Vote};

/// A state change carried by a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChangeTx {
    /// Height of the quorum that voted.
    pub quorum_height: u64,
    pub worker_index: u16,
    pub node: NodeKey,
    pub state: NewState,
}

impl From<&StateChangeEvent> for StateChangeTx {
    fn from(event: &StateChangeEvent) -> Self {
        Self {
            quorum_height: event.height,
            worker_index: event.worker_index,
            node: event.worker,
            state: event.state,
        }
    }
}

/// The parts of a block the rule engine consumes.
#[derive(Debug, Clone, Default)]
pub struct NewBlock {
    pub height: u64,
    pub hash: BlockHash,
    pub registrations: Vec<Registration>,
    pub unlocks: Vec<UnstakeTx>,
    pub state_changes: Vec<StateChangeTx>,
}

impl NewBlock {
    /// A block with no service node transactions.
    pub fn empty(height: u64, hash: BlockHash) -> Self {
        Self {
            height,
            hash,
            ..Self::default()
        }
    }
}

/// What applying a block did.
#[derive(Debug, Default)]
pub struct BlockSummary {
    pub height: u64,
    pub registered: Vec<NodeKey>,
    pub rejected_registrations: Vec<(NodeKey, RegistrationError)>,
    /// Node and the height its contribution unlocks at.
    pub unlocks: Vec<(NodeKey, u64)>,
    pub rejected_unlocks: Vec<UnlockError>,
    pub state_changes: Vec<(NodeKey, NewState)>,
    pub rejected_state_changes: Vec<(NodeKey, StateChangeError)>,
    /// Nodes that left after their stake unlocked.
    pub expired: Vec<NodeKey>,
    pub swarms: RebalanceReport,
    pub quorums_built: Vec<QuorumType>,
    pub quorum_errors: Vec<QuorumError>,
    pub deregistration_candidates: Vec<NodeKey>,
    pub storage_errors: Vec<String>,
}

/// Node list state at one height.
#[derive(Debug, Clone)]
pub struct ListSnapshot {
    pub height: u64,
    pub hash: BlockHash,
    nodes: BTreeMap<NodeKey, ServiceNode>,
    swarms: SwarmManager,
    credit: CreditLedger,
}

impl ListSnapshot {
    fn genesis(config: &RulesConfig) -> Self {
        Self {
            height: 0,
            hash: BlockHash::default(),
            nodes: BTreeMap::new(),
            swarms: SwarmManager::new(config.swarm.clone()),
            credit: CreditLedger::new(config),
        }
    }

    pub fn node(&self, key: &NodeKey) -> Option<&ServiceNode> {
        self.nodes.get(key)
    }

    /// Nodes in key order.
    pub fn nodes(&self) -> impl Iterator<Item = &ServiceNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_active()).count()
    }

    pub fn swarms(&self) -> &SwarmManager {
        &self.swarms
    }

    pub fn credit(&self) -> &CreditLedger {
        &self.credit
    }

    pub fn candidates(&self) -> Vec<QuorumCandidate> {
        self.nodes
            .values()
            .map(|n| QuorumCandidate {
                key: n.key,
                state: n.state,
                registration_height: n.registration_height,
            })
            .collect()
    }

    /// Node that locked `key_image`.
    pub fn key_image_owner(&self, key_image: &KeyImage) -> Option<NodeKey> {
        self.nodes
            .values()
            .find(|n| n.key_images().any(|k| k == key_image))
            .map(|n| n.key)
    }

    fn register(
        &mut self,
        nettype: NetworkType,
        registration: Registration,
    ) -> std::result::Result<NodeKey, RegistrationError> {
        let key = registration.key;
        if self.nodes.contains_key(&key) {
            return Err(RegistrationError::AlreadyRegistered(key));
        }
        for c in &registration.contributions {
            if self.key_image_owner(&c.key_image).is_some() {
                return Err(RegistrationError::DuplicateKeyImage(c.key_image.to_hex()));
            }
        }
        registration.validate(nettype, self.height)?;

        let node = registration.into_node(self.height);
        self.nodes.insert(key, node);
        self.credit.register(key);
        self.swarms.add_node(key);
        Ok(key)
    }

    fn request_unlock(
        &mut self,
        nettype: NetworkType,
        tx: &UnstakeTx,
    ) -> std::result::Result<(NodeKey, u64), UnlockError> {
        let key_image = tx
            .unlock
            .as_ref()
            .map(|u| u.key_image)
            .ok_or(UnlockError::MissingKeyImage)?;
        let owner = self
            .key_image_owner(&key_image)
            .ok_or_else(|| UnlockError::UnknownKeyImage(key_image.to_hex()))?;
        let height = self.height;
        let node = self
            .nodes
            .get_mut(&owner)
            .ok_or_else(|| UnlockError::UnknownKeyImage(key_image.to_hex()))?;
        let contribution = node
            .contribution_mut(&key_image)
            .ok_or_else(|| UnlockError::UnknownKeyImage(key_image.to_hex()))?;

        let unlock_height = validate_unstake_tx(nettype, height, tx, contribution)?;
        contribution.unlock_height = unlock_height;
        node.unlock_height = Some(node.unlock_height.map_or(unlock_height, |h| h.min(unlock_height)));
        Ok((owner, unlock_height))
    }

    fn apply_state_change(
        &mut self,
        config: &RulesConfig,
        tx: &StateChangeTx,
        quorum: Option<&Quorum>,
    ) -> std::result::Result<(), StateChangeError> {
        let block_height = self.height;
        let too_old = block_height.saturating_sub(tx.quorum_height) > config.state_change_tx_lifetime();
        if tx.quorum_height > block_height || too_old {
            return Err(StateChangeError::Expired {
                height: tx.quorum_height,
                block_height,
            });
        }
        let quorum = quorum.ok_or(StateChangeError::NoQuorum(tx.quorum_height))?;
        if quorum.worker(tx.worker_index) != Some(&tx.node) {
            return Err(StateChangeError::WorkerMismatch {
                node: tx.node,
                height: tx.quorum_height,
                worker_index: tx.worker_index,
            });
        }
        let from = self
            .nodes
            .get(&tx.node)
            .map(|n| n.state)
            .ok_or(StateChangeError::UnknownNode(tx.node))?;

        let invalid = |to| StateChangeError::InvalidTransition {
            node: tx.node,
            from,
            to,
        };
        match (tx.state, from) {
            (NewState::Deregister, NodeState::Active | NodeState::Decommissioned) => {
                self.remove_node(&tx.node);
            }
            (NewState::Decommission, NodeState::Active) => {
                self.credit.decommission(&tx.node)?;
                self.swarms.remove_node(&tx.node);
                if let Some(node) = self.nodes.get_mut(&tx.node) {
                    node.state = NodeState::Decommissioned;
                    node.swarm_id = UNASSIGNED_SWARM_ID;
                }
            }
            (NewState::Recommission, NodeState::Decommissioned) => {
                self.credit.recommission(&tx.node)?;
                self.swarms.add_node(tx.node);
                if let Some(node) = self.nodes.get_mut(&tx.node) {
                    node.state = NodeState::Active;
                }
            }
            (NewState::Deregister, _) => return Err(invalid(NodeState::Deregistered)),
            (NewState::Decommission, _) => return Err(invalid(NodeState::Decommissioned)),
            (NewState::Recommission, _) => return Err(invalid(NodeState::Active)),
        }
        Ok(())
    }

    fn remove_node(&mut self, key: &NodeKey) -> Option<ServiceNode> {
        self.swarms.remove_node(key);
        self.credit.remove(key);
        self.nodes.remove(key)
    }

    fn expire_unlocked(&mut self) -> Vec<NodeKey> {
        let height = self.height;
        let expired: Vec<NodeKey> = self
            .nodes
            .values()
            .filter(|n| n.unlock_height.is_some_and(|h| h <= height))
            .map(|n| n.key)
            .collect();
        for key in &expired {
            self.remove_node(key);
        }
        expired
    }

    fn sync_swarm_ids(&mut self) {
        for node in self.nodes.values_mut() {
            node.swarm_id = self.swarms.swarm_of(&node.key).unwrap_or(UNASSIGNED_SWARM_ID);
        }
    }
}

fn node_record(snapshot: &ListSnapshot, node: &ServiceNode) -> NodeRecord {
    NodeRecord {
        key: node.key,
        state: node.state,
        swarm_id: node.swarm_id,
        credit: snapshot.credit.credit(&node.key).unwrap_or(0),
        height: snapshot.height,
    }
}

/// The rule engine's view of the service node set.
pub struct ServiceNodeList<S: StateSink = MemoryStateSink> {
    config: RulesConfig,
    history: BTreeMap<u64, Arc<ListSnapshot>>,
    quorums: BTreeMap<(u64, QuorumType), Arc<Quorum>>,
    pool: VotePool,
    checkpoints: CheckpointStore,
    sink: S,
}

impl ServiceNodeList<MemoryStateSink> {
    /// A list persisting into memory.
    pub fn in_memory(config: RulesConfig) -> Result<Self> {
        Self::new(config, MemoryStateSink::new())
    }
}

impl<S: StateSink> ServiceNodeList<S> {
    /// Create an empty list. Fails if the configuration is invalid.
    pub fn new(config: RulesConfig, sink: S) -> Result<Self> {
        config.validate()?;
        info!(nettype = %config.nettype, "Service node list starting");
        Ok(Self {
            pool: VotePool::new(&config),
            checkpoints: CheckpointStore::new(config.checkpoint_store_persistently_interval, config.max_reorg_blocks),
            config,
            history: BTreeMap::new(),
            quorums: BTreeMap::new(),
            sink,
        })
    }

    pub fn config(&self) -> &RulesConfig {
        &self.config
    }

    /// Height of the last applied block.
    pub fn tip(&self) -> Option<u64> {
        self.history.keys().next_back().copied()
    }

    /// Snapshot at the tip.
    pub fn snapshot(&self) -> Option<Arc<ListSnapshot>> {
        self.history.values().next_back().cloned()
    }

    /// Retained snapshot at `height`.
    pub fn snapshot_at(&self, height: u64) -> Option<Arc<ListSnapshot>> {
        self.history.get(&height).cloned()
    }

    /// Quorum built for `height`, if any.
    pub fn quorum(&self, height: u64, quorum_type: QuorumType) -> Option<Arc<Quorum>> {
        self.quorums.get(&(height, quorum_type)).cloned()
    }

    pub fn pool(&self) -> &VotePool {
        &self.pool
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Newest height local validators should test.
    pub fn latest_safe_height(&self) -> Option<u64> {
        self.tip().and_then(|tip| quorum::latest_safe_height(&self.config, tip))
    }

    /// Whether the chain may be reorganised from `fork_height` up.
    pub fn reorg_allowed(&self, fork_height: u64) -> bool {
        match self.tip() {
            Some(tip) => self.checkpoints.reorg_allowed(tip, fork_height),
            None => true,
        }
    }

    /// State a failing node should be voted into: a decommission while it
    /// has the credit for one, deregistration otherwise.
    pub fn penalty_for(&self, key: &NodeKey) -> Option<NewState> {
        let snapshot = self.snapshot()?;
        let node = snapshot.node(key)?;
        if node.is_active() && snapshot.credit.can_decommission(key) {
            Some(NewState::Decommission)
        } else {
            Some(NewState::Deregister)
        }
    }

    /// The quorum of `quorum_type` for `height`.
    ///
    /// Returns the quorum built when the block was applied, or rebuilds it
    /// from the retained snapshot. Both give the same result.
    pub fn build_quorum(
        &self,
        height: u64,
        quorum_type: QuorumType,
    ) -> std::result::Result<Arc<Quorum>, QuorumError> {
        if let Some(q) = self.quorums.get(&(height, quorum_type)) {
            return Ok(Arc::clone(q));
        }
        let snapshot = self.history.get(&height).ok_or(QuorumError::UnknownHeight(height))?;
        quorum::build_quorum(&self.config, &snapshot.candidates(), height, quorum_type, &snapshot.hash)
            .map(Arc::new)
    }

    /// Advance by a block without service node transactions.
    pub fn on_new_block(&mut self, height: u64, hash: BlockHash) -> Result<BlockSummary> {
        self.apply_block(NewBlock::empty(height, hash))
    }

    /// Apply the next block. Heights must be consecutive.
    pub fn apply_block(&mut self, block: NewBlock) -> Result<BlockSummary> {
        if let Some(tip) = self.tip() {
            let expected = tip + 1;
            if block.height != expected {
                return Err(Error::OutOfOrderBlock {
                    expected,
                    got: block.height,
                });
            }
        }

        let height = block.height;
        let mut next = match self.snapshot() {
            Some(prev) => (*prev).clone(),
            None => ListSnapshot::genesis(&self.config),
        };
        next.height = height;
        next.hash = block.hash;
        let mut summary = BlockSummary {
            height,
            ..BlockSummary::default()
        };

        for registration in block.registrations {
            let key = registration.key;
            match next.register(self.config.nettype, registration) {
                Ok(key) => {
                    info!(height, node = %key, "Service node registered");
                    summary.registered.push(key);
                }
                Err(e) => {
                    debug!(height, node = %key, error = %e, "Registration rejected");
                    summary.rejected_registrations.push((key, e));
                }
            }
        }

        for tx in &block.unlocks {
            match next.request_unlock(self.config.nettype, tx) {
                Ok((key, unlock_height)) => {
                    info!(height, node = %key, unlock_height, "Stake unlock scheduled");
                    summary.unlocks.push((key, unlock_height));
                }
                Err(e) => {
                    debug!(height, error = %e, "Unlock rejected");
                    summary.rejected_unlocks.push(e);
                }
            }
        }

        for tx in &block.state_changes {
            let quorum = self.quorums.get(&(tx.quorum_height, QuorumType::StateChange));
            match next.apply_state_change(&self.config, tx, quorum.map(Arc::as_ref)) {
                Ok(()) => {
                    info!(height, node = %tx.node, state = ?tx.state, "State change applied");
                    summary.state_changes.push((tx.node, tx.state));
                }
                Err(e) => {
                    warn!(height, node = %tx.node, error = %e, "State change rejected");
                    summary.rejected_state_changes.push((tx.node, e));
                }
            }
        }

        summary.expired = next.expire_unlocked();
        for key in &summary.expired {
            info!(height, node = %key, "Service node stake unlocked");
        }

        next.credit.accrue_block();
        self.record_checkpoint_participation(&mut next);
        summary.deregistration_candidates = next
            .credit
            .deregistration_candidates()
            .into_iter()
            .filter(|k| next.nodes.contains_key(k))
            .collect();

        let seed = QuorumSeed::derive(&block.hash, SeedDomain::Swarm, height);
        summary.swarms = next.swarms.rebalance(&mut seeded_rng(&seed));
        next.sync_swarm_ids();

        let snapshot = Arc::new(next);
        self.history.insert(height, Arc::clone(&snapshot));

        for quorum_type in QuorumType::ALL {
            if quorum_type == QuorumType::Checkpoint
                && !is_checkpoint_height(height, self.config.checkpoint_interval)
            {
                continue;
            }
            match quorum::build_quorum(&self.config, &snapshot.candidates(), height, quorum_type, &snapshot.hash) {
                Ok(q) => {
                    if let Err(e) = self.sink.store_quorum(&q) {
                        summary.storage_errors.push(e.to_string());
                    }
                    self.quorums.insert((height, quorum_type), Arc::new(q));
                    summary.quorums_built.push(quorum_type);
                }
                Err(e) => {
                    debug!(height, error = %e, "No quorum built");
                    summary.quorum_errors.push(e);
                }
            }
        }

        self.pool.purge(height);
        self.prune(height, &mut summary);
        self.persist_nodes(&snapshot, &summary, &block.state_changes);

        debug!(
            height,
            nodes = snapshot.len(),
            active = snapshot.active_count(),
            swarms = snapshot.swarms.swarm_count(),
            "Block applied"
        );
        Ok(summary)
    }

    /// Credit each checkpoint validator whose voting window just closed.
    fn record_checkpoint_participation(&self, next: &mut ListSnapshot) {
        let lifetime = self.config.checkpoint_vote_lifetime;
        let Some(closed) = next.height.checked_sub(lifetime + 1) else {
            return;
        };
        if !is_checkpoint_height(closed, self.config.checkpoint_interval) {
            return;
        }
        let Some(quorum) = self.quorums.get(&(closed, QuorumType::Checkpoint)) else {
            return;
        };
        let voters = self.pool.checkpoint_voters(closed);
        for (index, key) in quorum.validators.iter().enumerate() {
            let voted = u16::try_from(index).is_ok_and(|i| voters.contains(&i));
            next.credit.record_checkpoint(key, voted);
        }
    }

    fn prune(&mut self, height: u64, summary: &mut BlockSummary) {
        let horizon = height.saturating_sub(self.config.quorum_lifetime);
        self.history.retain(|h, _| *h >= horizon);
        self.quorums.retain(|(h, _), _| *h >= horizon);
        if let Err(e) = self.sink.prune_quorums(horizon) {
            summary.storage_errors.push(e.to_string());
        }
    }

    fn persist_nodes(&mut self, snapshot: &ListSnapshot, summary: &BlockSummary, state_changes: &[StateChangeTx]) {
        let mut errors = Vec::new();
        let removed = summary
            .expired
            .iter()
            .chain(state_changes.iter().map(|tx| &tx.node))
            .filter(|k| snapshot.node(k).is_none());
        for key in removed {
            if let Err(e) = self.sink.remove_node(key) {
                errors.push(e.to_string());
            }
        }
        let previous = snapshot.height.checked_sub(1).and_then(|h| self.history.get(&h)).cloned();
        for node in snapshot.nodes() {
            let record = node_record(snapshot, node);
            let unchanged = previous
                .as_ref()
                .and_then(|prev| prev.node(&node.key).map(|old| node_record(prev, old)))
                .is_some_and(|old| old.same_state(&record));
            if unchanged {
                continue;
            }
            if let Err(e) = self.sink.store_node(&record) {
                errors.push(e.to_string());
            }
        }
        for e in errors {
            warn!(height = snapshot.height, error = %e, "Failed to persist node record");
        }
    }

    /// Validate and record a vote.
    pub fn add_vote(&mut self, vote: &Vote) -> std::result::Result<VoteOutcome, VoteError> {
        self.add_vote_inner(vote, None)
    }

    /// Add a batch of votes.
    ///
    /// Signatures are checked independently, then the votes are applied in
    /// canonical (height, type, voter, worker) order so the outcome does not
    /// depend on arrival order. Results are returned in input order.
    pub fn add_votes(&mut self, votes: &[Vote]) -> Vec<std::result::Result<VoteOutcome, VoteError>> {
        let checked: Vec<Option<bool>> = votes
            .iter()
            .map(|v| {
                let quorum = self.quorums.get(&(v.height, v.quorum_type()))?;
                let voter = quorum.validator(v.voter_index)?;
                Some(v.verify(voter))
            })
            .collect();

        let mut order: Vec<usize> = (0..votes.len()).collect();
        order.sort_by_key(|&i| {
            let v = &votes[i];
            (v.height, v.quorum_type(), v.voter_index, v.worker_index())
        });

        let mut results: Vec<Option<std::result::Result<VoteOutcome, VoteError>>> = vec![None; votes.len()];
        for i in order {
            results[i] = Some(self.add_vote_inner(&votes[i], checked[i]));
        }
        results.into_iter().flatten().collect()
    }

    fn add_vote_inner(
        &mut self,
        vote: &Vote,
        signature_ok: Option<bool>,
    ) -> std::result::Result<VoteOutcome, VoteError> {
        let quorum_type = vote.quorum_type();
        let Some(tip) = self.tip() else {
            return Err(VoteError::NoQuorum {
                height: vote.height,
                quorum_type,
            });
        };
        let quorum = self.quorums.get(&(vote.height, quorum_type)).cloned();
        let hash = self.history.get(&vote.height).map(|s| s.hash);

        let result = self
            .pool
            .add_vote_checked(vote, quorum.as_deref(), hash.as_ref(), tip, signature_ok);

        match &result {
            Err(e) if e.is_rule_violation() => {
                warn!(height = vote.height, voter = vote.voter_index, error = %e, "Vote violates consensus rules");
            }
            Err(e) => {
                debug!(height = vote.height, voter = vote.voter_index, error = %e, "Vote rejected");
            }
            Ok(VoteOutcome::ThresholdReached(ThresholdEvent::Checkpoint(event))) => {
                let checkpoint = Checkpoint::from(event.clone());
                let persistent = self.checkpoints.insert(checkpoint.clone());
                if persistent {
                    if let Err(e) = self.sink.store_checkpoint(&checkpoint) {
                        warn!(height = checkpoint.height, error = %e, "Failed to persist checkpoint");
                    }
                }
            }
            Ok(_) => {}
        }
        result
    }
}
