//! Swarm assignment and rebalancing.
//!
//! Active nodes are partitioned into swarms of `min_size..=max_size`
//! members. New and recommissioned nodes wait in the queue until a pass
//! places them. One [`SwarmManager::rebalance`] pass runs per block, in four
//! steps:
//!
//! 1. Swarms below `min_size` steal nodes from large swarms, or dissolve
//!    into small swarms when there is not enough spare.
//! 2. A full enough queue is carved into new swarms; leftovers fill small
//!    swarms.
//! 3. Spare capacity across all swarms is gathered into new swarms.
//! 4. Oversized swarms shed members down to `ideal_size`.
//!
//! Every random choice is drawn from the caller's seeded generator, so all
//! nodes reach the same assignment.

use std::collections::{BTreeMap, BTreeSet};

use rand::RngCore;
use tracing::{debug, info};

use crate::config::SwarmConfig;
use crate::node::NodeKey;
use crate::selector::{sample_without_replacement, uniform_distribution_portable};

/// Swarm identifier.
pub type SwarmId = u64;

/// Pseudo-swarm holding nodes waiting for placement.
pub const QUEUE_SWARM_ID: SwarmId = 0;

/// Swarm id of a node that is in no swarm (decommissioned or removed).
pub const UNASSIGNED_SWARM_ID: SwarmId = u64::MAX;

/// Health of a swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmHealth {
    Healthy,
    /// Below the minimum size; topped up or dissolved on the next pass.
    Unhealthy,
    Queue,
}

/// What a rebalancing pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    pub created: Vec<SwarmId>,
    pub dissolved: Vec<SwarmId>,
    /// Individual node moves, including moves into and out of the queue.
    pub moved: usize,
}

impl RebalanceReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.dissolved.is_empty() && self.moved == 0
    }
}

/// Owns swarm membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmManager {
    config: SwarmConfig,
    swarms: BTreeMap<SwarmId, BTreeSet<NodeKey>>,
    queue: BTreeSet<NodeKey>,
    assignment: BTreeMap<NodeKey, SwarmId>,
}

impl SwarmManager {
    pub fn new(config: SwarmConfig) -> Self {
        Self {
            config,
            swarms: BTreeMap::new(),
            queue: BTreeSet::new(),
            assignment: BTreeMap::new(),
        }
    }

    /// Queue a node for placement. Returns false if it is already tracked.
    pub fn add_node(&mut self, key: NodeKey) -> bool {
        if self.assignment.contains_key(&key) {
            return false;
        }
        self.queue.insert(key);
        self.assignment.insert(key, QUEUE_SWARM_ID);
        true
    }

    /// Take a node out of its swarm. Returns the swarm it left.
    pub fn remove_node(&mut self, key: &NodeKey) -> Option<SwarmId> {
        let id = self.assignment.remove(key)?;
        if id == QUEUE_SWARM_ID {
            self.queue.remove(key);
        } else if let Some(members) = self.swarms.get_mut(&id) {
            members.remove(key);
        }
        Some(id)
    }

    /// Swarm of a node; [`QUEUE_SWARM_ID`] while queued.
    pub fn swarm_of(&self, key: &NodeKey) -> Option<SwarmId> {
        self.assignment.get(key).copied()
    }

    pub fn health(&self, id: SwarmId) -> Option<SwarmHealth> {
        if id == QUEUE_SWARM_ID {
            return Some(SwarmHealth::Queue);
        }
        let size = self.swarms.get(&id)?.len();
        Some(if size < self.config.min_size {
            SwarmHealth::Unhealthy
        } else {
            SwarmHealth::Healthy
        })
    }

    pub fn members(&self, id: SwarmId) -> Option<&BTreeSet<NodeKey>> {
        if id == QUEUE_SWARM_ID {
            Some(&self.queue)
        } else {
            self.swarms.get(&id)
        }
    }

    /// Swarms in id order, queue excluded.
    pub fn swarms(&self) -> impl Iterator<Item = (SwarmId, &BTreeSet<NodeKey>)> {
        self.swarms.iter().map(|(id, members)| (*id, members))
    }

    pub fn queue(&self) -> &BTreeSet<NodeKey> {
        &self.queue
    }

    pub fn swarm_count(&self) -> usize {
        self.swarms.len()
    }

    /// Nodes tracked, queue included.
    pub fn node_count(&self) -> usize {
        self.assignment.len()
    }

    /// Run one rebalancing pass.
    pub fn rebalance<R: RngCore + ?Sized>(&mut self, rng: &mut R) -> RebalanceReport {
        let mut report = RebalanceReport::default();
        self.repair_unhealthy(rng, &mut report);
        self.drain_queue(rng, &mut report);
        self.gather_excess(rng, &mut report);
        self.shed_oversized(rng, &mut report);

        if !report.is_empty() {
            debug!(
                created = report.created.len(),
                dissolved = report.dissolved.len(),
                moved = report.moved,
                swarms = self.swarms.len(),
                queued = self.queue.len(),
                "Swarms rebalanced"
            );
        }
        report
    }

    // Step 1.
    fn repair_unhealthy<R: RngCore + ?Sized>(&mut self, rng: &mut R, report: &mut RebalanceReport) {
        let min = self.config.min_size;
        let unhealthy: Vec<SwarmId> = self
            .swarms
            .iter()
            .filter(|(_, m)| m.len() < min)
            .map(|(id, _)| *id)
            .collect();

        for id in unhealthy {
            let size = match self.swarms.get(&id) {
                Some(members) => members.len(),
                None => continue,
            };
            if size >= min {
                continue;
            }
            let deficit = min - size;
            let spare: usize = self
                .swarms
                .iter()
                .filter(|(other, _)| **other != id)
                .map(|(_, m)| m.len().saturating_sub(min))
                .sum();

            if spare >= deficit {
                for _ in 0..deficit {
                    if self.steal_into(rng, id).is_none() {
                        break;
                    }
                    report.moved += 1;
                }
                continue;
            }

            let Some(members) = self.swarms.remove(&id) else {
                continue;
            };
            info!(swarm = id, members = members.len(), "Dissolving unhealthy swarm");
            report.dissolved.push(id);
            for key in members {
                let targets =
                    self.lower_percentile_targets(self.config.redistribution_lower_percentile, None);
                self.place(rng, key, &targets);
                report.moved += 1;
            }
        }
    }

    // Step 2.
    fn drain_queue<R: RngCore + ?Sized>(&mut self, rng: &mut R, report: &mut RebalanceReport) {
        let threshold = self.config.new_size + self.config.buffer;
        while self.queue.len() >= threshold {
            let pool: Vec<NodeKey> = self.queue.iter().copied().collect();
            let picked = sample_without_replacement(rng, pool, self.config.new_size);
            let id = self.next_swarm_id();
            for key in &picked {
                self.queue.remove(key);
                self.assignment.insert(*key, id);
            }
            info!(swarm = id, members = picked.len(), "Created swarm from queue");
            self.swarms.insert(id, picked.into_iter().collect());
            report.created.push(id);
            report.moved += self.config.new_size;
        }

        let waiting: Vec<NodeKey> = self.queue.iter().copied().collect();
        for key in waiting {
            let targets = self.lower_percentile_targets(self.config.fill_lower_percentile, None);
            if targets.is_empty() {
                break;
            }
            self.queue.remove(&key);
            self.place(rng, key, &targets);
            report.moved += 1;
        }
    }

    // Step 3.
    fn gather_excess<R: RngCore + ?Sized>(&mut self, rng: &mut R, report: &mut RebalanceReport) {
        let threshold = self.config.new_size + self.config.buffer;
        loop {
            let any_unhealthy = self.swarms.values().any(|m| m.len() < self.config.min_size);
            let excess: usize = self
                .swarms
                .values()
                .map(|m| m.len().saturating_sub(self.config.excess_base))
                .sum();
            if any_unhealthy || excess < threshold {
                break;
            }

            let id = self.next_swarm_id();
            self.swarms.insert(id, BTreeSet::new());
            let mut stolen = Vec::with_capacity(self.config.new_size);
            while stolen.len() < self.config.new_size {
                match self.steal_into(rng, id) {
                    Some(moved) => stolen.push(moved),
                    None => break,
                }
            }
            // The largest other swarm stays a donor while excess remains.
            debug_assert_eq!(stolen.len(), self.config.new_size);
            if stolen.len() < self.config.new_size {
                self.return_stolen(id, stolen);
                break;
            }
            info!(swarm = id, members = stolen.len(), "Created swarm from excess");
            report.created.push(id);
            report.moved += stolen.len();
        }
    }

    // Step 4.
    fn shed_oversized<R: RngCore + ?Sized>(&mut self, rng: &mut R, report: &mut RebalanceReport) {
        let oversized: Vec<SwarmId> = self
            .swarms
            .iter()
            .filter(|(_, m)| m.len() > self.config.max_size)
            .map(|(id, _)| *id)
            .collect();

        for id in oversized {
            loop {
                let Some(members) = self.swarms.get_mut(&id) else {
                    break;
                };
                if members.len() <= self.config.ideal_size {
                    break;
                }
                let idx = uniform_distribution_portable(rng, members.len() as u64) as usize;
                let Some(key) = members.iter().nth(idx).copied() else {
                    break;
                };
                members.remove(&key);
                let targets =
                    self.lower_percentile_targets(self.config.fill_lower_percentile, Some(id));
                self.place(rng, key, &targets);
                report.moved += 1;
            }
        }
    }

    /// Move one random node from a large swarm into `target`.
    /// Move one node from an upper percentile swarm into `target`.
    /// Returns the node and the swarm it came from.
    fn steal_into<R: RngCore + ?Sized>(&mut self, rng: &mut R, target: SwarmId) -> Option<(NodeKey, SwarmId)> {
        let sources = self.upper_percentile_sources(target);
        if sources.is_empty() {
            return None;
        }
        let source = sources[uniform_distribution_portable(rng, sources.len() as u64) as usize];
        let members = self.swarms.get_mut(&source)?;
        let idx = uniform_distribution_portable(rng, members.len() as u64) as usize;
        let key = members.iter().nth(idx).copied()?;
        members.remove(&key);
        if let Some(dest) = self.swarms.get_mut(&target) {
            dest.insert(key);
        }
        self.assignment.insert(key, target);
        Some((key, source))
    }

    /// Drop the half-built swarm `id`, sending each stolen node back to its source.
    fn return_stolen(&mut self, id: SwarmId, stolen: Vec<(NodeKey, SwarmId)>) {
        self.swarms.remove(&id);
        for (key, source) in stolen {
            if let Some(members) = self.swarms.get_mut(&source) {
                members.insert(key);
                self.assignment.insert(key, source);
            } else {
                self.queue.insert(key);
                self.assignment.insert(key, QUEUE_SWARM_ID);
            }
        }
    }

    /// Put `key` into a random target swarm, or the queue if there is none.
    fn place<R: RngCore + ?Sized>(&mut self, rng: &mut R, key: NodeKey, targets: &[SwarmId]) {
        if targets.is_empty() {
            self.queue.insert(key);
            self.assignment.insert(key, QUEUE_SWARM_ID);
            return;
        }
        let id = targets[uniform_distribution_portable(rng, targets.len() as u64) as usize];
        if let Some(members) = self.swarms.get_mut(&id) {
            members.insert(key);
        }
        self.assignment.insert(key, id);
    }

    /// Swarms below max whose size is within the lower `percentile`.
    fn lower_percentile_targets(&self, percentile: usize, exclude: Option<SwarmId>) -> Vec<SwarmId> {
        let candidates: Vec<(SwarmId, usize)> = self
            .swarms
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(id, m)| (*id, m.len()))
            .collect();
        let Some(cutoff) = percentile_size(&candidates, percentile) else {
            return Vec::new();
        };
        candidates
            .into_iter()
            .filter(|&(_, size)| size <= cutoff && size < self.config.max_size)
            .map(|(id, _)| id)
            .collect()
    }

    /// Swarms above min whose size is within the upper `percentile`.
    fn upper_percentile_sources(&self, exclude: SwarmId) -> Vec<SwarmId> {
        let candidates: Vec<(SwarmId, usize)> = self
            .swarms
            .iter()
            .filter(|(id, _)| **id != exclude)
            .map(|(id, m)| (*id, m.len()))
            .collect();
        let Some(cutoff) = percentile_size(&candidates, self.config.stealing_upper_percentile) else {
            return Vec::new();
        };
        candidates
            .into_iter()
            .filter(|&(_, size)| size >= cutoff && size > self.config.min_size)
            .map(|(id, _)| id)
            .collect()
    }

    /// Midpoint of the widest gap between existing ids.
    fn next_swarm_id(&self) -> SwarmId {
        let mut best = (QUEUE_SWARM_ID, 0u64);
        let mut prev = QUEUE_SWARM_ID;
        for &id in self.swarms.keys().chain(std::iter::once(&UNASSIGNED_SWARM_ID)) {
            let gap = id - prev;
            if gap > best.1 {
                best = (prev, gap);
            }
            prev = id;
        }
        best.0 + best.1 / 2
    }
}

/// Size at `percentile` of the candidates, nearest rank rounding down.
fn percentile_size(candidates: &[(SwarmId, usize)], percentile: usize) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let mut sizes: Vec<usize> = candidates.iter().map(|&(_, size)| size).collect();
    sizes.sort_unstable();
    let idx = percentile.min(100) * (sizes.len() - 1) / 100;
    Some(sizes[idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{seeded_rng, QuorumSeed};
    use proptest::prelude::*;

    fn key(i: u32) -> NodeKey {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&i.to_be_bytes());
        NodeKey(bytes)
    }

    fn manager_with(nodes: u32) -> SwarmManager {
        let mut m = SwarmManager::new(SwarmConfig::default());
        for i in 0..nodes {
            m.add_node(key(i));
        }
        m
    }

    fn assert_sizes_in_range(m: &SwarmManager) {
        let c = SwarmConfig::default();
        for (id, members) in m.swarms() {
            assert!(
                (c.min_size..=c.max_size).contains(&members.len()),
                "swarm {id} has {} members",
                members.len()
            );
        }
    }

    fn assert_assignment_consistent(m: &SwarmManager) {
        let mut seen = 0;
        for (id, members) in m.swarms() {
            for k in members {
                assert_eq!(m.swarm_of(k), Some(id));
                seen += 1;
            }
        }
        for k in m.queue() {
            assert_eq!(m.swarm_of(k), Some(QUEUE_SWARM_ID));
            seen += 1;
        }
        assert_eq!(seen, m.node_count());
    }

    #[test]
    fn small_queue_waits() {
        let mut m = manager_with(11);
        let report = m.rebalance(&mut seeded_rng(&QuorumSeed([1; 32])));
        assert!(report.is_empty());
        assert_eq!(m.swarm_count(), 0);
        assert_eq!(m.queue().len(), 11);
        assert_eq!(m.health(QUEUE_SWARM_ID), Some(SwarmHealth::Queue));
    }

    #[test]
    fn queue_is_carved_into_swarms() {
        let mut m = manager_with(12);
        let report = m.rebalance(&mut seeded_rng(&QuorumSeed([1; 32])));
        assert_eq!(report.created.len(), 1);
        assert_eq!(m.swarm_count(), 1);
        // Leftovers fill the new swarm up to its maximum; the rest stay queued.
        let (_, members) = m.swarms().next().unwrap();
        assert_eq!(members.len(), 10);
        assert_eq!(m.queue().len(), 2);
        assert_sizes_in_range(&m);
        assert_assignment_consistent(&m);
    }

    #[test]
    fn sixty_nodes_fully_placed() {
        let mut m = manager_with(60);
        m.rebalance(&mut seeded_rng(&QuorumSeed([2; 32])));
        assert!(m.queue().is_empty());
        assert_sizes_in_range(&m);
        assert_assignment_consistent(&m);
    }

    #[test]
    fn first_swarm_id_is_midpoint() {
        let mut m = manager_with(12);
        let report = m.rebalance(&mut seeded_rng(&QuorumSeed([1; 32])));
        assert_eq!(report.created, vec![u64::MAX / 2]);
    }

    #[test]
    fn unhealthy_swarm_is_topped_up() {
        let mut m = manager_with(60);
        let mut rng = seeded_rng(&QuorumSeed([3; 32]));
        m.rebalance(&mut rng);
        let (id, members) = m.swarms().next().unwrap();
        let victims: Vec<NodeKey> = members.iter().copied().take(members.len() - 4).collect();
        for v in &victims {
            m.remove_node(v);
        }
        assert_eq!(m.health(id), Some(SwarmHealth::Unhealthy));

        m.rebalance(&mut rng);
        assert_eq!(m.health(id), Some(SwarmHealth::Healthy));
        assert_sizes_in_range(&m);
        assert_assignment_consistent(&m);
    }

    #[test]
    fn unhealthy_swarm_without_donors_dissolves() {
        let mut m = manager_with(12);
        let mut rng = seeded_rng(&QuorumSeed([4; 32]));
        m.rebalance(&mut rng);
        let (id, members) = m.swarms().next().unwrap();
        let victims: Vec<NodeKey> = members.iter().copied().take(6).collect();
        for v in &victims {
            m.remove_node(v);
        }

        let report = m.rebalance(&mut rng);
        assert_eq!(report.dissolved, vec![id]);
        assert_eq!(m.swarm_count(), 0);
        assert_eq!(m.queue().len(), 6);
        assert_assignment_consistent(&m);
    }

    #[test]
    fn excess_is_gathered_into_new_swarm() {
        let mut m = SwarmManager::new(SwarmConfig::default());
        // Two full swarms built by hand: 2 * (10 - 5) = 10 spare, below 12.
        // A third at 10 makes 15 spare.
        for (s, id) in [(0u32, 100u64), (1, 200), (2, 300)] {
            let members: BTreeSet<NodeKey> = (0..10).map(|i| key(s * 100 + i)).collect();
            for k in &members {
                m.assignment.insert(*k, id);
            }
            m.swarms.insert(id, members);
        }

        let report = m.rebalance(&mut seeded_rng(&QuorumSeed([5; 32])));
        assert_eq!(report.created.len(), 1);
        assert_eq!(m.swarm_count(), 4);
        assert_sizes_in_range(&m);
        assert_assignment_consistent(&m);
    }

    #[test]
    fn oversized_swarm_sheds_to_ideal() {
        let mut m = SwarmManager::new(SwarmConfig::default());
        let big: BTreeSet<NodeKey> = (0..11).map(key).collect();
        let small: BTreeSet<NodeKey> = (100..105).map(key).collect();
        for k in &big {
            m.assignment.insert(*k, 10);
        }
        for k in &small {
            m.assignment.insert(*k, 20);
        }
        m.swarms.insert(10, big);
        m.swarms.insert(20, small);

        m.rebalance(&mut seeded_rng(&QuorumSeed([6; 32])));
        assert_eq!(m.members(10).unwrap().len(), 7);
        assert_eq!(m.members(20).unwrap().len(), 9);
        assert_sizes_in_range(&m);
        assert_assignment_consistent(&m);
    }

    #[test]
    fn abandoned_swarm_returns_nodes_to_donors() {
        let mut m = SwarmManager::new(SwarmConfig::default());
        for (id, range) in [(10, 0..9), (20, 100..109)] {
            let members: BTreeSet<NodeKey> = range.map(key).collect();
            for k in &members {
                m.assignment.insert(*k, id);
            }
            m.swarms.insert(id, members);
        }
        let before = m.clone();

        let mut rng = seeded_rng(&QuorumSeed([8; 32]));
        m.swarms.insert(30, BTreeSet::new());
        let stolen: Vec<_> = (0..3).filter_map(|_| m.steal_into(&mut rng, 30)).collect();
        assert_eq!(stolen.len(), 3);
        assert_eq!(m.members(30).unwrap().len(), 3);
        for (k, source) in &stolen {
            assert_eq!(m.swarm_of(k), Some(30));
            assert!(*source == 10 || *source == 20);
        }

        m.return_stolen(30, stolen);
        assert_eq!(m, before);
        assert!(m.queue().is_empty());
        assert_assignment_consistent(&m);
    }

    #[test]
    fn same_seed_same_assignment() {
        let mut a = manager_with(97);
        let mut b = manager_with(97);
        a.rebalance(&mut seeded_rng(&QuorumSeed([7; 32])));
        b.rebalance(&mut seeded_rng(&QuorumSeed([7; 32])));
        assert_eq!(a, b);
    }

    #[test]
    fn removed_node_is_untracked() {
        let mut m = manager_with(3);
        assert!(!m.add_node(key(1)));
        assert_eq!(m.remove_node(&key(1)), Some(QUEUE_SWARM_ID));
        assert_eq!(m.swarm_of(&key(1)), None);
        assert_eq!(m.remove_node(&key(1)), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn sizes_stay_in_range(
            seed in any::<[u8; 32]>(),
            steps in proptest::collection::vec((0u32..40, 0u32..200), 1..12),
        ) {
            let mut m = SwarmManager::new(SwarmConfig::default());
            let mut rng = seeded_rng(&QuorumSeed(seed));
            let mut next = 0u32;
            for (joins, leave_stride) in steps {
                for _ in 0..joins {
                    m.add_node(key(next));
                    next += 1;
                }
                if leave_stride > 0 {
                    let leaving: Vec<NodeKey> = (0..next)
                        .filter(|i| i % (leave_stride + 2) == 0)
                        .map(key)
                        .collect();
                    for k in &leaving {
                        m.remove_node(k);
                    }
                }
                m.rebalance(&mut rng);

                let c = SwarmConfig::default();
                for (_, members) in m.swarms() {
                    prop_assert!((c.min_size..=c.max_size).contains(&members.len()));
                }
            }
        }
    }
}
