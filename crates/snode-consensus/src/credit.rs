//! Decommission credit and checkpoint participation.
//!
//! Credit is measured in blocks of allowed downtime and accrues while a
//! node is active, up to a cap. It is held in scaled units (credit times
//! blocks per day) so the per-block accrual of `credit_per_day /
//! blocks_per_day` is exact in integers.
//!
//! Decommissioning spends the whole balance: it becomes the number of blocks
//! the node may stay decommissioned. A node whose budget runs out, or that
//! missed too many recent checkpoint votes, is a deregistration candidate.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RulesConfig;
use crate::error::CreditError;
use crate::node::NodeKey;

/// Credit state of one node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreditAccount {
    scaled_credit: u64,
    /// Blocks left while decommissioned.
    decommission_budget: Option<u64>,
    /// Recent checkpoint quorums; `true` when the node voted.
    participation: VecDeque<bool>,
}

impl CreditAccount {
    pub fn is_decommissioned(&self) -> bool {
        self.decommission_budget.is_some()
    }

    pub fn decommission_budget(&self) -> Option<u64> {
        self.decommission_budget
    }

    /// Checkpoint votes missed in the participation window.
    pub fn missed_checkpoints(&self) -> usize {
        self.participation.iter().filter(|voted| !**voted).count()
    }

    pub fn checkpoints_tracked(&self) -> usize {
        self.participation.len()
    }
}

/// Per-node credit ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditLedger {
    blocks_per_day: u64,
    credit_per_day: u64,
    initial_credit: u64,
    max_credit: u64,
    minimum: u64,
    participation_window: usize,
    max_missable: usize,
    accounts: BTreeMap<NodeKey, CreditAccount>,
}

impl CreditLedger {
    pub fn new(config: &RulesConfig) -> Self {
        Self {
            blocks_per_day: config.blocks_per_day(),
            credit_per_day: config.decommission_credit_per_day,
            initial_credit: config.decommission_initial_credit,
            max_credit: config.decommission_max_credit,
            minimum: config.decommission_minimum,
            participation_window: config.checkpoint_min_quorums_before_deregister_check,
            max_missable: config.checkpoint_max_missable_votes,
            accounts: BTreeMap::new(),
        }
    }

    fn max_scaled(&self) -> u64 {
        self.max_credit.saturating_mul(self.blocks_per_day)
    }

    /// Open an account at the initial credit. Existing accounts are kept.
    pub fn register(&mut self, key: NodeKey) {
        let scaled_credit = self.initial_credit.saturating_mul(self.blocks_per_day);
        self.accounts.entry(key).or_insert_with(|| CreditAccount {
            scaled_credit,
            ..CreditAccount::default()
        });
    }

    pub fn remove(&mut self, key: &NodeKey) -> Option<CreditAccount> {
        self.accounts.remove(key)
    }

    pub fn account(&self, key: &NodeKey) -> Option<&CreditAccount> {
        self.accounts.get(key)
    }

    /// Credit in whole blocks.
    pub fn credit(&self, key: &NodeKey) -> Option<u64> {
        self.accounts.get(key).map(|a| a.scaled_credit / self.blocks_per_day)
    }

    /// Whether the node holds enough credit to be decommissioned.
    pub fn can_decommission(&self, key: &NodeKey) -> bool {
        self.accounts
            .get(key)
            .is_some_and(|a| !a.is_decommissioned() && a.scaled_credit / self.blocks_per_day >= self.minimum)
    }

    /// Spend the balance on a decommission. Returns the downtime budget.
    pub fn decommission(&mut self, key: &NodeKey) -> Result<u64, CreditError> {
        let (blocks_per_day, minimum) = (self.blocks_per_day, self.minimum);
        let account = self
            .accounts
            .get_mut(key)
            .ok_or(CreditError::UnknownNode(*key))?;
        if account.is_decommissioned() {
            return Err(CreditError::AlreadyDecommissioned(*key));
        }
        let credit = account.scaled_credit / blocks_per_day;
        if credit < minimum {
            return Err(CreditError::InsufficientCredit {
                node: *key,
                credit,
                minimum,
            });
        }
        account.scaled_credit = 0;
        account.decommission_budget = Some(credit);
        debug!(node = %key, budget = credit, "Decommission credit spent");
        Ok(credit)
    }

    /// End a decommission. Accrual restarts from zero.
    pub fn recommission(&mut self, key: &NodeKey) -> Result<(), CreditError> {
        let account = self
            .accounts
            .get_mut(key)
            .ok_or(CreditError::UnknownNode(*key))?;
        if account.decommission_budget.take().is_none() {
            return Err(CreditError::NotDecommissioned(*key));
        }
        account.scaled_credit = 0;
        account.participation.clear();
        Ok(())
    }

    /// Advance every account by one block.
    pub fn accrue_block(&mut self) {
        let max = self.max_scaled();
        let per_block = self.credit_per_day;
        for account in self.accounts.values_mut() {
            match account.decommission_budget.as_mut() {
                Some(budget) => *budget = budget.saturating_sub(1),
                None => account.scaled_credit = account.scaled_credit.saturating_add(per_block).min(max),
            }
        }
    }

    /// Record whether a checkpoint validator voted.
    pub fn record_checkpoint(&mut self, key: &NodeKey, voted: bool) {
        let window = self.participation_window;
        if let Some(account) = self.accounts.get_mut(key) {
            account.participation.push_back(voted);
            while account.participation.len() > window {
                account.participation.pop_front();
            }
        }
    }

    /// Nodes that should be voted off: decommission budget exhausted, or too
    /// many missed checkpoints over a full window.
    pub fn deregistration_candidates(&self) -> Vec<NodeKey> {
        self.accounts
            .iter()
            .filter(|(_, a)| {
                let exhausted = a.decommission_budget == Some(0);
                let unreliable = a.participation.len() >= self.participation_window
                    && a.missed_checkpoints() > self.max_missable;
                exhausted || unreliable
            })
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(i: u8) -> NodeKey {
        NodeKey([i; 32])
    }

    fn ledger() -> CreditLedger {
        CreditLedger::new(&RulesConfig::default())
    }

    #[test]
    fn accrues_a_day_per_day() {
        let mut l = ledger();
        l.register(key(1));
        assert_eq!(l.credit(&key(1)), Some(0));
        for _ in 0..720 {
            l.accrue_block();
        }
        assert_eq!(l.credit(&key(1)), Some(24));
        // 30 blocks is one block's worth of credit.
        for _ in 0..30 {
            l.accrue_block();
        }
        assert_eq!(l.credit(&key(1)), Some(25));
    }

    #[test]
    fn credit_is_capped() {
        let mut l = ledger();
        l.register(key(1));
        for _ in 0..(720 * 31) {
            l.accrue_block();
        }
        assert_eq!(l.credit(&key(1)), Some(720));
    }

    #[test]
    fn decommission_needs_minimum() {
        let mut l = ledger();
        l.register(key(1));
        // 239 credit after 239 * 30 blocks.
        for _ in 0..(239 * 30) {
            l.accrue_block();
        }
        assert!(!l.can_decommission(&key(1)));
        assert_eq!(
            l.decommission(&key(1)),
            Err(CreditError::InsufficientCredit { node: key(1), credit: 239, minimum: 240 })
        );
        for _ in 0..30 {
            l.accrue_block();
        }
        assert!(l.can_decommission(&key(1)));
        assert_eq!(l.decommission(&key(1)), Ok(240));
        assert_eq!(l.credit(&key(1)), Some(0));
        assert_eq!(l.decommission(&key(1)), Err(CreditError::AlreadyDecommissioned(key(1))));
    }

    #[test]
    fn budget_burns_while_decommissioned() {
        let mut l = ledger();
        l.register(key(1));
        for _ in 0..(240 * 30) {
            l.accrue_block();
        }
        l.decommission(&key(1)).unwrap();
        for _ in 0..239 {
            l.accrue_block();
        }
        assert!(l.deregistration_candidates().is_empty());
        l.accrue_block();
        assert_eq!(l.deregistration_candidates(), vec![key(1)]);
        // No credit accrues while decommissioned.
        assert_eq!(l.credit(&key(1)), Some(0));
    }

    #[test]
    fn recommission_restarts_from_zero() {
        let mut l = ledger();
        l.register(key(1));
        assert_eq!(l.recommission(&key(1)), Err(CreditError::NotDecommissioned(key(1))));
        for _ in 0..(300 * 30) {
            l.accrue_block();
        }
        l.decommission(&key(1)).unwrap();
        l.accrue_block();
        l.recommission(&key(1)).unwrap();
        assert_eq!(l.credit(&key(1)), Some(0));
        assert!(!l.account(&key(1)).unwrap().is_decommissioned());
    }

    #[test]
    fn unknown_node() {
        let mut l = ledger();
        assert_eq!(l.decommission(&key(9)), Err(CreditError::UnknownNode(key(9))));
        assert_eq!(l.credit(&key(9)), None);
    }

    #[test]
    fn missed_checkpoints_need_a_full_window() {
        let mut l = ledger();
        l.register(key(1));
        for _ in 0..5 {
            l.record_checkpoint(&key(1), false);
        }
        // Five misses, but only five of eight quorums seen.
        assert!(l.deregistration_candidates().is_empty());
        for _ in 0..3 {
            l.record_checkpoint(&key(1), true);
        }
        assert_eq!(l.deregistration_candidates(), vec![key(1)]);
        // Window slides: the old misses age out.
        for _ in 0..2 {
            l.record_checkpoint(&key(1), true);
        }
        let account = l.account(&key(1)).unwrap();
        assert_eq!(account.checkpoints_tracked(), 8);
        assert_eq!(account.missed_checkpoints(), 3);
        assert!(l.deregistration_candidates().is_empty());
    }

    proptest! {
        #[test]
        fn credit_stays_in_bounds(ops in proptest::collection::vec(0u8..4, 0..2_000)) {
            let mut l = ledger();
            l.register(key(1));
            for op in ops {
                match op {
                    0 | 1 => l.accrue_block(),
                    2 => { let _ = l.decommission(&key(1)); }
                    _ => { let _ = l.recommission(&key(1)); }
                }
                let credit = l.credit(&key(1)).unwrap();
                prop_assert!(credit <= 720);
            }
        }

        #[test]
        fn decommission_never_below_minimum(blocks in 0u64..(400 * 30)) {
            let mut l = ledger();
            l.register(key(1));
            for _ in 0..blocks {
                l.accrue_block();
            }
            let credit = l.credit(&key(1)).unwrap();
            prop_assert_eq!(l.decommission(&key(1)).is_ok(), credit >= 240);
        }
    }
}
