//! End-to-end scenarios over the staking rules and the consensus engine.

use snode_consensus::{
    NewBlock, NewState, NodeState, QuorumType, RegistrationContribution, RegistrationError, RulesConfig,
    StateChangeError, StateChangeTx, ThresholdEvent, VoteError, VoteOutcome, UNASSIGNED_SWARM_ID,
};
use snode_integration_tests::{block_hash, key_image, node_key, signing_key, TestChain};
use snode_staking::{get_staking_requirement, NetworkType, COIN, STAKING_PORTIONS_TOTAL};

#[test]
fn checkpoint_resolves_on_thirteenth_vote() {
    let mut chain = TestChain::with_nodes(RulesConfig::default(), 60, 100);
    chain.advance_to(104);
    let quorum = chain.quorum(104, QuorumType::Checkpoint);
    assert_eq!(quorum.validators.len(), 20);
    assert!(quorum.workers.is_empty());

    for i in 0..12 {
        let vote = chain.checkpoint_vote(&quorum, i);
        assert_eq!(chain.list.add_vote(&vote), Ok(VoteOutcome::Recorded));
    }
    let vote = chain.checkpoint_vote(&quorum, 12);
    let event = match chain.list.add_vote(&vote) {
        Ok(VoteOutcome::ThresholdReached(ThresholdEvent::Checkpoint(event))) => event,
        other => panic!("expected a checkpoint, got {other:?}"),
    };
    assert_eq!(event.height, 104);
    assert_eq!(event.block_hash, block_hash(104));
    assert_eq!(event.signatures.len(), 13);
    assert_eq!(chain.list.checkpoints().get(104).map(|c| c.signatures.len()), Some(13));

    let late = chain.checkpoint_vote(&quorum, 13);
    assert_eq!(chain.list.add_vote(&late), Ok(VoteOutcome::AlreadyResolved));
    let repeat = chain.checkpoint_vote(&quorum, 0);
    assert_eq!(chain.list.add_vote(&repeat), Ok(VoteOutcome::AlreadyResolved));
    assert_eq!(chain.list.pool().checkpoint_voters(104).len(), 14);
}

#[test]
fn checkpoint_vote_window() {
    let mut chain = TestChain::with_nodes(RulesConfig::default(), 60, 100);
    chain.advance_to(164);
    let quorum = chain.quorum(104, QuorumType::Checkpoint);
    let vote = chain.checkpoint_vote(&quorum, 0);
    assert_eq!(chain.list.add_vote(&vote), Ok(VoteOutcome::Recorded));

    chain.advance_to(165);
    let vote = chain.checkpoint_vote(&quorum, 1);
    assert_eq!(
        chain.list.add_vote(&vote),
        Err(VoteError::StaleHeight { height: 104, tip: 165 })
    );
}

#[test]
fn state_change_vote_window() {
    let mut chain = TestChain::with_nodes(RulesConfig::default(), 60, 100);
    let quorum = chain.quorum(100, QuorumType::StateChange);
    chain.advance_to(160);
    let vote = chain.state_change_vote(&quorum, 0, 0, NewState::Deregister);
    assert_eq!(chain.list.add_vote(&vote), Ok(VoteOutcome::Recorded));

    chain.advance_to(161);
    let vote = chain.state_change_vote(&quorum, 1, 0, NewState::Deregister);
    assert_eq!(
        chain.list.add_vote(&vote),
        Err(VoteError::StaleHeight { height: 100, tip: 161 })
    );
}

#[test]
fn rejected_votes() {
    let mut chain = TestChain::with_nodes(RulesConfig::default(), 60, 100);
    chain.advance_to(104);
    let quorum = chain.quorum(104, QuorumType::Checkpoint);

    // Signed by the wrong validator.
    let mut forged = chain.checkpoint_vote(&quorum, 0);
    forged.voter_index = 1;
    let err = chain.list.add_vote(&forged).unwrap_err();
    assert_eq!(err, VoteError::InvalidSignature { voter_index: 1 });
    assert!(err.is_rule_violation());

    // Votes for a block the chain does not have.
    let outsider = quorum.validators[2];
    let signer = (0..60).map(signing_key).find(|k| node_key_of(k) == outsider).unwrap();
    let wrong_block = snode_consensus::Vote::sign_checkpoint(&signer, 104, 2, block_hash(9999));
    assert_eq!(
        chain.list.add_vote(&wrong_block),
        Err(VoteError::BlockHashMismatch { height: 104 })
    );

    // No checkpoint quorum off the interval.
    let off_interval = snode_consensus::Vote::sign_checkpoint(&signer, 103, 2, block_hash(103));
    assert!(matches!(
        chain.list.add_vote(&off_interval),
        Err(VoteError::NoQuorum { height: 103, .. })
    ));

    let future = snode_consensus::Vote::sign_checkpoint(&signer, 108, 2, block_hash(108));
    assert!(matches!(chain.list.add_vote(&future), Err(VoteError::FutureHeight { .. })));
}

fn node_key_of(key: &ed25519_dalek::SigningKey) -> snode_consensus::NodeKey {
    snode_consensus::NodeKey::from(&key.verifying_key())
}

#[test]
fn seventh_state_change_vote_deregisters() {
    let mut chain = TestChain::with_nodes(RulesConfig::default(), 60, 100);
    let quorum = chain.quorum(100, QuorumType::StateChange);
    assert_eq!(quorum.validators.len(), 10);
    assert_eq!(quorum.workers.len(), 50);
    let worker = quorum.workers[3];

    assert_eq!(chain.vote_state_change(&quorum, 3, NewState::Deregister, 6), VoteOutcome::Recorded);
    let vote = chain.state_change_vote(&quorum, 6, 3, NewState::Deregister);
    let event = match chain.list.add_vote(&vote) {
        Ok(VoteOutcome::ThresholdReached(ThresholdEvent::StateChange(event))) => event,
        other => panic!("expected a state change, got {other:?}"),
    };
    assert_eq!(event.worker, worker);
    assert_eq!(event.signatures.len(), 7);

    let summary = chain.apply(NewBlock {
        state_changes: vec![StateChangeTx::from(&event)],
        ..NewBlock::empty(101, block_hash(101))
    });
    assert_eq!(summary.state_changes, vec![(worker, NewState::Deregister)]);
    let snapshot = chain.list.snapshot().unwrap();
    assert!(snapshot.node(&worker).is_none());
    assert_eq!(snapshot.swarms().swarm_of(&worker), None);
    assert!(chain.list.sink().node(&worker).unwrap().is_none());
    // The earlier snapshot still has it.
    assert!(chain.list.snapshot_at(100).unwrap().node(&worker).is_some());
}

#[test]
fn quorums_are_reproducible() {
    let a = TestChain::with_nodes(RulesConfig::default(), 60, 100);
    let b = TestChain::with_nodes(RulesConfig::default(), 60, 100);
    for quorum_type in QuorumType::ALL {
        let first = a.list.build_quorum(100, quorum_type).unwrap();
        let again = a.list.build_quorum(100, quorum_type).unwrap();
        let other = b.list.build_quorum(100, quorum_type).unwrap();
        assert_eq!(first, again);
        assert_eq!(first, other);
    }
    assert_eq!(
        a.list.sink().quorum(100, QuorumType::StateChange).unwrap().as_ref(),
        Some(&*a.quorum(100, QuorumType::StateChange))
    );
}

#[test]
fn batch_order_does_not_change_outcomes() {
    let mut a = TestChain::with_nodes(RulesConfig::default(), 60, 100);
    let mut b = TestChain::with_nodes(RulesConfig::default(), 60, 100);
    let quorum = a.quorum(100, QuorumType::Checkpoint);
    let votes: Vec<_> = (0..16).map(|i| a.checkpoint_vote(&quorum, i)).collect();
    let mut reversed = votes.clone();
    reversed.reverse();

    let forward = a.list.add_votes(&votes);
    let mut backward = b.list.add_votes(&reversed);
    backward.reverse();
    assert_eq!(forward, backward);
    assert!(matches!(
        forward[12],
        Ok(VoteOutcome::ThresholdReached(ThresholdEvent::Checkpoint(_)))
    ));
    assert_eq!(a.list.checkpoints().get(100), b.list.checkpoints().get(100));
}

fn low_credit_rules() -> RulesConfig {
    RulesConfig {
        decommission_minimum: 2,
        ..RulesConfig::default()
    }
}

#[test]
fn decommission_and_recommission() {
    let mut chain = TestChain::with_nodes(low_credit_rules(), 30, 1);
    chain.advance_to(70);
    let quorum = chain.quorum(70, QuorumType::StateChange);
    let worker = quorum.workers[0];
    assert_eq!(chain.list.snapshot().unwrap().credit().credit(&worker), Some(2));
    assert_eq!(chain.list.penalty_for(&worker), Some(NewState::Decommission));

    let event = match chain.vote_state_change(&quorum, 0, NewState::Decommission, 7) {
        VoteOutcome::ThresholdReached(ThresholdEvent::StateChange(event)) => event,
        other => panic!("expected a state change, got {other:?}"),
    };
    chain.apply(NewBlock {
        state_changes: vec![StateChangeTx::from(&event)],
        ..NewBlock::empty(71, block_hash(71))
    });
    let snapshot = chain.list.snapshot().unwrap();
    let node = snapshot.node(&worker).unwrap();
    assert_eq!(node.state, NodeState::Decommissioned);
    assert_eq!(node.swarm_id, UNASSIGNED_SWARM_ID);
    assert_eq!(snapshot.credit().account(&worker).unwrap().decommission_budget(), Some(1));
    assert_eq!(chain.list.penalty_for(&worker), Some(NewState::Deregister));

    // Decommissioned nodes are still tested as workers, never validate.
    let quorum = chain.quorum(71, QuorumType::StateChange);
    assert!(!quorum.validators.contains(&worker));
    let worker_index = quorum.worker_index(&worker).unwrap();
    let event = match chain.vote_state_change(&quorum, worker_index, NewState::Recommission, 7) {
        VoteOutcome::ThresholdReached(ThresholdEvent::StateChange(event)) => event,
        other => panic!("expected a state change, got {other:?}"),
    };
    let summary = chain.apply(NewBlock {
        state_changes: vec![StateChangeTx::from(&event)],
        ..NewBlock::empty(72, block_hash(72))
    });
    assert_eq!(summary.state_changes, vec![(worker, NewState::Recommission)]);
    let snapshot = chain.list.snapshot().unwrap();
    assert!(snapshot.node(&worker).unwrap().is_active());
    assert_ne!(snapshot.node(&worker).unwrap().swarm_id, UNASSIGNED_SWARM_ID);
    assert_eq!(snapshot.credit().credit(&worker), Some(0));
    assert!(summary.deregistration_candidates.is_empty());
}

#[test]
fn exhausted_budget_flags_node() {
    let mut chain = TestChain::with_nodes(low_credit_rules(), 30, 1);
    chain.advance_to(70);
    let quorum = chain.quorum(70, QuorumType::StateChange);
    let worker = quorum.workers[1];
    let event = match chain.vote_state_change(&quorum, 1, NewState::Decommission, 7) {
        VoteOutcome::ThresholdReached(ThresholdEvent::StateChange(event)) => event,
        other => panic!("expected a state change, got {other:?}"),
    };
    let summary = chain.apply(NewBlock {
        state_changes: vec![StateChangeTx::from(&event)],
        ..NewBlock::empty(71, block_hash(71))
    });
    assert!(summary.deregistration_candidates.is_empty());
    let summaries = chain.advance_to(72);
    assert_eq!(summaries[0].deregistration_candidates, vec![worker]);
}

#[test]
fn decommission_refused_without_credit() {
    let mut chain = TestChain::with_nodes(RulesConfig::default(), 30, 100);
    let quorum = chain.quorum(100, QuorumType::StateChange);
    let worker = quorum.workers[0];
    let event = match chain.vote_state_change(&quorum, 0, NewState::Decommission, 7) {
        VoteOutcome::ThresholdReached(ThresholdEvent::StateChange(event)) => event,
        other => panic!("expected a state change, got {other:?}"),
    };
    let summary = chain.apply(NewBlock {
        state_changes: vec![StateChangeTx::from(&event)],
        ..NewBlock::empty(101, block_hash(101))
    });
    assert!(matches!(
        summary.rejected_state_changes.as_slice(),
        [(node, StateChangeError::Credit(_))] if *node == worker
    ));
    assert!(chain.list.snapshot().unwrap().node(&worker).unwrap().is_active());
}

#[test]
fn silent_checkpoint_validator_is_flagged() {
    // Twenty nodes: every node sits in every checkpoint quorum.
    let mut chain = TestChain::with_nodes(RulesConfig::default(), 20, 100);
    let silent = node_key(0);
    chain.vote_checkpoint(100, &[silent]);
    let summaries = chain.advance_voting(189, &[silent]);
    let at = |h: u64| &summaries[(h - 101) as usize];

    assert!(at(185).deregistration_candidates.is_empty());
    assert_eq!(at(189).deregistration_candidates, vec![silent]);
    let account = chain.list.snapshot().unwrap().credit().account(&silent).unwrap().clone();
    assert_eq!(account.checkpoints_tracked(), 8);
    assert_eq!(account.missed_checkpoints(), 8);
    let voter = node_key(1);
    let voter_account = chain.list.snapshot().unwrap().credit().account(&voter).unwrap().clone();
    assert_eq!(voter_account.missed_checkpoints(), 0);
}

#[test]
fn checkpoints_persist_on_cadence_and_bound_reorgs() {
    let mut chain = TestChain::with_nodes(RulesConfig::default(), 60, 100);
    chain.advance_voting(125, &[]);

    assert!(chain.list.checkpoints().get(116).is_some());
    assert!(chain.list.sink().checkpoint(116).unwrap().is_none());
    assert!(chain.list.sink().checkpoint(120).unwrap().is_some());

    assert_eq!(chain.list.checkpoints().latest().map(|c| c.height), Some(124));
    assert!(!chain.list.reorg_allowed(124));
    assert!(chain.list.reorg_allowed(125));
}

#[test]
fn shared_stake_registration() {
    let nettype = NetworkType::Mainnet;
    let requirement = get_staking_requirement(nettype, 100);
    let quarter = requirement / 4;
    let contribution = |i: u32, amount: u64| RegistrationContribution {
        contributor: signing_key(i).verifying_key().to_bytes(),
        key_image: key_image(i),
        amount,
    };

    let mut chain = TestChain::mainnet();
    let shared = snode_consensus::Registration {
        key: node_key(100),
        operator_fee: STAKING_PORTIONS_TOTAL / 10,
        contributions: vec![
            contribution(100, requirement - 3 * quarter),
            contribution(101, quarter),
            contribution(102, quarter),
            contribution(103, quarter),
        ],
    };
    let too_many = snode_consensus::Registration {
        key: node_key(200),
        operator_fee: 0,
        contributions: (200..205).map(|i| contribution(i, requirement / 5)).collect(),
    };
    let short = snode_consensus::Registration {
        key: node_key(300),
        operator_fee: 0,
        contributions: vec![contribution(300, requirement - COIN)],
    };
    let reused_image = snode_consensus::Registration {
        key: node_key(400),
        operator_fee: 0,
        contributions: vec![RegistrationContribution {
            key_image: key_image(101),
            ..contribution(400, requirement)
        }],
    };

    let summary = chain.apply(NewBlock {
        registrations: vec![shared, too_many, short, reused_image],
        ..NewBlock::empty(100, block_hash(100))
    });
    assert_eq!(summary.registered, vec![node_key(100)]);
    let rejected: Vec<_> = summary.rejected_registrations.iter().map(|(k, e)| (*k, e.clone())).collect();
    assert!(matches!(rejected[0], (k, RegistrationError::TooManyContributors(_)) if k == node_key(200)));
    assert!(matches!(rejected[1], (k, RegistrationError::Underfunded { .. }) if k == node_key(300)));
    assert!(matches!(rejected[2], (k, RegistrationError::DuplicateKeyImage(_)) if k == node_key(400)));

    let node = chain.list.snapshot().unwrap().node(&node_key(100)).cloned().unwrap();
    assert_eq!(node.contributors.len(), 4);
    assert_eq!(node.total_contributed(), requirement);
}
