//! Consensus integration tests

use std::sync::{Arc, Mutex};

use pof_consensus::{
    ConsensusConfig, ConsensusError, FinalizedBlock, LedgerApplier, LedgerError, Outcome,
    RoundStateMachine, RoundStep,
};
use pof_core::{
    hash_blake3, CommitCertificate, ConsensusMessage, Hash, Identity, KeyPair, Phase, Proposal,
    RoundAdvance, Vote,
};

#[derive(Default)]
struct MemoryLedger {
    blocks: Mutex<Vec<(u64, Hash, usize)>>,
}

impl LedgerApplier for MemoryLedger {
    fn apply(&self, block: &FinalizedBlock) -> Result<(), LedgerError> {
        self.blocks
            .lock()
            .unwrap()
            .push((block.round(), block.content_hash(), block.votes.count()));
        Ok(())
    }
}

/// Candidates [A, B, C], all voting, threshold 2, one block per formulator
fn setup_abc() -> (RoundStateMachine, Vec<KeyPair>, Arc<MemoryLedger>) {
    let keys: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
    let (machine, ledger) = machine_for(&keys);
    (machine, keys, ledger)
}

/// A second node over the same candidate set
fn machine_for(keys: &[KeyPair]) -> (RoundStateMachine, Arc<MemoryLedger>) {
    let ledger = Arc::new(MemoryLedger::default());
    let config = ConsensusConfig {
        min_candidates: 3,
        max_candidates: 3,
        max_blocks_per_formulator: 1,
        min_signatures: 2,
        formulators_vote: true,
        ..Default::default()
    };
    let machine = RoundStateMachine::new(
        config,
        keys.iter().map(|k| Identity::new(k.public)).collect(),
        vec![],
        ledger.clone(),
    )
    .unwrap();
    (machine, ledger)
}

fn identity(key: &KeyPair) -> Identity {
    Identity::new(key.public)
}

/// Drive one round to commit with the expected proposer and the other two votes
fn commit_current(machine: &mut RoundStateMachine, keys: &[KeyPair], content: &[u8]) -> FinalizedBlock {
    let round = machine.round();
    let expected = machine.expected_proposer().unwrap();
    let proposer = keys.iter().find(|k| identity(k) == expected).unwrap();
    let proposal = Proposal::new_signed(round, hash_blake3(content), proposer).unwrap();
    let hash = proposal.hash().unwrap();
    machine.apply_proposal(&proposal).unwrap();

    let mut committed = None;
    for voter in keys.iter().filter(|k| !std::ptr::eq(*k, proposer)) {
        if let Outcome::Committed(block) = machine
            .apply_vote(&Vote::new_signed(round, hash, voter).unwrap())
            .unwrap()
        {
            committed = Some(block);
        }
    }
    committed.unwrap()
}

#[test]
fn test_abc_round_commits_and_rotates() {
    let (mut machine, keys, ledger) = setup_abc();
    let (a, b, c) = (&keys[0], &keys[1], &keys[2]);

    assert_eq!(machine.round(), 1);
    assert_eq!(machine.expected_proposer().unwrap(), identity(a));

    let proposal = Proposal::new_signed(1, hash_blake3(b"H1"), a).unwrap();
    let proposal_hash = proposal.hash().unwrap();
    machine
        .handle(&ConsensusMessage::Proposal(proposal))
        .unwrap();

    let first = machine
        .handle(&ConsensusMessage::Vote(
            Vote::new_signed(1, proposal_hash, b).unwrap(),
        ))
        .unwrap();
    assert!(matches!(first, Outcome::VoteCounted { count: 1, threshold: 2 }));

    let second = machine
        .handle(&ConsensusMessage::Vote(
            Vote::new_signed(1, proposal_hash, c).unwrap(),
        ))
        .unwrap();
    let block = match second {
        Outcome::Committed(block) => block,
        other => panic!("expected commit, got {:?}", other),
    };
    assert_eq!(block.content_hash(), hash_blake3(b"H1"));
    assert_eq!(block.proposer, identity(a));

    assert_eq!(machine.round(), 2);
    assert_eq!(machine.step(), RoundStep::Propose);
    assert_eq!(machine.expected_proposer().unwrap(), identity(b));
    assert_eq!(
        *ledger.blocks.lock().unwrap(),
        vec![(1, hash_blake3(b"H1"), 2)]
    );
}

#[test]
fn test_vote_for_other_block_leaves_count_untouched() {
    let (mut machine, keys, _) = setup_abc();
    let (a, b) = (&keys[0], &keys[1]);

    let h1 = Proposal::new_signed(1, hash_blake3(b"H1"), a).unwrap();
    let h2 = Proposal::new_signed(1, hash_blake3(b"H2"), a).unwrap();
    machine.apply_proposal(&h1).unwrap();

    let result = machine.apply_vote(&Vote::new_signed(1, h2.hash().unwrap(), b).unwrap());
    assert!(matches!(result, Err(ConsensusError::InvalidVote)));
    assert_eq!(machine.vote_count(), 0);

    // B can still vote for the accepted block afterwards
    let outcome = machine
        .apply_vote(&Vote::new_signed(1, h1.hash().unwrap(), b).unwrap())
        .unwrap();
    assert!(matches!(outcome, Outcome::VoteCounted { count: 1, .. }));
}

#[test]
fn test_one_below_threshold_cannot_commit() {
    let (mut machine, keys, ledger) = setup_abc();
    let proposal = Proposal::new_signed(1, hash_blake3(b"H1"), &keys[0]).unwrap();
    let hash = proposal.hash().unwrap();
    machine.apply_proposal(&proposal).unwrap();
    machine
        .apply_vote(&Vote::new_signed(1, hash, &keys[1]).unwrap())
        .unwrap();

    // Flooding the same vote never reaches the threshold
    for _ in 0..5 {
        assert!(matches!(
            machine.apply_vote(&Vote::new_signed(1, hash, &keys[1]).unwrap()),
            Err(ConsensusError::AlreadyVoted)
        ));
    }
    assert!(matches!(
        machine.try_commit(),
        Err(ConsensusError::InvalidSignatureCount)
    ));
    assert!(ledger.blocks.lock().unwrap().is_empty());
    assert_eq!(machine.round(), 1);
}

#[test]
fn test_non_expected_proposer_rejected_even_when_signed() {
    let (mut machine, keys, _) = setup_abc();
    for impostor in &keys[1..] {
        let proposal = Proposal::new_signed(1, hash_blake3(b"H1"), impostor).unwrap();
        assert!(proposal.verify(&impostor.public).is_ok());
        assert!(matches!(
            machine.apply_proposal(&proposal),
            Err(ConsensusError::InvalidTopAddress)
        ));
    }
    assert!(machine.accepted_proposal().is_none());
}

#[test]
fn test_full_rotation_over_many_rounds() {
    let (mut machine, keys, ledger) = setup_abc();

    for round in 1..=7u64 {
        let expected = machine.expected_proposer().unwrap();
        let proposer = keys
            .iter()
            .find(|k| identity(k) == expected)
            .unwrap();
        assert_eq!(expected, identity(&keys[((round - 1) % 3) as usize]));

        let content = hash_blake3(&round.to_le_bytes());
        let proposal = Proposal::new_signed(round, content, proposer).unwrap();
        let hash = proposal.hash().unwrap();
        machine.apply_proposal(&proposal).unwrap();

        let voters: Vec<&KeyPair> = keys.iter().filter(|k| !std::ptr::eq(*k, proposer)).collect();
        machine
            .apply_vote(&Vote::new_signed(round, hash, voters[0]).unwrap())
            .unwrap();
        let outcome = machine
            .apply_vote(&Vote::new_signed(round, hash, voters[1]).unwrap())
            .unwrap();
        assert!(matches!(outcome, Outcome::Committed(_)));
    }

    assert_eq!(ledger.blocks.lock().unwrap().len(), 7);
    assert_eq!(machine.round(), 8);
}

#[test]
fn test_timeout_hands_round_to_next_candidate() {
    let (mut machine, keys, _) = setup_abc();
    machine.on_timeout(1).unwrap();

    assert_eq!(machine.round(), 2);
    assert_eq!(machine.expected_proposer().unwrap(), identity(&keys[1]));

    // A's late proposal for the abandoned round is stale
    let late = Proposal::new_signed(1, hash_blake3(b"late"), &keys[0]).unwrap();
    assert!(matches!(
        machine.apply_proposal(&late),
        Err(ConsensusError::InvalidRoundState)
    ));
}

#[test]
fn test_lagging_node_follows_rotation_through_certificates() {
    let (mut leader, keys, leader_ledger) = setup_abc();
    let (mut lagging, lagging_ledger) = machine_for(&keys);

    for round in 1..=7u64 {
        let block = commit_current(&mut leader, &keys, &round.to_le_bytes());
        let outcome = lagging
            .handle(&ConsensusMessage::Commit(block.certificate()))
            .unwrap();
        assert!(matches!(outcome, Outcome::CommitAdopted(ref b) if b.round() == round));

        assert_eq!(lagging.round(), leader.round());
        assert_eq!(
            lagging.expected_proposer().unwrap(),
            leader.expected_proposer().unwrap()
        );
        let produced = |m: &RoundStateMachine| -> Vec<u32> {
            m.candidates().candidates().iter().map(|c| c.produced).collect()
        };
        assert_eq!(produced(&lagging), produced(&leader));
    }
    assert_eq!(
        *lagging_ledger.blocks.lock().unwrap(),
        *leader_ledger.blocks.lock().unwrap()
    );
}

#[test]
fn test_certificate_for_skipped_rounds_keeps_quota() {
    let (mut leader, keys, _) = setup_abc();
    let (mut lagging, _) = machine_for(&keys);

    // The leader's first round times out, then B commits round 2
    leader.on_timeout(1).unwrap();
    let block = commit_current(&mut leader, &keys, b"H2");
    assert_eq!(block.proposer, identity(&keys[1]));

    lagging.apply_commit(&block.certificate()).unwrap();
    assert_eq!(lagging.round(), 3);
    assert_eq!(lagging.expected_proposer().unwrap(), identity(&keys[2]));
    assert_eq!(
        lagging.expected_proposer().unwrap(),
        leader.expected_proposer().unwrap()
    );
}

#[test]
fn test_forged_certificates_rejected() {
    let (mut leader, keys, _) = setup_abc();
    let (mut lagging, ledger) = machine_for(&keys);
    let block = commit_current(&mut leader, &keys, b"H1");
    let genuine = block.certificate();

    let mut short = genuine.clone();
    short.votes.truncate(1);
    assert!(matches!(
        lagging.apply_commit(&short),
        Err(ConsensusError::InvalidSignatureCount)
    ));

    let outsider = KeyPair::generate();
    let mut padded = short.clone();
    padded
        .votes
        .push(Vote::new_signed(1, block.proposal_hash, &outsider).unwrap());
    assert!(matches!(
        lagging.apply_commit(&padded),
        Err(ConsensusError::InvalidVote)
    ));

    let swapped = CommitCertificate {
        proposal: Proposal::new_signed(1, hash_blake3(b"other"), &keys[0]).unwrap(),
        votes: genuine.votes.clone(),
    };
    assert!(matches!(
        lagging.apply_commit(&swapped),
        Err(ConsensusError::InvalidVote)
    ));

    assert_eq!(lagging.round(), 1);
    assert!(ledger.blocks.lock().unwrap().is_empty());
    assert!(matches!(
        lagging.apply_commit(&genuine),
        Ok(Outcome::CommitAdopted(_))
    ));
}

#[test]
fn test_far_future_round_advance_rejected() {
    let (mut machine, _, _) = setup_abc();
    for round in [u64::MAX, 1 + machine.config().max_round_advance + 1] {
        let advance = RoundAdvance { round, phase: Phase::Propose };
        assert!(matches!(
            machine.handle(&ConsensusMessage::RoundAdvance(advance)),
            Err(ConsensusError::InvalidRoundState)
        ));
    }
    assert_eq!(machine.round(), 1);
    assert!(matches!(
        machine.on_timeout(1),
        Ok(Outcome::RoundAdvanced { round: 2 })
    ));
}

#[test]
fn test_conflicting_proposal_after_commit_is_evidence() {
    let (mut machine, keys, ledger) = setup_abc();
    let block = commit_current(&mut machine, &keys, b"H1");

    let conflicting = Proposal::new_signed(1, hash_blake3(b"H2"), &keys[0]).unwrap();
    assert!(matches!(
        machine.handle(&ConsensusMessage::Proposal(conflicting.clone())),
        Err(ConsensusError::FoundForkedBlockGen)
    ));
    let evidence = machine.take_fork_evidence();
    assert_eq!(evidence.len(), 1);
    assert_eq!(evidence[0].accepted, block.proposal);
    assert_eq!(evidence[0].conflicting, conflicting);

    // The committed block stands
    assert_eq!(ledger.blocks.lock().unwrap().len(), 1);
    assert_eq!(machine.round(), 2);
}
