use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use pof_core::{
    Address, CommitCertificate, ConsensusMessage, Hash, Identity, Phase, Proposal, RoundAdvance,
    Vote,
};
use tracing::{debug, error, info, warn};

use crate::candidate::CandidatePool;
use crate::config::{validate_observers, ConsensusConfig};
use crate::error::ConsensusError;
use crate::ledger::{FinalizedBlock, LedgerApplier};
use crate::vote::{VoteCollector, VoteKey, VoteSet};

/// Committed rounds kept around to catch late conflicting proposals
const COMMIT_HISTORY: usize = 16;

/// Where the current round stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStep {
    /// Waiting for the expected proposer
    Propose,
    /// A proposal is accepted and collecting votes
    Voting,
    /// Threshold met; transient until the next round starts
    Committed,
}

impl RoundStep {
    pub fn phase(&self) -> Phase {
        match self {
            RoundStep::Propose => Phase::Propose,
            RoundStep::Voting => Phase::Vote,
            RoundStep::Committed => Phase::Commit,
        }
    }
}

/// Two valid proposals from the expected proposer for the same (round, phase)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkEvidence {
    pub accepted: Proposal,
    pub conflicting: Proposal,
}

/// Result of a message that passed every guard
#[derive(Debug, Clone)]
pub enum Outcome {
    ProposalAccepted { round: u64, proposal_hash: Hash },
    /// The already accepted proposal was seen again
    DuplicateProposal,
    VoteCounted { count: usize, threshold: usize },
    /// This node's votes carried the accepted proposal past the threshold
    Committed(FinalizedBlock),
    /// A peer's commit certificate was verified and applied
    CommitAdopted(FinalizedBlock),
    /// A certificate for a round this node already committed
    AlreadyCommitted { round: u64 },
    RoundAdvanced { round: u64 },
}

/// Round/phase state machine.
///
/// Owns the current round, the accepted proposal, vote sets and fork
/// evidence. Every method takes `&mut self`; callers serialize access so
/// two validations for the same (round, phase) never interleave.
pub struct RoundStateMachine {
    config: ConsensusConfig,
    candidates: CandidatePool,
    voters: HashMap<Address, Identity>,
    votes: VoteCollector,
    round: u64,
    step: RoundStep,
    accepted: Option<(Proposal, Hash)>,
    committed: BTreeMap<u64, (Proposal, Hash)>,
    forks: Vec<ForkEvidence>,
    ledger: Arc<dyn LedgerApplier>,
}

impl RoundStateMachine {
    pub fn new(
        config: ConsensusConfig,
        formulators: Vec<Identity>,
        observers: Vec<Identity>,
        ledger: Arc<dyn LedgerApplier>,
    ) -> Result<Self, ConsensusError> {
        validate_observers(&observers)?;
        let candidates = CandidatePool::new(formulators.clone(), &config)?;

        let mut voters: HashMap<Address, Identity> =
            observers.into_iter().map(|o| (o.address, o)).collect();
        if config.formulators_vote {
            voters.extend(formulators.into_iter().map(|f| (f.address, f)));
        }
        if config.min_signatures > voters.len() {
            return Err(ConsensusError::InvalidSignatureCount);
        }

        let votes = VoteCollector::new(config.min_signatures);
        Ok(RoundStateMachine {
            config,
            candidates,
            voters,
            votes,
            round: 1,
            step: RoundStep::Propose,
            accepted: None,
            committed: BTreeMap::new(),
            forks: Vec::new(),
            ledger,
        })
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn step(&self) -> RoundStep {
        self.step
    }

    pub fn phase(&self) -> Phase {
        self.step.phase()
    }

    pub fn candidates(&self) -> &CandidatePool {
        &self.candidates
    }

    pub fn expected_proposer(&self) -> Result<Identity, ConsensusError> {
        self.candidates.expected_proposer(self.round).copied()
    }

    pub fn is_voter(&self, address: &Address) -> bool {
        self.voters.contains_key(address)
    }

    pub fn accepted_proposal(&self) -> Option<&Proposal> {
        self.accepted.as_ref().map(|(p, _)| p)
    }

    /// Distinct signatures gathered for the accepted proposal
    pub fn vote_count(&self) -> usize {
        self.accepted_key().map_or(0, |key| self.votes.count(&key))
    }

    pub fn fork_evidence(&self) -> &[ForkEvidence] {
        &self.forks
    }

    /// Hand recorded fork evidence to the penalty collaborator
    pub fn take_fork_evidence(&mut self) -> Vec<ForkEvidence> {
        std::mem::take(&mut self.forks)
    }

    /// Whether the threshold can still be met by signers already counted
    /// plus voters in `reachable` that have not signed yet
    pub fn is_threshold_reachable(&self, reachable: &[Address]) -> bool {
        let voters = reachable.iter().filter(|a| self.is_voter(a));
        let reachable_total = match self.accepted_key() {
            Some(key) => {
                let pending = voters
                    .filter(|a| !self.votes.has_signed(key.round, key.phase, a))
                    .count();
                self.votes.count(&key) + pending
            }
            None => voters.count(),
        };
        reachable_total >= self.votes.threshold()
    }

    pub fn handle(&mut self, message: &ConsensusMessage) -> Result<Outcome, ConsensusError> {
        match message {
            ConsensusMessage::Proposal(proposal) => self.apply_proposal(proposal),
            ConsensusMessage::Vote(vote) => self.apply_vote(vote),
            ConsensusMessage::RoundAdvance(advance) => self.apply_round_advance(advance),
            ConsensusMessage::Commit(certificate) => self.apply_commit(certificate),
        }
    }

    pub fn apply_proposal(&mut self, proposal: &Proposal) -> Result<Outcome, ConsensusError> {
        if proposal.id.phase != Phase::Propose {
            return Err(ConsensusError::InvalidRequest);
        }
        if proposal.id.round < self.round {
            return self.check_committed(proposal);
        }
        if proposal.id.round != self.round {
            return Err(ConsensusError::InvalidRoundState);
        }

        let expected = self.expected_proposer()?;
        if proposal.id.proposer != expected.address {
            return Err(ConsensusError::InvalidTopAddress);
        }
        proposal
            .verify(&expected.public_key)
            .map_err(|_| ConsensusError::InvalidTopSignature)?;
        let hash = proposal.hash()?;

        if self.step == RoundStep::Propose {
            info!(
                "Accepted proposal {} for round {} from {}",
                hash.short(),
                self.round,
                expected.address
            );
            self.accepted = Some((proposal.clone(), hash));
            self.step = RoundStep::Voting;
            return Ok(Outcome::ProposalAccepted {
                round: self.round,
                proposal_hash: hash,
            });
        }

        match self.accepted.clone() {
            Some((_, accepted_hash)) if accepted_hash == hash => Ok(Outcome::DuplicateProposal),
            Some((accepted, _)) => {
                self.record_fork(accepted, proposal.clone())?;
                Err(ConsensusError::FoundForkedBlockGen)
            }
            None => Err(ConsensusError::InvalidPhase),
        }
    }

    /// A proposal for a round this node has moved past. Only a round still
    /// in the commit history can be checked; a signed proposal from its
    /// proposer that differs from the committed one is fork evidence.
    fn check_committed(&mut self, proposal: &Proposal) -> Result<Outcome, ConsensusError> {
        let (committed, committed_hash) = self
            .committed
            .get(&proposal.id.round)
            .cloned()
            .ok_or(ConsensusError::InvalidRoundState)?;
        if proposal.id.proposer != committed.id.proposer {
            return Err(ConsensusError::InvalidTopAddress);
        }
        let proposer = self
            .candidates
            .get(&committed.id.proposer)
            .map(|c| c.identity)
            .ok_or(ConsensusError::InvalidTopAddress)?;
        proposal
            .verify(&proposer.public_key)
            .map_err(|_| ConsensusError::InvalidTopSignature)?;

        if proposal.hash()? == committed_hash {
            return Ok(Outcome::DuplicateProposal);
        }
        self.record_fork(committed, proposal.clone())?;
        Err(ConsensusError::FoundForkedBlockGen)
    }

    fn record_fork(&mut self, accepted: Proposal, conflicting: Proposal) -> Result<(), ConsensusError> {
        warn!(
            "Forked proposal from {} in round {}: {} vs {}",
            accepted.id.proposer,
            accepted.id.round,
            accepted.hash()?.short(),
            conflicting.hash()?.short()
        );
        let evidence = ForkEvidence {
            accepted,
            conflicting,
        };
        if !self.forks.contains(&evidence) {
            self.forks.push(evidence);
        }
        Ok(())
    }

    pub fn apply_vote(&mut self, vote: &Vote) -> Result<Outcome, ConsensusError> {
        if vote.phase != Phase::Vote {
            return Err(ConsensusError::InvalidRequest);
        }
        if vote.round != self.round {
            return Err(ConsensusError::InvalidRoundState);
        }
        if self.step != RoundStep::Voting {
            return Err(ConsensusError::InvalidPhase);
        }
        let key = self.accepted_key().ok_or(ConsensusError::InvalidPhase)?;

        let signer = *self.voters.get(&vote.signer).ok_or(ConsensusError::InvalidVote)?;
        if vote.proposal_hash != key.proposal_hash {
            return Err(ConsensusError::InvalidVote);
        }
        vote.verify(&signer.public_key)
            .map_err(|_| ConsensusError::InvalidVote)?;

        if self.votes.add(key, signer, vote.signature)? {
            return self.try_commit().map(Outcome::Committed);
        }
        Ok(Outcome::VoteCounted {
            count: self.votes.count(&key),
            threshold: self.votes.threshold(),
        })
    }

    pub fn apply_round_advance(&mut self, advance: &RoundAdvance) -> Result<Outcome, ConsensusError> {
        if advance.phase != Phase::Propose {
            return Err(ConsensusError::InvalidRequest);
        }
        if advance.round <= self.round || !self.within_window(advance.round) {
            return Err(ConsensusError::InvalidRoundState);
        }
        self.advance_to(advance.round);
        Ok(Outcome::RoundAdvanced { round: self.round })
    }

    /// Verify a peer's commit certificate and apply it.
    ///
    /// A certificate for the current round, or for a round inside the
    /// advance window, finalizes that block here as well: the ledger gets it
    /// and the proposer's quota is charged, so this node keeps computing the
    /// same proposers as the nodes that committed.
    pub fn apply_commit(&mut self, certificate: &CommitCertificate) -> Result<Outcome, ConsensusError> {
        let proposal = &certificate.proposal;
        if proposal.id.phase != Phase::Propose {
            return Err(ConsensusError::InvalidRequest);
        }
        let round = proposal.id.round;
        if round < self.round {
            return match self.check_committed(proposal)? {
                Outcome::DuplicateProposal => Ok(Outcome::AlreadyCommitted { round }),
                other => Ok(other),
            };
        }
        if !self.within_window(round) {
            return Err(ConsensusError::InvalidRoundState);
        }
        let next = round
            .checked_add(1)
            .ok_or(ConsensusError::InvalidRoundState)?;

        let proposer = if round == self.round {
            self.expected_proposer()?
        } else {
            self.candidates
                .get(&proposal.id.proposer)
                .map(|c| c.identity)
                .ok_or(ConsensusError::InvalidTopAddress)?
        };
        if proposal.id.proposer != proposer.address {
            return Err(ConsensusError::InvalidTopAddress);
        }
        proposal
            .verify(&proposer.public_key)
            .map_err(|_| ConsensusError::InvalidTopSignature)?;
        let proposal_hash = proposal.hash()?;

        let key = VoteKey {
            round,
            phase: Phase::Vote,
            proposal_hash,
        };
        let mut votes = VoteSet::new(key, self.votes.threshold());
        for vote in &certificate.votes {
            if vote.round != round || vote.phase != Phase::Vote || vote.proposal_hash != proposal_hash {
                return Err(ConsensusError::InvalidVote);
            }
            let signer = *self.voters.get(&vote.signer).ok_or(ConsensusError::InvalidVote)?;
            vote.verify(&signer.public_key)
                .map_err(|_| ConsensusError::InvalidVote)?;
            if !votes.insert(signer, vote.signature) {
                return Err(ConsensusError::AlreadyVoted);
            }
        }
        if !votes.has_quorum() {
            return Err(ConsensusError::InvalidSignatureCount);
        }

        if round == self.round {
            if let Some((accepted, accepted_hash)) = self.accepted.clone() {
                if accepted_hash != proposal_hash {
                    self.record_fork(accepted, proposal.clone())?;
                }
            }
        }

        let block = FinalizedBlock {
            proposal: proposal.clone(),
            proposal_hash,
            proposer,
            votes,
        };
        self.finalize(block, next).map(Outcome::CommitAdopted)
    }

    /// Abandon `round` if it is still current and uncommitted
    pub fn on_timeout(&mut self, round: u64) -> Result<Outcome, ConsensusError> {
        if round != self.round {
            return Err(ConsensusError::InvalidRoundState);
        }
        let next = self.next_round()?;
        warn!(
            "Round {} timed out in {:?} with {} votes",
            round,
            self.step,
            self.vote_count()
        );
        self.advance_to(next);
        Ok(Outcome::RoundAdvanced { round: self.round })
    }

    /// Finalize the accepted proposal.
    ///
    /// Fails with [`ConsensusError::InvalidSignatureCount`] below the
    /// threshold. Whether the ledger accepts the block or not, the machine
    /// moves on to the next round; only an accepted block counts against the
    /// proposer's quota.
    pub fn try_commit(&mut self) -> Result<FinalizedBlock, ConsensusError> {
        if self.step != RoundStep::Voting {
            return Err(ConsensusError::InvalidPhase);
        }
        let key = self.accepted_key().ok_or(ConsensusError::InvalidPhase)?;
        let votes = self
            .votes
            .get(&key)
            .filter(|set| set.has_quorum())
            .cloned()
            .ok_or(ConsensusError::InvalidSignatureCount)?;
        let (proposal, proposal_hash) = self.accepted.clone().ok_or(ConsensusError::InvalidPhase)?;
        let proposer = self
            .candidates
            .get(&proposal.id.proposer)
            .map(|c| c.identity)
            .ok_or(ConsensusError::InvalidTopAddress)?;
        let next = self.next_round()?;

        let block = FinalizedBlock {
            proposal,
            proposal_hash,
            proposer,
            votes,
        };
        self.finalize(block, next)
    }

    fn finalize(&mut self, block: FinalizedBlock, next: u64) -> Result<FinalizedBlock, ConsensusError> {
        self.step = RoundStep::Committed;
        let round = block.round();

        if let Err(e) = self.ledger.apply(&block) {
            error!("Ledger rejected round {} block: {}", round, e);
            self.advance_to(next);
            return Err(ConsensusError::Ledger(e.to_string()));
        }

        self.candidates.record_produced(&block.proposer.address)?;
        self.committed
            .insert(round, (block.proposal.clone(), block.proposal_hash));
        while self.committed.len() > COMMIT_HISTORY {
            self.committed.pop_first();
        }
        info!(
            "Committed round {} proposal {} with {} signatures",
            round,
            block.proposal_hash.short(),
            block.votes.count()
        );
        self.advance_to(next);
        Ok(block)
    }

    fn next_round(&self) -> Result<u64, ConsensusError> {
        self.round
            .checked_add(1)
            .ok_or(ConsensusError::InvalidRoundState)
    }

    fn within_window(&self, round: u64) -> bool {
        round <= self.round.saturating_add(self.config.max_round_advance)
    }

    fn accepted_key(&self) -> Option<VoteKey> {
        self.accepted.as_ref().map(|(_, hash)| VoteKey {
            round: self.round,
            phase: Phase::Vote,
            proposal_hash: *hash,
        })
    }

    fn advance_to(&mut self, round: u64) {
        let evicted = self.votes.evict_before(round);
        debug!(
            "Advancing from round {} to {}, evicted {} vote sets",
            self.round, round, evicted
        );
        self.round = round;
        self.step = RoundStep::Propose;
        self.accepted = None;
    }
}
