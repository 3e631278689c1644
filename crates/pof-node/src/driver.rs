use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pof_consensus::{ConsensusError, ErrorKind, Outcome, RoundStateMachine};
use pof_core::{
    serialize, Address, ConsensusMessage, Hash, Identity, KeyPair, Phase, Proposal, RoundAdvance,
    Vote,
};
use pof_p2p::PeerRegistry;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

/// Input to the consensus driver
#[derive(Debug)]
pub enum DriverEvent {
    /// A decoded message received from a peer
    Message {
        from: Address,
        message: ConsensusMessage,
    },
}

/// Work left over after the machine settled one result
enum FollowUp {
    Done,
    Vote { round: u64, proposal_hash: Hash },
    CheckQuorum,
    Broadcast(ConsensusMessage),
}

/// Single owner of the round state machine.
///
/// Peer messages, the proposal timer and the round timer are all handled on
/// one task, so every validation for a round runs to completion before the
/// next one starts. Outgoing messages go to `outbox` in the order they are
/// produced; when the outbox is full they are dropped rather than stalling
/// the round timers.
pub struct ConsensusDriver {
    machine: RoundStateMachine,
    keypair: KeyPair,
    identity: Identity,
    registry: Arc<PeerRegistry>,
    inbox: mpsc::Receiver<DriverEvent>,
    outbox: mpsc::Sender<ConsensusMessage>,
    round_timeout: Duration,
    propose_delay: Duration,
    round: u64,
    deadline: Instant,
    propose_at: Option<Instant>,
    last_content: Hash,
    halted: bool,
}

impl ConsensusDriver {
    pub fn new(
        machine: RoundStateMachine,
        keypair: KeyPair,
        registry: Arc<PeerRegistry>,
        inbox: mpsc::Receiver<DriverEvent>,
        outbox: mpsc::Sender<ConsensusMessage>,
        propose_delay: Duration,
    ) -> Self {
        let identity = Identity::new(keypair.public);
        let round_timeout = Duration::from_millis(machine.config().round_timeout_ms);
        let round = machine.round();
        ConsensusDriver {
            machine,
            keypair,
            identity,
            registry,
            inbox,
            outbox,
            round_timeout,
            propose_delay,
            round,
            deadline: Instant::now() + round_timeout,
            propose_at: None,
            last_content: Hash::ZERO,
            halted: false,
        }
    }

    /// Drive rounds until the inbox closes
    pub async fn run(mut self) {
        info!(
            "Consensus driver started as {} (voter: {})",
            self.identity.address,
            self.machine.is_voter(&self.identity.address)
        );
        self.schedule_round();

        loop {
            let propose_at = self.propose_at.unwrap_or(self.deadline);
            tokio::select! {
                event = self.inbox.recv() => match event {
                    Some(DriverEvent::Message { from, message }) => {
                        let result = self.machine.handle(&message);
                        self.process(Some(from), result).await;
                    }
                    None => {
                        info!("Consensus inbox closed, stopping driver");
                        break;
                    }
                },
                _ = sleep_until(propose_at), if self.propose_at.is_some() => {
                    self.propose().await;
                }
                _ = sleep_until(self.deadline) => {
                    let result = self.machine.on_timeout(self.round);
                    self.process(None, result).await;
                }
            }

            if self.halted {
                error!("Consensus driver halted in round {}", self.machine.round());
                break;
            }
            if self.machine.round() != self.round {
                self.schedule_round();
            }
        }
    }

    fn schedule_round(&mut self) {
        self.round = self.machine.round();
        let now = Instant::now();
        self.deadline = now + self.round_timeout;
        self.propose_at = match self.machine.expected_proposer() {
            Ok(proposer) if proposer.address == self.identity.address => {
                Some(now + self.propose_delay)
            }
            Ok(proposer) => {
                debug!("Round {} waits for {}", self.round, proposer.address);
                None
            }
            Err(e) => {
                error!("No proposer for round {}: {}", self.round, e);
                None
            }
        };
    }

    async fn propose(&mut self) {
        self.propose_at = None;
        let round = self.machine.round();

        let content_hash = match serialize::hash_of(&(
            self.last_content,
            round,
            self.identity.address,
            now_millis(),
        )) {
            Ok(hash) => hash,
            Err(e) => {
                error!("Failed to build round {} content: {}", round, e);
                return;
            }
        };
        let proposal = match Proposal::new_signed(round, content_hash, &self.keypair) {
            Ok(proposal) => proposal,
            Err(e) => {
                error!("Failed to sign round {} proposal: {}", round, e);
                return;
            }
        };

        info!("Proposing {} for round {}", content_hash.short(), round);
        let result = self.machine.apply_proposal(&proposal);
        if result.is_ok() {
            self.send(ConsensusMessage::Proposal(proposal));
        }
        self.process(None, result).await;
    }

    /// Settle a machine result and run whatever it triggers
    async fn process(&mut self, from: Option<Address>, result: Result<Outcome, ConsensusError>) {
        let mut next = self.settle(from, result);
        loop {
            next = match next {
                FollowUp::Done => break,
                FollowUp::Vote {
                    round,
                    proposal_hash,
                } => match Vote::new_signed(round, proposal_hash, &self.keypair) {
                    Ok(vote) => {
                        self.send(ConsensusMessage::Vote(vote.clone()));
                        let result = self.machine.apply_vote(&vote);
                        self.settle(None, result)
                    }
                    Err(e) => {
                        error!("Failed to sign vote for round {}: {}", round, e);
                        FollowUp::Done
                    }
                },
                FollowUp::CheckQuorum => {
                    let mut reachable = self.registry.reachable(None).await;
                    reachable.push(self.identity.address);
                    if !self.machine.is_threshold_reachable(&reachable) {
                        warn!(
                            "Round {} cannot reach {} signatures with {} reachable members",
                            self.machine.round(),
                            self.machine.config().min_signatures,
                            reachable.len()
                        );
                    }
                    FollowUp::Done
                }
                FollowUp::Broadcast(message) => {
                    self.send(message);
                    FollowUp::Done
                }
            };
        }
    }

    fn settle(&mut self, from: Option<Address>, result: Result<Outcome, ConsensusError>) -> FollowUp {
        match result {
            Ok(Outcome::ProposalAccepted {
                round,
                proposal_hash,
            }) => {
                if self.machine.is_voter(&self.identity.address) {
                    FollowUp::Vote {
                        round,
                        proposal_hash,
                    }
                } else {
                    FollowUp::Done
                }
            }
            Ok(Outcome::DuplicateProposal) => {
                trace!("Duplicate proposal in round {}", self.machine.round());
                FollowUp::Done
            }
            Ok(Outcome::VoteCounted { count, threshold }) => {
                debug!(
                    "Round {} has {}/{} signatures",
                    self.machine.round(),
                    count,
                    threshold
                );
                FollowUp::CheckQuorum
            }
            Ok(Outcome::Committed(block)) => {
                self.last_content = block.content_hash();
                FollowUp::Broadcast(ConsensusMessage::Commit(block.certificate()))
            }
            Ok(Outcome::CommitAdopted(block)) => {
                info!(
                    "Adopted round {} commit from {}",
                    block.round(),
                    from.map_or_else(|| "local".to_string(), |a| a.to_hex())
                );
                self.last_content = block.content_hash();
                FollowUp::Done
            }
            Ok(Outcome::AlreadyCommitted { round }) => {
                trace!("Round {} already committed", round);
                FollowUp::Done
            }
            Ok(Outcome::RoundAdvanced { round }) => {
                if from.is_none() {
                    // Our own timeout; tell the others
                    FollowUp::Broadcast(ConsensusMessage::RoundAdvance(RoundAdvance {
                        round,
                        phase: Phase::Propose,
                    }))
                } else {
                    FollowUp::Done
                }
            }
            Err(e) => {
                self.report(from, e);
                FollowUp::Done
            }
        }
    }

    fn report(&mut self, from: Option<Address>, e: ConsensusError) {
        let source = from.map_or_else(|| "local".to_string(), |a| a.to_hex());
        if e.is_fatal() {
            error!(peer = %source, "Fatal consensus error: {}", e);
            self.halted = true;
            return;
        }
        match e.kind() {
            ErrorKind::Authentication => warn!(peer = %source, "Rejected message: {}", e),
            ErrorKind::ProtocolState => debug!(peer = %source, "Dropped message: {}", e),
            ErrorKind::ConflictEvidence => {
                for evidence in self.machine.take_fork_evidence() {
                    warn!(
                        proposer = %evidence.accepted.id.proposer,
                        round = evidence.accepted.id.round,
                        "Fork evidence: {} vs {}",
                        evidence.accepted.id.content_hash.short(),
                        evidence.conflicting.id.content_hash.short()
                    );
                }
            }
            ErrorKind::Collaborator | ErrorKind::Configuration => {
                error!(peer = %source, "Consensus error: {}", e)
            }
        }
    }

    fn send(&self, message: ConsensusMessage) {
        match self.outbox.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!("Outbox full, dropping round {} message", message.round());
            }
            Err(TrySendError::Closed(_)) => debug!("Outbox closed, dropping message"),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
