use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{sign, verify, Hash, KeyPair, PublicKey, Sig};
use crate::error::CoreError;
use crate::serialize;
use crate::types::identity::Address;

/// Ordered step within a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Propose,
    Vote,
    Commit,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Propose => write!(f, "propose"),
            Phase::Vote => write!(f, "vote"),
            Phase::Commit => write!(f, "commit"),
        }
    }
}

/// The tuple a proposer signs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalId {
    pub round: u64,
    pub phase: Phase,
    pub proposer: Address,
    pub content_hash: Hash,
}

impl ProposalId {
    /// Hash of the encoded tuple; votes reference a proposal by this value
    pub fn hash(&self) -> Result<Hash, CoreError> {
        serialize::hash_of(self)
    }
}

/// A candidate block identity plus the proposer's signature over it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub signature: Sig,
}

impl Proposal {
    pub fn new_signed(
        round: u64,
        content_hash: Hash,
        proposer: &KeyPair,
    ) -> Result<Self, CoreError> {
        let id = ProposalId {
            round,
            phase: Phase::Propose,
            proposer: Address::from_public_key(&proposer.public),
            content_hash,
        };
        let signature = sign(&proposer.secret, id.hash()?.as_bytes());
        Ok(Proposal { id, signature })
    }

    pub fn hash(&self) -> Result<Hash, CoreError> {
        self.id.hash()
    }

    pub fn verify(&self, proposer_key: &PublicKey) -> Result<(), CoreError> {
        verify(proposer_key, self.hash()?.as_bytes(), &self.signature)
    }
}

/// A signer's endorsement of one proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub round: u64,
    pub phase: Phase,
    pub proposal_hash: Hash,
    pub signer: Address,
    pub signature: Sig,
}

impl Vote {
    pub fn new_signed(round: u64, proposal_hash: Hash, signer: &KeyPair) -> Result<Self, CoreError> {
        let mut vote = Vote {
            round,
            phase: Phase::Vote,
            proposal_hash,
            signer: Address::from_public_key(&signer.public),
            signature: Sig::default(),
        };
        vote.signature = sign(&signer.secret, &vote.signing_bytes()?);
        Ok(vote)
    }

    pub fn signing_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serialize::to_bytes(&(self.round, self.phase, self.proposal_hash, self.signer))
    }

    pub fn verify(&self, signer_key: &PublicKey) -> Result<(), CoreError> {
        verify(signer_key, &self.signing_bytes()?, &self.signature)
    }
}

/// Notice that the sender moved on to `round`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundAdvance {
    pub round: u64,
    pub phase: Phase,
}

/// A committed proposal with the votes that carried it past the threshold.
///
/// Lets a node that missed some of the votes adopt the commit instead of
/// skipping the round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitCertificate {
    pub proposal: Proposal,
    pub votes: Vec<Vote>,
}

impl CommitCertificate {
    pub fn round(&self) -> u64 {
        self.proposal.id.round
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    Vote(Vote),
    RoundAdvance(RoundAdvance),
    Commit(CommitCertificate),
}

impl ConsensusMessage {
    pub fn round(&self) -> u64 {
        match self {
            ConsensusMessage::Proposal(p) => p.id.round,
            ConsensusMessage::Vote(v) => v.round,
            ConsensusMessage::RoundAdvance(r) => r.round,
            ConsensusMessage::Commit(c) => c.round(),
        }
    }
}
