use pof_core::{CommitCertificate, Hash, Identity, Proposal};

use crate::vote::VoteSet;

/// A proposal that gathered enough distinct signatures
#[derive(Debug, Clone)]
pub struct FinalizedBlock {
    pub proposal: Proposal,
    pub proposal_hash: Hash,
    pub proposer: Identity,
    pub votes: VoteSet,
}

impl FinalizedBlock {
    pub fn round(&self) -> u64 {
        self.proposal.id.round
    }

    pub fn content_hash(&self) -> Hash {
        self.proposal.id.content_hash
    }

    /// What other nodes need to adopt this commit
    pub fn certificate(&self) -> CommitCertificate {
        CommitCertificate {
            proposal: self.proposal.clone(),
            votes: self.votes.votes(),
        }
    }
}

pub type LedgerError = Box<dyn std::error::Error + Send + Sync>;

/// The ledger subsystem that turns a finalized proposal into chain state
pub trait LedgerApplier: Send + Sync {
    fn apply(&self, block: &FinalizedBlock) -> Result<(), LedgerError>;
}
