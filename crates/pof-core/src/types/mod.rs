pub mod account;
pub mod identity;
pub mod message;

pub use account::{Account, SingleKeyAccount};
pub use identity::{Address, Identity, Role, ADDRESS_LEN};
pub use message::{CommitCertificate, ConsensusMessage, Phase, Proposal, ProposalId, RoundAdvance, Vote};
