//! PoF Consensus - Proof-of-Formulation round engine
//!
//! This crate provides the candidate rotation, vote collection and the
//! round/phase state machine that decides which proposal becomes the next
//! block.

pub mod candidate;
pub mod config;
pub mod error;
pub mod ledger;
pub mod machine;
pub mod vote;

pub use candidate::{select_proposer, Candidate, CandidatePool};
pub use config::{validate_observers, ConsensusConfig, MAX_BLOCKS_PER_FORMULATOR_LIMIT};
pub use error::{ConsensusError, ErrorKind};
pub use ledger::{FinalizedBlock, LedgerApplier, LedgerError};
pub use machine::{ForkEvidence, Outcome, RoundStateMachine, RoundStep};
pub use vote::{VoteCollector, VoteKey, VoteSet, VoteSignature};
