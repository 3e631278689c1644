use thiserror::Error;

/// How a caller should treat a consensus failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad setup; fatal to starting or continuing consensus
    Configuration,
    /// Message rejected; sender behavior worth logging
    Authentication,
    /// Message dropped; the round carries on
    ProtocolState,
    /// Conflicting proposal recorded for the penalty collaborator
    ConflictEvidence,
    /// An external collaborator refused the result
    Collaborator,
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("insufficient candidate count")]
    InsufficientCandidateCount,

    #[error("exceed candidate count")]
    ExceedCandidateCount,

    #[error("invalid max blocks per formulator")]
    InvalidMaxBlocksPerFormulator,

    #[error("invalid observer key")]
    InvalidObserverKey,

    #[error("invalid round advance window")]
    InvalidRoundWindow,

    #[error("invalid top address")]
    InvalidTopAddress,

    #[error("invalid top signature")]
    InvalidTopSignature,

    #[error("invalid signature count")]
    InvalidSignatureCount,

    #[error("exist address")]
    ExistAddress,

    #[error("invalid phase")]
    InvalidPhase,

    #[error("found forked block gen")]
    FoundForkedBlockGen,

    #[error("invalid vote")]
    InvalidVote,

    #[error("invalid round state")]
    InvalidRoundState,

    #[error("invalid request")]
    InvalidRequest,

    #[error("already voted")]
    AlreadyVoted,

    #[error("Ledger rejected block: {0}")]
    Ledger(String),

    #[error("Core error: {0}")]
    Core(#[from] pof_core::CoreError),
}

impl ConsensusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsensusError::InsufficientCandidateCount
            | ConsensusError::ExceedCandidateCount
            | ConsensusError::InvalidMaxBlocksPerFormulator
            | ConsensusError::InvalidObserverKey
            | ConsensusError::InvalidRoundWindow
            | ConsensusError::ExistAddress => ErrorKind::Configuration,
            ConsensusError::InvalidTopAddress
            | ConsensusError::InvalidTopSignature
            | ConsensusError::InvalidSignatureCount => ErrorKind::Authentication,
            ConsensusError::InvalidPhase
            | ConsensusError::InvalidRoundState
            | ConsensusError::InvalidRequest
            | ConsensusError::InvalidVote
            | ConsensusError::AlreadyVoted
            | ConsensusError::Core(_) => ErrorKind::ProtocolState,
            ConsensusError::FoundForkedBlockGen => ErrorKind::ConflictEvidence,
            ConsensusError::Ledger(_) => ErrorKind::Collaborator,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_match_vocabulary() {
        assert_eq!(ConsensusError::InvalidTopAddress.to_string(), "invalid top address");
        assert_eq!(ConsensusError::AlreadyVoted.to_string(), "already voted");
        assert_eq!(
            ConsensusError::FoundForkedBlockGen.to_string(),
            "found forked block gen"
        );
    }

    #[test]
    fn test_kinds() {
        assert!(ConsensusError::ExceedCandidateCount.is_fatal());
        assert!(!ConsensusError::InvalidVote.is_fatal());
        assert_eq!(
            ConsensusError::InvalidSignatureCount.kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            ConsensusError::FoundForkedBlockGen.kind(),
            ErrorKind::ConflictEvidence
        );
    }
}
