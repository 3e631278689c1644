use std::collections::HashSet;

use pof_core::Identity;

use crate::error::ConsensusError;

/// Upper bound on consecutive blocks a single formulator may produce before rotation
pub const MAX_BLOCKS_PER_FORMULATOR_LIMIT: u32 = 10;

/// Consensus parameters shared by every honest node
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Fewest candidates consensus can run with
    pub min_candidates: usize,
    /// Most candidates allowed in one rotation
    pub max_candidates: usize,
    /// Blocks a candidate produces before it is skipped until rotation resets
    pub max_blocks_per_formulator: u32,
    /// Distinct signatures needed to commit a proposal
    pub min_signatures: usize,
    /// Whether formulators vote alongside observers
    pub formulators_vote: bool,
    /// Time a round may stay uncommitted before it is abandoned
    pub round_timeout_ms: u64,
    /// Furthest ahead of the current round a peer may move this node
    pub max_round_advance: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            min_candidates: 1,
            max_candidates: 100,
            max_blocks_per_formulator: 1,
            min_signatures: 2,
            formulators_vote: true,
            round_timeout_ms: 10_000,
            max_round_advance: 16,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.max_blocks_per_formulator == 0
            || self.max_blocks_per_formulator > MAX_BLOCKS_PER_FORMULATOR_LIMIT
        {
            return Err(ConsensusError::InvalidMaxBlocksPerFormulator);
        }
        if self.min_candidates == 0 {
            return Err(ConsensusError::InsufficientCandidateCount);
        }
        if self.max_candidates < self.min_candidates {
            return Err(ConsensusError::ExceedCandidateCount);
        }
        if self.min_signatures == 0 {
            return Err(ConsensusError::InvalidSignatureCount);
        }
        if self.max_round_advance == 0 {
            return Err(ConsensusError::InvalidRoundWindow);
        }
        Ok(())
    }
}

/// Observers must be distinct, valid ed25519 keys
pub fn validate_observers(observers: &[Identity]) -> Result<(), ConsensusError> {
    let mut seen = HashSet::new();
    for observer in observers {
        if observer.public_key.to_verifying_key().is_err() || !seen.insert(observer.address) {
            return Err(ConsensusError::InvalidObserverKey);
        }
    }
    Ok(())
}
