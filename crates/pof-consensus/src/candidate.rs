use std::collections::HashSet;

use pof_core::{Address, Identity};
use tracing::debug;

use crate::config::ConsensusConfig;
use crate::error::ConsensusError;

/// A formulator eligible to propose, with its production count in the current rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub identity: Identity,
    pub produced: u32,
}

/// Pick the proposer index for `round`.
///
/// Round `r` starts at index `(r - 1) % n` and walks forward past candidates
/// that already hit `max_blocks`. When every candidate is exhausted the
/// rotation is treated as reset and the starting index wins. Depends only on
/// its arguments, so every honest node derives the same leader.
pub fn select_proposer(round: u64, candidates: &[Candidate], max_blocks: u32) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let n = candidates.len();
    let start = (round.saturating_sub(1) % n as u64) as usize;
    (0..n)
        .map(|offset| (start + offset) % n)
        .find(|&i| candidates[i].produced < max_blocks)
        .or(Some(start))
}

/// Ordered candidate list plus per-candidate production quota
#[derive(Debug, Clone)]
pub struct CandidatePool {
    candidates: Vec<Candidate>,
    min_candidates: usize,
    max_candidates: usize,
    max_blocks_per_formulator: u32,
}

impl CandidatePool {
    pub fn new(identities: Vec<Identity>, config: &ConsensusConfig) -> Result<Self, ConsensusError> {
        config.validate()?;
        let mut pool = CandidatePool {
            candidates: Vec::new(),
            min_candidates: config.min_candidates,
            max_candidates: config.max_candidates,
            max_blocks_per_formulator: config.max_blocks_per_formulator,
        };
        pool.rotate(identities)?;
        Ok(pool)
    }

    /// Replace the candidate list, resetting all production counters
    pub fn rotate(&mut self, identities: Vec<Identity>) -> Result<(), ConsensusError> {
        if identities.len() < self.min_candidates {
            return Err(ConsensusError::InsufficientCandidateCount);
        }
        if identities.len() > self.max_candidates {
            return Err(ConsensusError::ExceedCandidateCount);
        }
        let mut seen = HashSet::new();
        if !identities.iter().all(|id| seen.insert(id.address)) {
            return Err(ConsensusError::ExistAddress);
        }

        self.candidates = identities
            .into_iter()
            .map(|identity| Candidate {
                identity,
                produced: 0,
            })
            .collect();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn max_blocks_per_formulator(&self) -> u32 {
        self.max_blocks_per_formulator
    }

    pub fn get(&self, address: &Address) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.identity.address == *address)
    }

    pub fn expected_proposer(&self, round: u64) -> Result<&Identity, ConsensusError> {
        select_proposer(round, &self.candidates, self.max_blocks_per_formulator)
            .map(|i| &self.candidates[i].identity)
            .ok_or(ConsensusError::InsufficientCandidateCount)
    }

    /// Count a committed block against `address`'s quota
    pub fn record_produced(&mut self, address: &Address) -> Result<(), ConsensusError> {
        let max = self.max_blocks_per_formulator;
        let candidate = self
            .candidates
            .iter_mut()
            .find(|c| c.identity.address == *address)
            .ok_or(ConsensusError::InvalidTopAddress)?;
        candidate.produced = (candidate.produced + 1).min(max);

        if self.candidates.iter().all(|c| c.produced >= max) {
            debug!("every candidate reached its quota, resetting rotation");
            self.reset_rotation();
        }
        Ok(())
    }

    pub fn reset_rotation(&mut self) {
        for candidate in &mut self.candidates {
            candidate.produced = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pof_core::KeyPair;

    fn identities(n: usize) -> Vec<Identity> {
        (0..n).map(|_| Identity::new(KeyPair::generate().public)).collect()
    }

    fn pool(ids: &[Identity], max_blocks: u32) -> CandidatePool {
        let config = ConsensusConfig {
            min_candidates: 2,
            max_candidates: 5,
            max_blocks_per_formulator: max_blocks,
            ..Default::default()
        };
        CandidatePool::new(ids.to_vec(), &config).unwrap()
    }

    #[test]
    fn test_candidate_count_bounds() {
        let config = ConsensusConfig {
            min_candidates: 2,
            max_candidates: 3,
            ..Default::default()
        };
        assert!(matches!(
            CandidatePool::new(identities(1), &config),
            Err(ConsensusError::InsufficientCandidateCount)
        ));
        assert!(matches!(
            CandidatePool::new(identities(4), &config),
            Err(ConsensusError::ExceedCandidateCount)
        ));
        assert!(CandidatePool::new(identities(3), &config).is_ok());
    }

    #[test]
    fn test_duplicate_candidate_rejected() {
        let ids = identities(2);
        let config = ConsensusConfig::default();
        assert!(matches!(
            CandidatePool::new(vec![ids[0], ids[1], ids[0]], &config),
            Err(ConsensusError::ExistAddress)
        ));
    }

    #[test]
    fn test_round_robin_rotation() {
        let ids = identities(3);
        let pool = pool(&ids, 1);
        assert_eq!(pool.expected_proposer(1).unwrap(), &ids[0]);
        assert_eq!(pool.expected_proposer(2).unwrap(), &ids[1]);
        assert_eq!(pool.expected_proposer(3).unwrap(), &ids[2]);
        assert_eq!(pool.expected_proposer(4).unwrap(), &ids[0]);
    }

    #[test]
    fn test_exhausted_candidate_skipped() {
        let ids = identities(3);
        let mut pool = pool(&ids, 1);
        pool.record_produced(&ids[1].address).unwrap();

        // Round 2 would start at B, who is out of quota
        assert_eq!(pool.expected_proposer(2).unwrap(), &ids[2]);
    }

    #[test]
    fn test_rotation_resets_when_all_exhausted() {
        let ids = identities(3);
        let mut pool = pool(&ids, 2);
        for id in &ids {
            pool.record_produced(&id.address).unwrap();
            pool.record_produced(&id.address).unwrap();
        }
        assert!(pool.candidates().iter().all(|c| c.produced == 0));
    }

    #[test]
    fn test_produced_never_exceeds_quota() {
        let ids = identities(3);
        let mut pool = pool(&ids, 2);
        for _ in 0..5 {
            pool.record_produced(&ids[0].address).unwrap();
        }
        assert!(pool.get(&ids[0].address).unwrap().produced <= 2);
    }

    #[test]
    fn test_selection_is_pure() {
        let ids = identities(4);
        let mut candidates: Vec<Candidate> = ids
            .iter()
            .map(|identity| Candidate {
                identity: *identity,
                produced: 0,
            })
            .collect();
        candidates[2].produced = 1;

        for round in 1..20 {
            let first = select_proposer(round, &candidates, 1);
            let second = select_proposer(round, &candidates.clone(), 1);
            assert_eq!(first, second);
            assert_ne!(first, Some(2));
        }
        assert_eq!(select_proposer(1, &[], 1), None);
    }

    #[test]
    fn test_unknown_producer() {
        let ids = identities(2);
        let mut pool = pool(&ids, 1);
        assert!(matches!(
            pool.record_produced(&identities(1)[0].address),
            Err(ConsensusError::InvalidTopAddress)
        ));
    }
}
