use std::collections::{BTreeMap, HashMap};

use pof_core::{Address, Hash, Identity, Phase, Sig, Vote};
use tracing::debug;

use crate::error::ConsensusError;

/// What a vote set is collecting signatures for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoteKey {
    pub round: u64,
    pub phase: Phase,
    pub proposal_hash: Hash,
}

/// A verified signature from one signer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteSignature {
    pub signer: Identity,
    pub signature: Sig,
}

/// Signatures collected for one proposal, at most one per signer
#[derive(Debug, Clone)]
pub struct VoteSet {
    key: VoteKey,
    signatures: BTreeMap<Address, VoteSignature>,
    threshold: usize,
}

impl VoteSet {
    pub fn new(key: VoteKey, threshold: usize) -> Self {
        VoteSet {
            key,
            signatures: BTreeMap::new(),
            threshold,
        }
    }

    pub fn key(&self) -> &VoteKey {
        &self.key
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn count(&self) -> usize {
        self.signatures.len()
    }

    pub fn has_quorum(&self) -> bool {
        self.count() >= self.threshold
    }

    pub fn has_signed(&self, address: &Address) -> bool {
        self.signatures.contains_key(address)
    }

    pub fn signatures(&self) -> impl Iterator<Item = &VoteSignature> {
        self.signatures.values()
    }

    /// The collected signatures as votes, in address order
    pub fn votes(&self) -> Vec<Vote> {
        self.signatures
            .values()
            .map(|vs| Vote {
                round: self.key.round,
                phase: self.key.phase,
                proposal_hash: self.key.proposal_hash,
                signer: vs.signer.address,
                signature: vs.signature,
            })
            .collect()
    }

    /// Record a signature already verified by the caller. Returns false if
    /// the signer is already present.
    pub fn insert(&mut self, signer: Identity, signature: Sig) -> bool {
        if self.has_signed(&signer.address) {
            return false;
        }
        self.signatures
            .insert(signer.address, VoteSignature { signer, signature });
        true
    }
}

/// Vote sets keyed by (round, phase, proposal)
#[derive(Debug)]
pub struct VoteCollector {
    sets: HashMap<VoteKey, VoteSet>,
    threshold: usize,
}

impl VoteCollector {
    pub fn new(threshold: usize) -> Self {
        VoteCollector {
            sets: HashMap::new(),
            threshold,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Add an already verified signature.
    ///
    /// Returns `true` only for the signature that brings the set to its
    /// threshold. A signer that already signed anything in the same
    /// (round, phase) gets [`ConsensusError::AlreadyVoted`].
    pub fn add(
        &mut self,
        key: VoteKey,
        signer: Identity,
        signature: Sig,
    ) -> Result<bool, ConsensusError> {
        if self.has_signed(key.round, key.phase, &signer.address) {
            return Err(ConsensusError::AlreadyVoted);
        }

        let threshold = self.threshold;
        let set = self
            .sets
            .entry(key)
            .or_insert_with(|| VoteSet::new(key, threshold));
        set.insert(signer, signature);

        debug!(
            "Added vote from {} for round {}, total: {}/{}",
            signer.address,
            key.round,
            set.count(),
            set.threshold
        );
        Ok(set.count() == set.threshold)
    }

    pub fn has_signed(&self, round: u64, phase: Phase, address: &Address) -> bool {
        self.sets
            .values()
            .any(|set| set.key.round == round && set.key.phase == phase && set.has_signed(address))
    }

    pub fn count(&self, key: &VoteKey) -> usize {
        self.sets.get(key).map_or(0, VoteSet::count)
    }

    pub fn get(&self, key: &VoteKey) -> Option<&VoteSet> {
        self.sets.get(key)
    }

    /// Drop every set for rounds older than `round`; returns how many went
    pub fn evict_before(&mut self, round: u64) -> usize {
        let before = self.sets.len();
        self.sets.retain(|key, _| key.round >= round);
        before - self.sets.len()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
