use std::collections::HashMap;
use std::sync::Mutex;

use pof_consensus::{FinalizedBlock, LedgerApplier, LedgerError};
use pof_core::{serialize, Account, Address, Hash, Identity, SingleKeyAccount};
use tracing::info;

#[derive(Debug, Clone, Copy)]
struct ChainHead {
    height: u64,
    round: u64,
    hash: Hash,
}

/// Minimal ledger: checks that the proposer's account authorizes the block
/// and chains the committed content hashes.
pub struct AccountLedger {
    accounts: HashMap<Address, Box<dyn Account>>,
    head: Mutex<ChainHead>,
}

impl AccountLedger {
    pub fn new(accounts: Vec<Box<dyn Account>>) -> Self {
        AccountLedger {
            accounts: accounts.into_iter().map(|a| (a.address(), a)).collect(),
            head: Mutex::new(ChainHead {
                height: 0,
                round: 0,
                hash: Hash::ZERO,
            }),
        }
    }

    /// One single-key account per formulator
    pub fn for_formulators(formulators: &[(Identity, String)]) -> Self {
        let accounts = formulators
            .iter()
            .map(|(identity, name)| {
                Box::new(SingleKeyAccount::new(*identity, name.clone())) as Box<dyn Account>
            })
            .collect();
        Self::new(accounts)
    }

    /// (height, hash) of the last applied block
    pub fn head(&self) -> (u64, Hash) {
        match self.head.lock() {
            Ok(head) => (head.height, head.hash),
            Err(poisoned) => {
                let head = poisoned.into_inner();
                (head.height, head.hash)
            }
        }
    }
}

impl LedgerApplier for AccountLedger {
    fn apply(&self, block: &FinalizedBlock) -> Result<(), LedgerError> {
        let account = self
            .accounts
            .get(&block.proposer.address)
            .ok_or_else(|| format!("no account for proposer {}", block.proposer.address))?;
        account.validate(&[block.proposer.public_key.public_hash()])?;

        if !block.votes.has_quorum() {
            return Err(format!(
                "block carries {} of {} signatures",
                block.votes.count(),
                block.votes.threshold()
            )
            .into());
        }

        let mut head = self.head.lock().map_err(|_| "ledger head poisoned")?;
        if head.height > 0 && block.round() <= head.round {
            return Err(format!(
                "round {} is not after applied round {}",
                block.round(),
                head.round
            )
            .into());
        }

        let hash = serialize::hash_of(&(head.hash, block.proposal_hash, block.content_hash()))?;
        *head = ChainHead {
            height: head.height + 1,
            round: block.round(),
            hash,
        };
        info!(
            "Applied block {} at height {} from {}",
            hash.short(),
            head.height,
            account.name()
        );
        Ok(())
    }
}
