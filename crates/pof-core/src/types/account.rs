use std::fmt;

use crate::crypto::PublicHash;
use crate::error::CoreError;
use crate::types::identity::{Address, Identity};

/// Capability the ledger subsystem exposes for an account.
///
/// Consensus only needs to know who an account is and whether a set of
/// signers is allowed to act for it; balances and transaction rules live
/// behind this trait.
pub trait Account: fmt::Debug + Send + Sync {
    fn address(&self) -> Address;

    fn name(&self) -> &str;

    fn clone_account(&self) -> Box<dyn Account>;

    /// Check that `signers` legitimately authorize an action on this account
    fn validate(&self, signers: &[PublicHash]) -> Result<(), CoreError>;
}

impl Clone for Box<dyn Account> {
    fn clone(&self) -> Self {
        self.clone_account()
    }
}

/// An account controlled by a single key
#[derive(Debug, Clone)]
pub struct SingleKeyAccount {
    identity: Identity,
    name: String,
}

impl SingleKeyAccount {
    pub fn new(identity: Identity, name: impl Into<String>) -> Self {
        let name = name.into();
        let name = if name.is_empty() {
            identity.address.to_hex()
        } else {
            name
        };
        SingleKeyAccount { identity, name }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl Account for SingleKeyAccount {
    fn address(&self) -> Address {
        self.identity.address
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn clone_account(&self) -> Box<dyn Account> {
        Box::new(self.clone())
    }

    fn validate(&self, signers: &[PublicHash]) -> Result<(), CoreError> {
        let key_hash = self.identity.public_key.public_hash();
        if signers.iter().any(|s| *s == key_hash) {
            Ok(())
        } else {
            Err(CoreError::UnauthorizedSigners(self.name.clone()))
        }
    }
}
