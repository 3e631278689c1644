use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{hash_blake3, PublicKey};
use crate::error::CoreError;

/// Length of an [`Address`] in bytes
pub const ADDRESS_LEN: usize = 20;

/// Public-key-derived account address: the first 20 bytes of the key's Blake3 hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let hash = hash_blake3(public_key.as_bytes());
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes.copy_from_slice(&hash.as_bytes()[..ADDRESS_LEN]);
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; ADDRESS_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Address(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The part a node plays in consensus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Proposes blocks in round-robin order
    Formulator,
    /// Countersigns proposals
    Observer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Formulator => write!(f, "formulator"),
            Role::Observer => write!(f, "observer"),
        }
    }
}

/// An address bound to the public key that verifies its signatures.
///
/// The address is always derived from the key, so two identities with the
/// same key are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub address: Address,
    pub public_key: PublicKey,
}

impl Identity {
    pub fn new(public_key: PublicKey) -> Self {
        Identity {
            address: Address::from_public_key(&public_key),
            public_key,
        }
    }

    /// Build an identity from a hex key, rejecting keys that are not valid ed25519 points
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let public_key = PublicKey::from_hex(s)?;
        public_key.to_verifying_key()?;
        Ok(Self::new(public_key))
    }
}

impl From<PublicKey> for Identity {
    fn from(public_key: PublicKey) -> Self {
        Identity::new(public_key)
    }
}
