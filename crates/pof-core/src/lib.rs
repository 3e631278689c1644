//! PoF Core - Identities, cryptography, and consensus message types
//!
//! This crate provides the foundational types shared by the transport and
//! consensus crates of the Proof-of-Formulation node.

pub mod crypto;
pub mod error;
pub mod serialize;
pub mod types;

pub use crypto::{hash_blake3, sign, verify, Hash, KeyPair, PublicHash, PublicKey, SecretKey, Sig};
pub use error::CoreError;
pub use types::*;
