//! PoF P2P - Peer transport
//!
//! Length-prefixed packet framing, keepalive-supervised peer connections,
//! the registry of live formulator/observer peers, and the authenticated
//! handshake that precedes registration.

pub mod codec;
pub mod config;
pub mod error;
pub mod handshake;
pub mod peer;
pub mod registry;

pub use codec::{define_hashed_type, Frame, Packet, KEEPALIVE_TYPE};
pub use config::PeerConfig;
pub use error::{CodecError, P2pError};
pub use handshake::handshake;
pub use peer::{Peer, PeerInfo};
pub use registry::PeerRegistry;
