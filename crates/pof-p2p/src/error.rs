use pof_core::CoreError;
use thiserror::Error;

/// Failures while reading or writing packets
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Packet type {0:#06x} is reserved for keepalive")]
    ReservedType(u16),

    #[error("Payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Unexpected packet type {0:#06x}")]
    UnexpectedType(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum P2pError {
    #[error("exist address")]
    ExistAddress,

    #[error("not exist observer peer")]
    NotExistObserverPeer,

    #[error("not exist formulator peer")]
    NotExistFormulatorPeer,

    #[error("Peer is closed")]
    Closed,

    #[error("Write deadline exceeded")]
    WriteTimeout,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}
