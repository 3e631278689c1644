//! Consensus messages on top of the packet codec.
//!
//! The packet type selects the message kind; the payload is the bincode
//! encoding of that message.

use pof_core::{serialize, ConsensusMessage, CoreError};
use pof_p2p::{define_hashed_type, CodecError, Frame};
use thiserror::Error;

pub const PROPOSAL_TYPE: u16 = define_hashed_type("pof.Proposal");
pub const VOTE_TYPE: u16 = define_hashed_type("pof.Vote");
pub const ROUND_ADVANCE_TYPE: u16 = define_hashed_type("pof.RoundAdvance");
pub const COMMIT_TYPE: u16 = define_hashed_type("pof.Commit");

#[derive(Debug, Error)]
pub enum WireError {
    #[error("Unknown packet type {0:#06x}")]
    UnknownType(u16),

    #[error("Malformed payload: {0}")]
    Payload(#[from] CoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub fn encode_message(message: &ConsensusMessage) -> Result<Vec<u8>, WireError> {
    let (packet_type, payload) = match message {
        ConsensusMessage::Proposal(p) => (PROPOSAL_TYPE, serialize::to_bytes(p)?),
        ConsensusMessage::Vote(v) => (VOTE_TYPE, serialize::to_bytes(v)?),
        ConsensusMessage::RoundAdvance(r) => (ROUND_ADVANCE_TYPE, serialize::to_bytes(r)?),
        ConsensusMessage::Commit(c) => (COMMIT_TYPE, serialize::to_bytes(c)?),
    };
    Ok(Frame::new(packet_type, payload).to_bytes()?)
}

pub fn decode_message(frame: &Frame) -> Result<ConsensusMessage, WireError> {
    let payload = &frame.payload;
    let message = match frame.packet_type {
        PROPOSAL_TYPE => ConsensusMessage::Proposal(serialize::from_bytes(payload)?),
        VOTE_TYPE => ConsensusMessage::Vote(serialize::from_bytes(payload)?),
        ROUND_ADVANCE_TYPE => ConsensusMessage::RoundAdvance(serialize::from_bytes(payload)?),
        COMMIT_TYPE => ConsensusMessage::Commit(serialize::from_bytes(payload)?),
        other => return Err(WireError::UnknownType(other)),
    };
    Ok(message)
}
