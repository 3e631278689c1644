//! Length-prefixed packet framing.
//!
//! # Wire Format
//!
//! ```text
//! [type: u16 LE][length: u32 LE][payload: length bytes]
//! [KEEPALIVE_TYPE: u16 LE]
//! ```
//!
//! Keepalive packets are the bare type code. Readers must not consume a
//! length after it.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CodecError;

/// Size of the type code on the wire
pub const TYPE_LEN: usize = 2;

/// Size of a full header (type + length)
pub const HEADER_LEN: usize = TYPE_LEN + 4;

/// Derive a stable 16-bit packet type from a message name.
///
/// FNV-1a over the name, folded to 16 bits.
pub const fn define_hashed_type(name: &str) -> u16 {
    let bytes = name.as_bytes();
    let mut hash: u32 = 0x811c_9dc5;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        i += 1;
    }
    ((hash >> 16) ^ (hash & 0xffff)) as u16
}

/// Reserved type code of keepalive packets
pub const KEEPALIVE_TYPE: u16 = define_hashed_type("p2p.PingMessage");

/// A decoded non-keepalive packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_type: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(packet_type: u16, payload: Vec<u8>) -> Self {
        Frame {
            packet_type,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode(self.packet_type, &self.payload)
    }
}

/// One unit read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Keepalive,
    Frame(Frame),
}

/// Encode a typed payload as `[type][length][payload]`
pub fn encode(packet_type: u16, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    if packet_type == KEEPALIVE_TYPE {
        return Err(CodecError::ReservedType(packet_type));
    }
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::PayloadTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&packet_type.to_le_bytes());
    bytes.extend_from_slice(&len.to_le_bytes());
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

pub fn encode_keepalive() -> [u8; TYPE_LEN] {
    KEEPALIVE_TYPE.to_le_bytes()
}

/// Read exactly one packet, keepalive or framed
pub async fn read_packet<R>(reader: &mut R, max_payload_len: usize) -> Result<Packet, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let packet_type = reader.read_u16_le().await?;
    if packet_type == KEEPALIVE_TYPE {
        return Ok(Packet::Keepalive);
    }

    let len = reader.read_u32_le().await? as usize;
    if len > max_payload_len {
        return Err(CodecError::PayloadTooLarge {
            len,
            max: max_payload_len,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Packet::Frame(Frame::new(packet_type, payload)))
}

/// Read the next framed packet, skipping any keepalives before it
pub async fn decode<R>(reader: &mut R, max_payload_len: usize) -> Result<Frame, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Packet::Frame(frame) = read_packet(reader, max_payload_len).await? {
            return Ok(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024 * 1024;
    const PROPOSAL_TYPE: u16 = define_hashed_type("test.Proposal");

    #[test]
    fn test_header_layout() {
        let bytes = encode(0x0102, b"abc").unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 3);
        assert_eq!(&bytes[..2], &[0x02, 0x01]);
        assert_eq!(&bytes[2..6], &[3, 0, 0, 0]);
        assert_eq!(&bytes[6..], b"abc");
    }

    #[test]
    fn test_keepalive_type_is_reserved() {
        assert!(matches!(
            encode(KEEPALIVE_TYPE, b""),
            Err(CodecError::ReservedType(_))
        ));
        assert_eq!(encode_keepalive().len(), TYPE_LEN);
    }

    #[test]
    fn test_hashed_types_are_stable_and_distinct() {
        assert_eq!(
            define_hashed_type("p2p.PingMessage"),
            define_hashed_type("p2p.PingMessage")
        );
        assert_ne!(KEEPALIVE_TYPE, PROPOSAL_TYPE);
    }

    #[tokio::test]
    async fn test_roundtrip_various_lengths() {
        for len in [0usize, 1, 255, 70_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let bytes = encode(PROPOSAL_TYPE, &payload).unwrap();

            let mut reader = &bytes[..];
            let frame = decode(&mut reader, MAX).await.unwrap();
            assert_eq!(frame.packet_type, PROPOSAL_TYPE);
            assert_eq!(frame.payload, payload);
            assert!(reader.is_empty());
        }
    }

    #[tokio::test]
    async fn test_zero_length_payload_is_not_keepalive() {
        let bytes = encode(PROPOSAL_TYPE, &[]).unwrap();
        let mut reader = &bytes[..];
        let packet = read_packet(&mut reader, MAX).await.unwrap();
        assert_eq!(packet, Packet::Frame(Frame::new(PROPOSAL_TYPE, vec![])));
    }

    #[tokio::test]
    async fn test_decode_skips_keepalives() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode_keepalive());
        bytes.extend_from_slice(&encode_keepalive());
        bytes.extend(encode(PROPOSAL_TYPE, b"vote").unwrap());
        bytes.extend_from_slice(&encode_keepalive());

        let mut reader = &bytes[..];
        assert_eq!(read_packet(&mut reader, MAX).await.unwrap(), Packet::Keepalive);

        let frame = decode(&mut reader, MAX).await.unwrap();
        assert_eq!(frame.payload, b"vote");
        assert_eq!(read_packet(&mut reader, MAX).await.unwrap(), Packet::Keepalive);
        assert!(decode(&mut reader, MAX).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_payload_fails() {
        let bytes = encode(PROPOSAL_TYPE, b"0123456789").unwrap();
        let mut reader = &bytes[..bytes.len() - 3];
        assert!(matches!(
            decode(&mut reader, MAX).await,
            Err(CodecError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_header_rejected() {
        let bytes = encode(PROPOSAL_TYPE, &[0u8; 64]).unwrap();
        let mut reader = &bytes[..];
        assert!(matches!(
            decode(&mut reader, 16).await,
            Err(CodecError::PayloadTooLarge { len: 64, max: 16 })
        ));
    }
}
