//! The framed-datagram message codec.
//!
//! ## Wire format
//!
//! ```text
//! Header (17 bytes, big-endian):
//!   type      u8
//!   sequence  u32
//!   timestamp u64   # microseconds since Unix epoch
//!   length    u32   # payload bytes to follow
//! Payload: `length` bytes
//! ```
//!
//! The codec is stateless: `encode` is infallible, `decode` returns `None` on
//! any malformed input. Sequence numbers are opaque here; uniqueness is the
//! caller's concern.

use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the fixed header, in bytes.
pub const HEADER_SIZE: usize = 17;

/// Message type tags, per the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Heartbeat,
    Task,
    Result,
    Chunk,
    Health,
    Error,
}

impl MessageType {
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            MessageType::Heartbeat => 0x01,
            MessageType::Task => 0x02,
            MessageType::Result => 0x03,
            MessageType::Chunk => 0x04,
            MessageType::Health => 0x05,
            MessageType::Error => 0xFF,
        }
    }

    #[must_use]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(MessageType::Heartbeat),
            0x02 => Some(MessageType::Task),
            0x03 => Some(MessageType::Result),
            0x04 => Some(MessageType::Chunk),
            0x05 => Some(MessageType::Health),
            0xFF => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// A decoded datagram: fixed header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub sequence: u32,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl Message {
    #[must_use]
    pub fn new(msg_type: MessageType, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            sequence,
            timestamp: current_timestamp_micros(),
            payload,
        }
    }
}

/// Wall-clock time, in microseconds since the Unix epoch.
#[must_use]
pub fn current_timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Serialize a message to its wire representation. Deterministic: header
/// first, then payload bytes verbatim.
#[must_use]
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + msg.payload.len());
    out.push(msg.msg_type.to_u8());
    out.extend_from_slice(&msg.sequence.to_be_bytes());
    out.extend_from_slice(&msg.timestamp.to_be_bytes());
    out.extend_from_slice(&(msg.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&msg.payload);
    out
}

/// Parse a datagram into a [`Message`]. Returns `None` on a buffer shorter
/// than the header, an unrecognised type byte, or a declared length that
/// would read past the end of `data` — malformed datagrams are always
/// discarded silently rather than erroring.
#[must_use]
pub fn decode(data: &[u8]) -> Option<Message> {
    if data.len() < HEADER_SIZE {
        return None;
    }
    let msg_type = MessageType::from_u8(data[0])?;
    let sequence = u32::from_be_bytes(data[1..5].try_into().ok()?);
    let timestamp = u64::from_be_bytes(data[5..13].try_into().ok()?);
    let length = u32::from_be_bytes(data[13..17].try_into().ok()?) as usize;
    let end = HEADER_SIZE.checked_add(length)?;
    if data.len() < end {
        return None;
    }
    let payload = data[HEADER_SIZE..end].to_vec();
    Some(Message {
        msg_type,
        sequence,
        timestamp,
        payload,
    })
}

/// A decoded `CHUNK` payload: `{total_chunks, index, checksum, data}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    pub total_chunks: u32,
    pub index: u32,
    pub checksum: u32,
    pub data: Vec<u8>,
}

/// Encode a `CHUNK` message's payload: `total_chunks u32, index u32,
/// checksum u32, data`, all big-endian.
#[must_use]
pub fn encode_chunk_payload(total_chunks: u32, index: u32, checksum: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + data.len());
    out.extend_from_slice(&total_chunks.to_be_bytes());
    out.extend_from_slice(&index.to_be_bytes());
    out.extend_from_slice(&checksum.to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Decode a `CHUNK` message's payload. Returns `None` if the payload is
/// shorter than the fixed 12-byte chunk sub-header.
#[must_use]
pub fn decode_chunk_payload(payload: &[u8]) -> Option<ChunkPayload> {
    if payload.len() < 12 {
        return None;
    }
    let total_chunks = u32::from_be_bytes(payload[0..4].try_into().ok()?);
    let index = u32::from_be_bytes(payload[4..8].try_into().ok()?);
    let checksum = u32::from_be_bytes(payload[8..12].try_into().ok()?);
    let data = payload[12..].to_vec();
    Some(ChunkPayload {
        total_chunks,
        index,
        checksum,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let msg = Message::new(MessageType::Task, 42, b"hello".to_vec());
        let bytes = encode(&msg);
        assert_eq!(decode(&bytes), Some(msg));
    }

    #[test]
    fn empty_payload_round_trips() {
        let msg = Message::new(MessageType::Heartbeat, 1, Vec::new());
        let bytes = encode(&msg);
        assert_eq!(decode(&bytes), Some(msg));
    }

    #[test]
    fn short_buffer_is_discarded() {
        assert_eq!(decode(&[0x02, 0, 0, 0, 1]), None);
    }

    #[test]
    fn truncated_payload_is_discarded() {
        let msg = Message::new(MessageType::Task, 1, b"0123456789".to_vec());
        let mut bytes = encode(&msg);
        bytes.truncate(bytes.len() - 3);
        assert_eq!(decode(&bytes), None);
    }

    #[test]
    fn unknown_type_is_discarded() {
        let mut bytes = vec![0x00u8];
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&0u64.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        assert_eq!(decode(&bytes), None);
    }

    #[test]
    fn length_overflow_does_not_panic() {
        let mut bytes = vec![0x02u8];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&0u64.to_be_bytes());
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        assert_eq!(decode(&bytes), None);
    }

    #[test]
    fn chunk_payload_round_trips() {
        let encoded = encode_chunk_payload(4, 2, 0xDEAD_BEEF, b"some bytes");
        let decoded = decode_chunk_payload(&encoded).expect("decodes");
        assert_eq!(decoded.total_chunks, 4);
        assert_eq!(decoded.index, 2);
        assert_eq!(decoded.checksum, 0xDEAD_BEEF);
        assert_eq!(decoded.data, b"some bytes");
    }

    #[test]
    fn short_chunk_payload_is_rejected() {
        assert_eq!(decode_chunk_payload(&[0, 0, 0]), None);
    }

    proptest::proptest! {
        #[test]
        fn prop_round_trip(seq: u32, payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256)) {
            let msg = Message::new(MessageType::Result, seq, payload);
            let bytes = encode(&msg);
            proptest::prop_assert_eq!(decode(&bytes), Some(msg));
        }
    }
}
