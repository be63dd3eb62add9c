//! weir wire format — on-wire types for the stream protocol.
//!
//! These types ARE the protocol. Every ordinal, every field is part of the
//! wire format; changing anything here is a breaking change for every peer.
//!
//! Each message travels as an 8-byte frame header followed by a serde_json
//! body. The header is #[repr(C, packed)] with zerocopy derives for
//! deterministic layout and allocation-free parsing; the body carries the
//! variable-length fields (stream names, hash runs, signatures). There is
//! no unsafe code in this module.

use std::fmt;

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::ChunkKey;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Protocol name, exchanged during the overlay handshake.
pub const PROTOCOL_NAME: &str = "stream";

/// Current wire format version. A receiver seeing an unknown version
/// rejects the frame without attempting to parse the body.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum encoded message size. Larger frames are rejected outright.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Size of a content hash on the wire. A batch of N hashes is the
/// concatenation of N * HASH_SIZE bytes.
pub const HASH_SIZE: usize = 32;

// ── Frame header ──────────────────────────────────────────────────────────────

/// Fixed prefix of every wire message.
///
/// The receiver can route a frame by ordinal and bound its body length
/// before reading a single byte of payload.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Message ordinal — see [`ordinal`].
    pub ordinal: u8,
    /// Wire format version. Currently 0x01.
    pub version: u8,
    /// Reserved, must be zero.
    pub reserved: [u8; 2],
    /// Length of the body in bytes, not including this header.
    pub length: u32,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 8]);

/// Message ordinals. Ordinals 0-4 are the stream protocol proper; 5 and 6
/// belong to the retrieve-request stream type but share the peer link.
pub mod ordinal {
    pub const HANDSHAKE: u8 = 0;
    pub const UNSYNCED_KEYS: u8 = 1;
    pub const WANTED_KEYS: u8 = 2;
    pub const TAKEOVER_PROOF: u8 = 3;
    pub const SUBSCRIBE: u8 = 4;
    pub const RETRIEVE_REQUEST: u8 = 5;
    pub const CHUNK_DELIVERY: u8 = 6;
}

// ── Statements and proofs ─────────────────────────────────────────────────────

/// Statement that the upstream peer hands over a stream section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handover {
    /// Stream type name.
    pub stream: String,
    /// Type-specific sub-selector.
    pub key: Vec<u8>,
    /// First hash index of the section.
    pub start: u64,
    /// Last hash index of the section, inclusive.
    pub end: u64,
    /// Commitment over the hash sequence — see `crypto::batch_root`.
    pub root: [u8; 32],
}

/// Signed statement that the upstream peer handed over the stream section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverProof {
    /// Sign(BLAKE3(canonical serialization of the statement)).
    pub sig: Vec<u8>,
    pub handover: Handover,
}

/// Statement that the downstream peer took over (stored all data of) a
/// handed-over section. Same shape as [`Handover`], opposite signer.
pub type Takeover = Handover;

/// Signed statement that the downstream peer took over the stream section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeoverProof {
    pub sig: Vec<u8>,
    pub takeover: Takeover,
}

impl fmt::Display for TakeoverProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream '{}' [{}-{}], root {}",
            self.takeover.stream,
            self.takeover.start,
            self.takeover.end,
            hex::encode(self.takeover.root),
        )
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Overlay handshake. Opaque to the streaming core — the dispatcher logs
/// it and moves on; negotiation belongs to the link layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMsg {
    pub version: u32,
    pub network_id: u64,
}

/// Request for a stream (section): subscribe to `stream`/`key` from index
/// `from` to `to`, replies delivered at `priority`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeMsg {
    pub stream: String,
    pub key: Vec<u8>,
    pub from: u64,
    pub to: u64,
    pub priority: u8,
}

/// Offer to hand over a stream section: `hashes` is the concatenation of
/// the section's content hashes, HASH_SIZE bytes each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsyncedKeysMsg {
    pub stream: String,
    pub key: Vec<u8>,
    pub from: u64,
    pub to: u64,
    pub hashes: Vec<u8>,
    pub handover: Option<HandoverProof>,
}

impl fmt::Display for UnsyncedKeysMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream '{}' [{}-{}] ({})",
            self.stream,
            self.from,
            self.to,
            self.hashes.len() / HASH_SIZE
        )
    }
}

/// Which hashes of the last offered batch the downstream peer actually
/// wants sent over, plus the next section to offer. `to == 0` means
/// open-ended: keep offering as new hashes appear (live).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WantedKeysMsg {
    pub stream: String,
    pub key: Vec<u8>,
    /// Bitvector over the offered batch, LSB-first within each byte.
    pub want: Vec<u8>,
    pub from: u64,
    pub to: u64,
}

impl fmt::Display for WantedKeysMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream '{}', want {}, next [{}-{}]",
            self.stream,
            hex::encode(&self.want),
            self.from,
            self.to
        )
    }
}

/// Chunk retrieve request — internal to the retrieve-request stream type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveRequestMsg {
    pub key: ChunkKey,
}

/// Chunk payload delivery — internal to the retrieve-request stream type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDeliveryMsg {
    pub key: ChunkKey,
    pub data: Vec<u8>,
    /// Optional retrieve request id. 0 when unused.
    #[serde(default)]
    pub id: u64,
}

/// A decoded wire message, routed by ordinal.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(HandshakeMsg),
    UnsyncedKeys(UnsyncedKeysMsg),
    WantedKeys(WantedKeysMsg),
    TakeoverProof(TakeoverProof),
    Subscribe(SubscribeMsg),
    RetrieveRequest(RetrieveRequestMsg),
    ChunkDelivery(ChunkDeliveryMsg),
}

impl Message {
    pub fn ordinal(&self) -> u8 {
        match self {
            Message::Handshake(_) => ordinal::HANDSHAKE,
            Message::UnsyncedKeys(_) => ordinal::UNSYNCED_KEYS,
            Message::WantedKeys(_) => ordinal::WANTED_KEYS,
            Message::TakeoverProof(_) => ordinal::TAKEOVER_PROOF,
            Message::Subscribe(_) => ordinal::SUBSCRIBE,
            Message::RetrieveRequest(_) => ordinal::RETRIEVE_REQUEST,
            Message::ChunkDelivery(_) => ordinal::CHUNK_DELIVERY,
        }
    }
}

// ── Encode / decode ───────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("frame shorter than header")]
    TooShort,

    #[error("unknown wire version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown message ordinal: 0x{0:02x}")]
    UnknownOrdinal(u8),

    #[error("declared body length {declared} but {actual} bytes present")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("message of {0} bytes exceeds maximum {}", MAX_MESSAGE_SIZE)]
    Oversize(usize),

    #[error("malformed message body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Encode a message into a single wire frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>, WireError> {
    let body = match msg {
        Message::Handshake(m) => serde_json::to_vec(m)?,
        Message::UnsyncedKeys(m) => serde_json::to_vec(m)?,
        Message::WantedKeys(m) => serde_json::to_vec(m)?,
        Message::TakeoverProof(m) => serde_json::to_vec(m)?,
        Message::Subscribe(m) => serde_json::to_vec(m)?,
        Message::RetrieveRequest(m) => serde_json::to_vec(m)?,
        Message::ChunkDelivery(m) => serde_json::to_vec(m)?,
    };
    let total = std::mem::size_of::<FrameHeader>() + body.len();
    if total > MAX_MESSAGE_SIZE {
        return Err(WireError::Oversize(total));
    }
    let header = FrameHeader {
        ordinal: msg.ordinal(),
        version: PROTOCOL_VERSION,
        reserved: [0; 2],
        length: body.len() as u32,
    };
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a single wire frame.
pub fn decode(buf: &[u8]) -> Result<Message, WireError> {
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::Oversize(buf.len()));
    }
    let header_len = std::mem::size_of::<FrameHeader>();
    let header = FrameHeader::read_from_prefix(buf).ok_or(WireError::TooShort)?;
    if header.version != PROTOCOL_VERSION {
        return Err(WireError::UnknownVersion(header.version));
    }
    let declared = header.length as usize;
    let body = &buf[header_len..];
    if declared != body.len() {
        return Err(WireError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    let msg = match header.ordinal {
        ordinal::HANDSHAKE => Message::Handshake(serde_json::from_slice(body)?),
        ordinal::UNSYNCED_KEYS => Message::UnsyncedKeys(serde_json::from_slice(body)?),
        ordinal::WANTED_KEYS => Message::WantedKeys(serde_json::from_slice(body)?),
        ordinal::TAKEOVER_PROOF => Message::TakeoverProof(serde_json::from_slice(body)?),
        ordinal::SUBSCRIBE => Message::Subscribe(serde_json::from_slice(body)?),
        ordinal::RETRIEVE_REQUEST => Message::RetrieveRequest(serde_json::from_slice(body)?),
        ordinal::CHUNK_DELIVERY => Message::ChunkDelivery(serde_json::from_slice(body)?),
        other => return Err(WireError::UnknownOrdinal(other)),
    };
    Ok(msg)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, Keypair};

    fn roundtrip(msg: Message) {
        let frame = encode(&msg).unwrap();
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn frame_header_layout() {
        let header = FrameHeader {
            ordinal: ordinal::WANTED_KEYS,
            version: PROTOCOL_VERSION,
            reserved: [0; 2],
            length: 1024,
        };
        let bytes = header.as_bytes();
        assert_eq!(bytes.len(), 8);

        let recovered = FrameHeader::read_from(bytes).unwrap();
        // Copy packed fields to locals to avoid unaligned reference UB
        let ordinal = recovered.ordinal;
        let version = recovered.version;
        let length = recovered.length;
        assert_eq!(ordinal, ordinal::WANTED_KEYS);
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(length, 1024);
    }

    #[test]
    fn handshake_roundtrip() {
        roundtrip(Message::Handshake(HandshakeMsg {
            version: 1,
            network_id: 3,
        }));
    }

    #[test]
    fn subscribe_roundtrip() {
        roundtrip(Message::Subscribe(SubscribeMsg {
            stream: "SYNC".into(),
            key: vec![0x06],
            from: 0,
            to: 1000,
            priority: 1,
        }));
    }

    #[test]
    fn unsynced_keys_roundtrip() {
        let hashes: Vec<u8> = (0..3 * HASH_SIZE as u32).map(|b| b as u8).collect();
        let kp = Keypair::generate();
        let handover = Handover {
            stream: "SYNC".into(),
            key: vec![],
            start: 10,
            end: 12,
            root: crypto::batch_root(&hashes),
        };
        roundtrip(Message::UnsyncedKeys(UnsyncedKeysMsg {
            stream: "SYNC".into(),
            key: vec![],
            from: 10,
            to: 12,
            hashes,
            handover: Some(kp.sign_handover(&handover)),
        }));
    }

    #[test]
    fn wanted_keys_roundtrip() {
        roundtrip(Message::WantedKeys(WantedKeysMsg {
            stream: "SYNC".into(),
            key: vec![],
            want: vec![0b101],
            from: 13,
            to: 0,
        }));
    }

    #[test]
    fn takeover_proof_roundtrip() {
        let kp = Keypair::generate();
        let takeover = Takeover {
            stream: "SYNC".into(),
            key: vec![],
            start: 10,
            end: 12,
            root: [0x42; 32],
        };
        roundtrip(Message::TakeoverProof(kp.sign_takeover(&takeover)));
    }

    #[test]
    fn retrieve_messages_roundtrip() {
        let key = ChunkKey::for_data(b"abc");
        roundtrip(Message::RetrieveRequest(RetrieveRequestMsg { key }));
        roundtrip(Message::ChunkDelivery(ChunkDeliveryMsg {
            key,
            data: b"abc".to_vec(),
            id: 7,
        }));
    }

    #[test]
    fn decode_rejects_short_frame() {
        assert!(matches!(decode(&[0u8; 3]), Err(WireError::TooShort)));
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let mut frame = encode(&Message::Handshake(HandshakeMsg {
            version: 1,
            network_id: 0,
        }))
        .unwrap();
        frame[1] = 0x7f;
        assert!(matches!(decode(&frame), Err(WireError::UnknownVersion(0x7f))));
    }

    #[test]
    fn decode_rejects_unknown_ordinal() {
        let mut frame = encode(&Message::Handshake(HandshakeMsg {
            version: 1,
            network_id: 0,
        }))
        .unwrap();
        frame[0] = 0x63;
        assert!(matches!(decode(&frame), Err(WireError::UnknownOrdinal(0x63))));
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut frame = encode(&Message::Handshake(HandshakeMsg {
            version: 1,
            network_id: 0,
        }))
        .unwrap();
        frame.push(0);
        assert!(matches!(decode(&frame), Err(WireError::LengthMismatch { .. })));
    }

    #[test]
    fn encode_rejects_oversize() {
        let msg = Message::ChunkDelivery(ChunkDeliveryMsg {
            key: ChunkKey([0; 32]),
            data: vec![0u8; MAX_MESSAGE_SIZE],
            id: 0,
        });
        assert!(matches!(encode(&msg), Err(WireError::Oversize(_))));
    }

    #[test]
    fn chunk_delivery_id_defaults_to_zero() {
        // older peers omit the id field entirely
        let body = serde_json::json!({
            "key": ChunkKey([7u8; 32]),
            "data": [1, 2, 3],
        });
        let msg: ChunkDeliveryMsg = serde_json::from_value(body).unwrap();
        assert_eq!(msg.id, 0);
    }
}
