//! Message codec: the length-prefixed frame exchanged between hubs.
//!
//! Wire layout:
//!
//! ```text
//! [1 byte type][4 byte big-endian body length][body]
//! ```
//!
//! Type `0` is a Payload frame whose body is opaque application bytes. Type
//! `1` is a Control frame whose body is a peer list, a sequence of
//!
//! ```text
//! [u8 key length][key bytes][u16 BE address length][UTF-8 address bytes]
//! ```
//!
//! The first entry of every Control frame is the sender itself. A Control
//! frame is used for the connection hello, heartbeats and gossip.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::identity::PeerId;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 5;

/// Frame type tag carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Payload = 0,
    Control = 1,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Payload),
            1 => Some(Self::Control),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One `(public key, address)` pair in a Control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub address: String,
}

impl PeerEntry {
    pub fn new(peer_id: PeerId, address: impl Into<String>) -> Self {
        Self {
            peer_id,
            address: address.into(),
        }
    }

    fn encoded_len(&self) -> usize {
        1 + self.peer_id.as_bytes().len() + 2 + self.address.len()
    }
}

/// A decoded unit of wire transmission. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opaque application bytes. An empty body is a valid, explicit payload.
    Payload(Bytes),
    /// Peer-list exchange; the first entry is the sender.
    Control(Vec<PeerEntry>),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Payload(_) => FrameType::Payload,
            Self::Control(_) => FrameType::Control,
        }
    }

    /// Build a Control frame from `entries`, keeping as many as fit in a body
    /// of `max_body_len` bytes. Entries whose address does not fit the u16
    /// length field are skipped.
    pub fn control_within(entries: impl IntoIterator<Item = PeerEntry>, max_body_len: usize) -> Self {
        let mut kept = Vec::new();
        let mut size = 0usize;
        for entry in entries {
            if entry.address.len() > u16::MAX as usize {
                continue;
            }
            let len = entry.encoded_len();
            if size + len > max_body_len {
                break;
            }
            size += len;
            kept.push(entry);
        }
        Self::Control(kept)
    }

    /// Length of the body this frame encodes to.
    pub fn body_len(&self) -> usize {
        match self {
            Self::Payload(body) => body.len(),
            Self::Control(entries) => entries.iter().map(PeerEntry::encoded_len).sum(),
        }
    }
}

/// Why a frame could not be encoded or decoded.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Declared or actual body length exceeds the configured maximum.
    #[error("frame body of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    /// The stream closed before the declared length was read.
    #[error("stream closed mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("malformed control body: {0}")]
    BadControlBody(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// `tokio_util` codec for [`Frame`]s with a body-size ceiling.
#[derive(Debug, Clone, Copy)]
pub struct HubCodec {
    max_frame_len: usize,
}

impl HubCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Decoder for HubCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = FrameType::from_byte(src[0]).ok_or(CodecError::UnknownFrameType(src[0]))?;
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        if src.len() < HEADER_LEN + len {
            // Nothing is handed out until the whole body is buffered.
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len).freeze();
        let frame = match kind {
            FrameType::Payload => Frame::Payload(body),
            FrameType::Control => Frame::Control(decode_peer_list(body)?),
        };
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::Truncated {
                buffered: buf.len(),
            }),
        }
    }
}

impl Encoder<Frame> for HubCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = frame.body_len();
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        // Reject before writing anything: a failed encode leaves `dst` as it was.
        if let Frame::Control(entries) = &frame {
            if let Some(entry) = entries.iter().find(|e| e.address.len() > u16::MAX as usize) {
                return Err(CodecError::BadControlBody(format!(
                    "address of {} bytes",
                    entry.address.len()
                )));
            }
        }

        dst.reserve(HEADER_LEN + len);
        dst.put_u8(frame.frame_type().as_byte());
        dst.put_u32(len as u32);
        match frame {
            Frame::Payload(body) => dst.extend_from_slice(&body),
            Frame::Control(entries) => {
                for entry in &entries {
                    encode_entry(entry, dst);
                }
            }
        }
        Ok(())
    }
}

/// Addresses must already be checked against `u16::MAX`.
fn encode_entry(entry: &PeerEntry, dst: &mut BytesMut) {
    let key = entry.peer_id.as_bytes();
    let addr = entry.address.as_bytes();
    // PeerId guarantees 1..=255 bytes.
    dst.put_u8(key.len() as u8);
    dst.extend_from_slice(key);
    dst.put_u16(addr.len() as u16);
    dst.extend_from_slice(addr);
}

fn decode_peer_list(mut body: Bytes) -> Result<Vec<PeerEntry>, CodecError> {
    let mut entries = Vec::new();
    while body.has_remaining() {
        let key_len = body.get_u8() as usize;
        if key_len == 0 {
            return Err(CodecError::BadControlBody("empty public key".into()));
        }
        if body.remaining() < key_len + 2 {
            return Err(CodecError::BadControlBody("truncated entry".into()));
        }
        let key = body.split_to(key_len);
        let addr_len = body.get_u16() as usize;
        if body.remaining() < addr_len {
            return Err(CodecError::BadControlBody("truncated address".into()));
        }
        let addr = body.split_to(addr_len);
        let address = String::from_utf8(addr.to_vec())
            .map_err(|e| CodecError::BadControlBody(format!("address not UTF-8: {e}")))?;
        let peer_id = PeerId::from_bytes(key.to_vec())
            .map_err(|e| CodecError::BadControlBody(e.to_string()))?;
        entries.push(PeerEntry { peer_id, address });
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
