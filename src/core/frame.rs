//! Reliable-channel framing and control messages
//!
//! The reliable channel is a length-prefixed byte stream: a 4-byte big-endian
//! length header followed by a JSON-encoded [`ControlMessage`]. A frame is
//! never yielded until all its bytes have arrived; partial frames persist in
//! the connection's read buffer across reads.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RelayError, Result};

/// Protocol version declared in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (1MB). A larger length prefix is a protocol violation
/// and the connection is forcibly closed.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Resource content is streamed back in chunks of this size (pre-encoding)
pub const RESOURCE_CHUNK_SIZE: usize = 64 * 1024;

/// Frame header size (4 bytes length)
const HEADER_SIZE: usize = 4;

/// Coded reason sent best-effort with warnings and forced disconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Sustained packet-rate abuse (two-strike escalation)
    PacketFlood,
    /// Framing or message-level protocol violation
    ProtocolViolation,
    /// Handshake declared an unsupported protocol version
    VersionMismatch,
    /// Backend-issued revocation directive
    Revoked,
    /// Server is shutting down
    ServerShutdown,
    /// Client asked to leave
    ByeBye,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PacketFlood => "packet_flood",
            Self::ProtocolViolation => "protocol_violation",
            Self::VersionMismatch => "version_mismatch",
            Self::Revoked => "revoked",
            Self::ServerShutdown => "server_shutdown",
            Self::ByeBye => "bye_bye",
        };
        write!(f, "{}", s)
    }
}

/// Control message carried on the reliable channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First message a client must send: protocol version and identity
    Hello {
        version: u32,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Handshake acknowledgement with the assigned session id
    Welcome { session_id: u64 },
    /// Keep-alive probe
    Ping,
    /// Keep-alive reply
    Pong,
    /// Non-fatal coded warning (e.g. first flood strike)
    Warning { reason: CloseReason, message: String },
    /// Coded close reason, sent best-effort before the connection drops
    Disconnect { reason: CloseReason },
    /// Request content by hash
    ResourceRequest { hash: String },
    /// One chunk of requested content, base64-encoded
    ResourceChunk {
        hash: String,
        offset: u64,
        data: String,
        last: bool,
    },
    /// Requested hash is not known to the content store
    ResourceMissing { hash: String },
    /// Client is leaving voluntarily
    Goodbye,
}

impl ControlMessage {
    /// Build a resource chunk from raw bytes
    pub fn resource_chunk(hash: &str, offset: u64, data: &[u8], last: bool) -> Self {
        Self::ResourceChunk {
            hash: hash.to_string(),
            offset,
            data: BASE64.encode(data),
            last,
        }
    }

    /// Decode the base64 payload of a `ResourceChunk`
    pub fn chunk_data(&self) -> Result<Vec<u8>> {
        match self {
            Self::ResourceChunk { data, .. } => BASE64
                .decode(data)
                .map_err(|e| RelayError::serialization(format!("Invalid chunk encoding: {}", e))),
            _ => Err(RelayError::invalid_state("Not a resource chunk")),
        }
    }
}

/// A single reliable-channel frame (opaque payload bytes)
#[derive(Debug, Clone)]
pub struct Frame {
    data: Bytes,
}

impl Frame {
    /// Create a frame from payload bytes
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Serialize a control message into a frame
    pub fn from_control(msg: &ControlMessage) -> Result<Self> {
        let json = serde_json::to_vec(msg)
            .map_err(|e| RelayError::serialization(format!("Control encoding failed: {}", e)))?;
        Ok(Self::new(json))
    }

    /// Deserialize the frame payload as a control message
    pub fn to_control(&self) -> Result<ControlMessage> {
        serde_json::from_slice(&self.data)
            .map_err(|e| RelayError::serialization(format!("Control decoding failed: {}", e)))
    }

    /// Get the frame payload
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Payload size in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Encode into wire format (length-prefixed)
    pub fn encode(&self) -> Result<BytesMut> {
        let len = self.data.len();
        if len > MAX_FRAME_SIZE {
            return Err(RelayError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + len);
        buf.put_u32(len as u32);
        buf.put_slice(&self.data);
        Ok(buf)
    }

    /// Decode a frame from the stream buffer
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete frame.
    /// A length prefix beyond [`MAX_FRAME_SIZE`] is a protocol violation; the
    /// caller must close the connection.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; HEADER_SIZE];
        length_bytes.copy_from_slice(&buf[..HEADER_SIZE]);
        let len = u32::from_be_bytes(length_bytes) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(RelayError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        if buf.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        let data = buf.split_to(len).freeze();

        Ok(Some(Self { data }))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame[{} bytes]", self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = Frame::new("test payload");
        let encoded = original.encode().unwrap();

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();

        assert_eq!(original.data(), decoded.data());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_persists() {
        let frame = Frame::new("hello");
        let encoded = frame.encode().unwrap();

        // Only part of the frame has arrived
        let mut buf = BytesMut::from(&encoded[..3]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        // Nothing consumed while incomplete
        assert_eq!(buf.len(), 3);

        // Remainder arrives
        buf.extend_from_slice(&encoded[3..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.data().as_ref(), b"hello");
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(b"junk");

        let err = Frame::decode(&mut buf).unwrap_err();
        assert!(matches!(err, RelayError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let a = Frame::new("first").encode().unwrap();
        let b = Frame::new("second").encode().unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.data().as_ref(), b"first");
        assert_eq!(second.data().as_ref(), b"second");
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_control_roundtrip() {
        let hello = ControlMessage::Hello {
            version: PROTOCOL_VERSION,
            name: "Alice".to_string(),
            token: None,
        };

        let frame = Frame::from_control(&hello).unwrap();
        let decoded = frame.to_control().unwrap();
        assert_eq!(hello, decoded);
    }

    #[test]
    fn test_resource_chunk_data() {
        let payload = vec![0u8, 1, 2, 254, 255];
        let msg = ControlMessage::resource_chunk("abc123", 0, &payload, true);
        assert_eq!(msg.chunk_data().unwrap(), payload);
    }

    #[test]
    fn test_chunk_data_wrong_variant() {
        assert!(ControlMessage::Ping.chunk_data().is_err());
    }

    #[test]
    fn test_garbage_control_payload() {
        let frame = Frame::new("not json at all");
        assert!(frame.to_control().is_err());
    }
}
