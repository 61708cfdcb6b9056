//! Unreliable-channel datagram codec
//!
//! Datagrams carry high-frequency per-entity state. Loss and reordering are
//! tolerated by the "latest sequence wins" policy in the session layer, so a
//! datagram is self-contained: session id, entity id, sequence, payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{RelayError, Result};
use crate::session::SessionId;

/// Fixed datagram header: session id + entity id + sequence (u64 each)
const PACKET_HEADER_SIZE: usize = 24;

/// Maximum accepted datagram size. Larger datagrams are malformed and dropped.
pub const MAX_DATAGRAM_SIZE: usize = 8 * 1024;

/// A single unreliable entity-update datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sending session
    pub session_id: SessionId,
    /// Entity this update applies to
    pub entity_id: u64,
    /// Per-entity sequence number, strictly increasing from the sender
    pub sequence: u64,
    /// Opaque state payload
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet
    #[must_use]
    pub fn new(
        session_id: SessionId,
        entity_id: u64,
        sequence: u64,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            session_id,
            entity_id,
            sequence,
            payload: payload.into(),
        }
    }

    /// Encode into wire format
    pub fn encode(&self) -> Result<BytesMut> {
        let total = PACKET_HEADER_SIZE + self.payload.len();
        if total > MAX_DATAGRAM_SIZE {
            return Err(RelayError::malformed_packet(format!(
                "Datagram too large: {} bytes (max: {})",
                total, MAX_DATAGRAM_SIZE
            )));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u64(self.session_id);
        buf.put_u64(self.entity_id);
        buf.put_u64(self.sequence);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decode a received datagram
    ///
    /// A malformed datagram yields an error; the caller drops it and the
    /// session is unaffected.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(RelayError::malformed_packet(format!(
                "Datagram too short: {} bytes (header is {})",
                data.len(),
                PACKET_HEADER_SIZE
            )));
        }
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(RelayError::malformed_packet(format!(
                "Datagram too large: {} bytes (max: {})",
                data.len(),
                MAX_DATAGRAM_SIZE
            )));
        }

        let mut buf = data;
        let session_id = buf.get_u64();
        let entity_id = buf.get_u64();
        let sequence = buf.get_u64();
        let payload = Bytes::copy_from_slice(buf);

        Ok(Self {
            session_id,
            entity_id,
            sequence,
            payload,
        })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet[session={} entity={} seq={} {} bytes]",
            self.session_id,
            self.entity_id,
            self.sequence,
            self.payload.len()
        )
    }
}
