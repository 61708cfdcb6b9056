//! Error types for the relay core

use std::io;
use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay core errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Handshake failed (bad or missing identity), no session created
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Client declared an unsupported protocol version
    #[error("Protocol version mismatch: expected {expected}, got {got}")]
    ProtocolVersion { expected: u32, got: u32 },

    /// Malformed unreliable datagram (dropped, session unaffected)
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Reliable frame exceeded the maximum size (protocol violation)
    #[error("Frame too large: {size} bytes (max: {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid state error
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Address parse error
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Backend registry unreachable (retried with backoff, never fatal)
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Shutdown action registered after shutdown began (programming error)
    #[error("Late registration: {0}")]
    LateRegistration(String),

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(String),
}

impl RelayError {
    /// Create a handshake error
    pub fn handshake<S: Into<String>>(msg: S) -> Self {
        Self::Handshake(msg.into())
    }

    /// Create a malformed packet error
    pub fn malformed_packet<S: Into<String>>(msg: S) -> Self {
        Self::MalformedPacket(msg.into())
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an invalid address error
    pub fn invalid_address<S: Into<String>>(msg: S) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create a backend unavailable error
    pub fn backend_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Create a late registration error
    pub fn late_registration<S: Into<String>>(msg: S) -> Self {
        Self::LateRegistration(msg.into())
    }

    /// Create a channel error
    pub fn channel<S: Into<String>>(msg: S) -> Self {
        Self::Channel(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = RelayError::connection("test");
        assert_eq!(err.to_string(), "Connection error: test");

        let err = RelayError::timeout("operation");
        assert_eq!(err.to_string(), "Operation timed out: operation");

        let err = RelayError::FrameTooLarge {
            size: 1000,
            max: 512,
        };
        assert_eq!(
            err.to_string(),
            "Frame too large: 1000 bytes (max: 512 bytes)"
        );

        let err = RelayError::ProtocolVersion {
            expected: 2,
            got: 1,
        };
        assert_eq!(
            err.to_string(),
            "Protocol version mismatch: expected 2, got 1"
        );
    }
}
