//! Relay Server
//!
//! The network and session relay core for a real-time multiplayer
//! simulation: a dedicated, authoritative server that accepts many
//! concurrent clients, synchronizes per-entity state between them over a
//! dual reliable/unreliable channel, distributes shared content on demand,
//! and reports liveness to a backend registry.
//!
//! ## Features
//!
//! - Async TCP + UDP multiplexer built on tokio
//! - Length-prefixed reliable channel for handshake, control, and resource
//!   transfer
//! - Datagram unreliable channel with "latest sequence wins" entity updates
//! - Two-strike packet-rate abuse monitor
//! - Backend heartbeat with capped exponential backoff and directive
//!   dispatch
//! - Ordered shutdown actions with a bounded global timeout
//!
//! ## Example
//!
//! ```no_run
//! use relay_server::{RelayConfig, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig::new("0.0.0.0:30814");
//!     let mut server = RelayServer::new(config);
//!     server.start().await?;
//!     // ... run until shutdown, then:
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod error;
pub mod heartbeat;
pub mod integration;
pub mod session;
pub mod stability;

// Re-export main types
pub use core::{
    CloseReason, ControlMessage, Frame, Packet, RelayConfig, RelayCore, RelayDirectiveSink,
    RelayServer, MAX_DATAGRAM_SIZE, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
pub use error::{RelayError, Result};
pub use heartbeat::{
    Backoff, BackendRegistry, Directive, DirectiveSink, HeartbeatConfig, HeartbeatLiaison,
    HeartbeatRecord,
};
pub use integration::{
    wait_for_all, ContentStore, EmptyContentStore, EventCompletion, EventSink, NullEventSink,
};
pub use session::{Identity, Session, SessionId, SessionStatus, SessionTable};
pub use stability::{
    install_signal_handlers, FloodConfig, FloodVerdict, PpsMonitor, RateWindow,
    ShutdownCoordinator,
};
