//! Core protocol components

pub mod frame;
pub mod packet;
pub mod server;

pub use frame::{CloseReason, ControlMessage, Frame, MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use packet::{Packet, MAX_DATAGRAM_SIZE};
pub use server::{RelayConfig, RelayCore, RelayDirectiveSink, RelayServer};
