//! Session management
//!
//! A [`Session`] is the server-side record of one connected client: identity,
//! channel state, per-entity sequence numbers, and rate counters. Sessions
//! are owned exclusively by the [`SessionTable`]; every other component
//! references them by id and never outlives a lookup.
//!
//! # Concurrency Design
//!
//! The TCP write half lives behind a tokio `Mutex` so the connection's read
//! task, the broadcast path, and the flood monitor's warning frames can all
//! send without sharing the read side. Status lives behind a `parking_lot`
//! lock, but every status *change* funnels through
//! [`SessionTable::transition`], which serializes transitions table-wide so
//! concurrent flag/disconnect/revoke requests never produce a lost update.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::time::timeout;

use crate::core::frame::{ControlMessage, Frame};
use crate::error::{RelayError, Result};
use crate::stability::rate_window::RateWindow;

/// Session identifier: process-unique, assigned at connect, never reused
/// while the process runs
pub type SessionId = u64;

/// Client identity, immutable after handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Player name declared in the handshake
    pub name: String,
    /// Optional auth token passed through to the backend
    pub token: Option<String>,
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Connected, handshake not yet complete
    Handshaking,
    /// Handshake accepted, relaying traffic
    Active,
    /// Provisionally suspected of abuse, pending a second confirming breach
    Flagged,
    /// Teardown in progress, in-flight sends draining
    Disconnecting,
    /// Terminal
    Closed,
}

impl SessionStatus {
    /// Whether a transition from `self` to `to` is legal
    #[must_use]
    pub fn can_transition(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Handshaking, Active)
                | (Handshaking, Disconnecting)
                | (Active, Flagged)
                | (Active, Disconnecting)
                | (Flagged, Active)
                | (Flagged, Disconnecting)
                | (Disconnecting, Closed)
        )
    }
}

/// Server-side record of one connected client
pub struct Session {
    id: SessionId,
    identity: Identity,
    peer_addr: SocketAddr,
    status: RwLock<SessionStatus>,
    /// Last-applied sequence number per entity, monotonically increasing
    entity_sequences: Mutex<HashMap<u64, u64>>,
    rate: Mutex<RateWindow>,
    connected_at: Instant,
    /// Write half only; the read half stays with the connection task
    write_half: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Datagram return address, learned from the first valid datagram
    udp_addr: RwLock<Option<SocketAddr>>,
    write_timeout: Duration,
}

impl Session {
    /// Create a new session in the `Handshaking` state
    #[must_use]
    pub fn new(
        id: SessionId,
        identity: Identity,
        write_half: OwnedWriteHalf,
        peer_addr: SocketAddr,
        write_timeout: Duration,
        rate_window_secs: usize,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            identity,
            peer_addr,
            status: RwLock::new(SessionStatus::Handshaking),
            entity_sequences: Mutex::new(HashMap::new()),
            rate: Mutex::new(RateWindow::with_window(now, rate_window_secs)),
            connected_at: now,
            write_half: tokio::sync::Mutex::new(Some(write_half)),
            udp_addr: RwLock::new(None),
            write_timeout,
        }
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Client identity
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// TCP peer address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    /// Whether the session is relaying traffic (Active or Flagged)
    #[must_use]
    pub fn is_relaying(&self) -> bool {
        matches!(
            self.status(),
            SessionStatus::Active | SessionStatus::Flagged
        )
    }

    /// Time since connect
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Learned datagram return address, if any
    #[must_use]
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        *self.udp_addr.read()
    }

    /// Record the datagram return address from a valid datagram
    pub fn learn_udp_addr(&self, addr: SocketAddr) {
        *self.udp_addr.write() = Some(addr);
    }

    /// Apply an entity update: returns true only when `sequence` is strictly
    /// newer than the last applied sequence for `entity_id`
    ///
    /// Duplicate or stale sequences leave the map untouched, which makes the
    /// relay idempotent under datagram reordering.
    pub fn apply_update(&self, entity_id: u64, sequence: u64) -> bool {
        let mut sequences = self.entity_sequences.lock();
        match sequences.get(&entity_id) {
            Some(&last) if sequence <= last => false,
            _ => {
                sequences.insert(entity_id, sequence);
                true
            }
        }
    }

    /// Last applied sequence for an entity
    #[must_use]
    pub fn last_sequence(&self, entity_id: u64) -> Option<u64> {
        self.entity_sequences.lock().get(&entity_id).copied()
    }

    /// Count one inbound packet of `bytes` length against the rate window
    pub fn record_traffic(&self, now: Instant, bytes: usize) {
        self.rate.lock().record(now, bytes);
    }

    /// `(packets, bytes)` over the trailing rate window
    pub fn rate_totals(&self, now: Instant) -> (u64, u64) {
        self.rate.lock().totals(now)
    }

    /// `(packets, bytes)` in the most recently completed second
    pub fn rate_last_second(&self, now: Instant) -> (u64, u64) {
        self.rate.lock().last_second(now)
    }

    /// Send a frame on the reliable channel
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let data = frame.encode()?;

        let mut guard = self.write_half.lock().await;
        let write_half = guard
            .as_mut()
            .ok_or_else(|| RelayError::invalid_state("Session write half is closed"))?;

        timeout(self.write_timeout, write_half.write_all(&data))
            .await
            .map_err(|_| RelayError::timeout("Write timed out"))?
            .map_err(|e| RelayError::connection(format!("Failed to write: {}", e)))?;

        Ok(())
    }

    /// Send a control message on the reliable channel
    pub async fn send_control(&self, msg: &ControlMessage) -> Result<()> {
        self.send_frame(&Frame::from_control(msg)?).await
    }

    /// Close the write half, sending FIN to the peer (best effort)
    pub async fn close_write(&self) {
        if let Some(mut write_half) = self.write_half.lock().await.take() {
            let _ = write_half.shutdown().await;
        }
    }

    /// Set the status directly. Internal to the session table, which
    /// serializes and validates all transitions.
    fn set_status(&self, status: SessionStatus) {
        *self.status.write() = status;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.identity.name)
            .field("peer_addr", &self.peer_addr)
            .field("status", &self.status())
            .field("uptime", &self.uptime())
            .finish()
    }
}

/// Shared registry of active sessions
///
/// The table is the single source of truth for session existence. Mutations
/// are serialized; broadcast and the periodic monitors read point-in-time
/// snapshots so they never hold the table lock across I/O.
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    /// Serializes all status transitions (single entry point, no lost updates)
    transition_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl SessionTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            transition_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the next session id (never reused while the process runs)
    pub fn allocate_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a new session
    ///
    /// An id collision means the id allocator was bypassed; that is an
    /// invariant violation, not a network fault.
    pub fn insert(&self, session: Arc<Session>) -> Result<()> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id()) {
            return Err(RelayError::invalid_state(format!(
                "Session id collision: {}",
                session.id()
            )));
        }
        sessions.insert(session.id(), session);
        Ok(())
    }

    /// Remove a session, returning it if present
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.write().remove(&id)
    }

    /// Look up a session by id
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Point-in-time snapshot of all sessions
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Number of sessions in the table
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Player names of all relaying sessions (for heartbeat records)
    pub fn player_names(&self) -> Vec<String> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_relaying())
            .map(|s| s.identity().name.clone())
            .collect()
    }

    /// Request a status transition for a session
    ///
    /// This is the single serialized entry point for all status changes.
    /// Returns `Ok(true)` when the transition was applied, `Ok(false)` when
    /// the session no longer exists or the transition lost a race (e.g. two
    /// components both requesting Disconnecting).
    pub fn transition(&self, id: SessionId, to: SessionStatus) -> Result<bool> {
        let _guard = self.transition_lock.lock();

        let session = match self.get(id) {
            Some(session) => session,
            None => return Ok(false),
        };

        let from = session.status();
        if from == to {
            return Ok(false);
        }
        if !from.can_transition(to) {
            tracing::debug!(
                session_id = id,
                ?from,
                ?to,
                "Rejected illegal status transition"
            );
            return Ok(false);
        }

        session.set_status(to);
        Ok(true)
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
