//! Relay server: connection lifecycle and dual-channel multiplexing
//!
//! One TCP listener carries the reliable channel (handshake, control,
//! resource transfer); one UDP socket on the same port carries the
//! unreliable channel (entity updates). All disconnect causes converge on
//! [`RelayCore::disconnect_session`], the single teardown path.

use parking_lot::RwLock;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::core::frame::{CloseReason, ControlMessage, Frame, PROTOCOL_VERSION, RESOURCE_CHUNK_SIZE};
use crate::core::packet::{Packet, MAX_DATAGRAM_SIZE};
use crate::error::{RelayError, Result};
use crate::heartbeat::DirectiveSink;
use crate::integration::{wait_for_all, ContentStore, EmptyContentStore, EventSink, NullEventSink};
use crate::session::{Identity, Session, SessionId, SessionStatus, SessionTable};
use crate::stability::{FloodConfig, FloodVerdict, PpsMonitor, ShutdownCoordinator};

/// How long plugin event completions are driven before being dropped
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address for both channels (UDP binds the same port)
    pub bind_address: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Deadline for the first handshake frame
    pub handshake_timeout: Duration,
    /// Per-read timeout on the reliable channel
    pub read_timeout: Duration,
    /// Write timeout on the reliable channel
    pub write_timeout: Duration,
    /// Grace period for draining the close frame during teardown
    pub disconnect_grace: Duration,
    /// TCP keep-alive interval
    pub keep_alive: Option<Duration>,
    /// Trailing rate-window length per session, in seconds
    pub rate_window_secs: usize,
    /// Flood policy
    pub flood: FloodConfig,
    /// Flood scan period
    pub monitor_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:30814".to_string(),
            max_connections: 64,
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            disconnect_grace: Duration::from_secs(2),
            keep_alive: Some(Duration::from_secs(60)),
            rate_window_secs: 5,
            flood: FloodConfig::default(),
            monitor_interval: Duration::from_secs(1),
        }
    }
}

impl RelayConfig {
    /// Create a configuration for the given bind address
    #[must_use]
    pub fn new<S: Into<String>>(bind_address: S) -> Self {
        Self {
            bind_address: bind_address.into(),
            ..Default::default()
        }
    }

    /// Set maximum connections
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the handshake deadline
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the per-read timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the teardown grace period
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }

    /// Set the keep-alive interval
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Set the flood policy
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_flood(mut self, flood: FloodConfig) -> Self {
        self.flood = flood;
        self
    }

    /// Set the flood scan period
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }
}

/// Shared relay runtime, referenced by connection tasks, the UDP reactor,
/// the flood monitor, and directive dispatch
pub struct RelayCore {
    config: RelayConfig,
    table: Arc<SessionTable>,
    content: Arc<dyn ContentStore>,
    events: Arc<dyn EventSink>,
    udp: Arc<UdpSocket>,
}

impl RelayCore {
    /// The session table
    #[must_use]
    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Read frames until one complete frame is available
    async fn read_frame(
        &self,
        read_half: &mut OwnedReadHalf,
        buf: &mut BytesMut,
        read_timeout: Duration,
    ) -> Result<Frame> {
        loop {
            if let Some(frame) = Frame::decode(buf)? {
                return Ok(frame);
            }
            let n = timeout(read_timeout, read_half.read_buf(buf))
                .await
                .map_err(|_| RelayError::timeout("Read timed out"))?
                .map_err(|e| RelayError::connection(format!("Failed to read: {}", e)))?;
            if n == 0 {
                return Err(RelayError::connection("Connection closed by peer"));
            }
        }
    }

    /// Best-effort refusal before any session exists
    async fn refuse(&self, write_half: &mut OwnedWriteHalf, reason: CloseReason) {
        if let Ok(frame) = Frame::from_control(&ControlMessage::Disconnect { reason }) {
            if let Ok(data) = frame.encode() {
                let _ = timeout(self.config.write_timeout, write_half.write_all(&data)).await;
            }
        }
        let _ = write_half.shutdown().await;
    }

    /// Run the handshake: the first reliable frame must declare protocol
    /// version and identity
    async fn handshake(
        &self,
        read_half: &mut OwnedReadHalf,
        buf: &mut BytesMut,
    ) -> Result<Identity> {
        let frame = self
            .read_frame(read_half, buf, self.config.handshake_timeout)
            .await
            .map_err(|e| match e {
                RelayError::Timeout(_) => RelayError::handshake("Handshake timed out"),
                other => other,
            })?;

        match frame.to_control() {
            Ok(ControlMessage::Hello {
                version,
                name,
                token,
            }) => {
                if version != PROTOCOL_VERSION {
                    return Err(RelayError::ProtocolVersion {
                        expected: PROTOCOL_VERSION,
                        got: version,
                    });
                }
                if name.is_empty() {
                    return Err(RelayError::handshake("Empty player name"));
                }
                Ok(Identity { name, token })
            }
            Ok(other) => Err(RelayError::handshake(format!(
                "Expected hello, got {:?}",
                other
            ))),
            Err(e) => Err(RelayError::handshake(format!("Unreadable hello: {}", e))),
        }
    }

    /// Handle one accepted connection for its whole lifetime
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        _permit: OwnedSemaphorePermit,
    ) {
        if let Some(keep_alive) = self.config.keep_alive {
            let sock = socket2::SockRef::from(&stream);
            let ka = socket2::TcpKeepalive::new().with_time(keep_alive);
            if let Err(e) = sock.set_tcp_keepalive(&ka) {
                tracing::warn!("Failed to set keep-alive: {}", e);
            }
        }

        let (mut read_half, mut write_half) = stream.into_split();
        let mut buf = BytesMut::with_capacity(4096);

        let identity = match self.handshake(&mut read_half, &mut buf).await {
            Ok(identity) => identity,
            Err(RelayError::ProtocolVersion { expected, got }) => {
                tracing::info!(%peer_addr, expected, got, "Refusing connection: version mismatch");
                self.refuse(&mut write_half, CloseReason::VersionMismatch)
                    .await;
                return;
            }
            Err(e) => {
                tracing::info!(%peer_addr, "Refusing connection: {}", e);
                self.refuse(&mut write_half, CloseReason::ProtocolViolation)
                    .await;
                return;
            }
        };

        let id = self.table.allocate_id();
        let session = Arc::new(Session::new(
            id,
            identity,
            write_half,
            peer_addr,
            self.config.write_timeout,
            self.config.rate_window_secs,
        ));

        if let Err(e) = self.table.insert(Arc::clone(&session)) {
            // Id collision is an invariant violation, not a network fault
            tracing::error!(session_id = id, "Refusing connection: {}", e);
            return;
        }
        let _ = self.table.transition(id, SessionStatus::Active);

        if session
            .send_control(&ControlMessage::Welcome { session_id: id })
            .await
            .is_err()
        {
            self.disconnect_session(id, CloseReason::ProtocolViolation)
                .await;
            return;
        }

        tracing::info!(
            session_id = id,
            name = %session.identity().name,
            %peer_addr,
            "Session established"
        );
        let completions = self.events.trigger_event(
            "onPlayerConnect",
            json!({ "session_id": id, "name": session.identity().name }),
        );
        tokio::spawn(wait_for_all(completions, EVENT_DRAIN_TIMEOUT));

        let reason = self.connection_loop(&session, &mut read_half, &mut buf).await;
        self.disconnect_session(id, reason).await;
    }

    /// Process reliable-channel frames in arrival order (FIFO per session)
    /// until the connection ends; returns the close reason for teardown
    async fn connection_loop(
        &self,
        session: &Arc<Session>,
        read_half: &mut OwnedReadHalf,
        buf: &mut BytesMut,
    ) -> CloseReason {
        loop {
            if !session.is_relaying() {
                // Another component (monitor, revoke, shutdown) started teardown
                return CloseReason::ByeBye;
            }

            let frame = match self
                .read_frame(read_half, buf, self.config.read_timeout)
                .await
            {
                Ok(frame) => frame,
                Err(RelayError::Timeout(_)) => continue,
                Err(RelayError::FrameTooLarge { size, max }) => {
                    tracing::warn!(
                        session_id = session.id(),
                        size,
                        max,
                        "Oversized frame, closing connection"
                    );
                    return CloseReason::ProtocolViolation;
                }
                Err(e) => {
                    tracing::debug!(session_id = session.id(), "Connection ended: {}", e);
                    return CloseReason::ByeBye;
                }
            };

            session.record_traffic(Instant::now(), frame.size());

            match frame.to_control() {
                Ok(ControlMessage::Ping) => {
                    let _ = session.send_control(&ControlMessage::Pong).await;
                }
                Ok(ControlMessage::Pong) => {}
                Ok(ControlMessage::Goodbye) => {
                    return CloseReason::ByeBye;
                }
                Ok(ControlMessage::ResourceRequest { hash }) => {
                    self.stream_resource(session, &hash).await;
                }
                Ok(ControlMessage::Hello { .. }) => {
                    tracing::warn!(session_id = session.id(), "Duplicate handshake");
                    return CloseReason::ProtocolViolation;
                }
                Ok(other) => {
                    tracing::debug!(
                        session_id = session.id(),
                        "Ignoring unexpected control message: {:?}",
                        other
                    );
                }
                Err(e) => {
                    tracing::warn!(session_id = session.id(), "Unreadable frame: {}", e);
                    return CloseReason::ProtocolViolation;
                }
            }
        }
    }

    /// Stream content for a resource request back in bounded chunks
    ///
    /// A transfer abandoned mid-way (peer disconnecting) is dropped silently;
    /// there is no peer left to surface the error to.
    async fn stream_resource(&self, session: &Arc<Session>, hash: &str) {
        let content = match self.content.lookup(hash).await {
            Some(content) => content,
            None => {
                tracing::debug!(session_id = session.id(), hash, "Resource not found");
                let _ = session
                    .send_control(&ControlMessage::ResourceMissing {
                        hash: hash.to_string(),
                    })
                    .await;
                return;
            }
        };

        tracing::debug!(
            session_id = session.id(),
            hash,
            bytes = content.len(),
            "Streaming resource"
        );

        let total = content.len();
        let mut offset = 0usize;
        loop {
            if !session.is_relaying() {
                tracing::debug!(session_id = session.id(), hash, "Transfer abandoned");
                return;
            }

            let end = (offset + RESOURCE_CHUNK_SIZE).min(total);
            let last = end == total;
            let msg =
                ControlMessage::resource_chunk(hash, offset as u64, &content[offset..end], last);
            if session.send_control(&msg).await.is_err() {
                tracing::debug!(session_id = session.id(), hash, "Transfer abandoned");
                return;
            }
            if last {
                return;
            }
            offset = end;
        }
    }

    /// Receive and dispatch one datagram
    async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(%src, "Dropping malformed datagram: {}", e);
                return;
            }
        };

        let session = match self.table.get(packet.session_id) {
            Some(session) if session.is_relaying() => session,
            _ => {
                tracing::debug!(%src, session_id = packet.session_id, "Datagram for unknown session");
                return;
            }
        };

        // The return address is learned from the first datagram; a different
        // source afterwards is dropped rather than rebinding the session
        match session.udp_addr() {
            None => session.learn_udp_addr(src),
            Some(known) if known != src => {
                tracing::debug!(%src, session_id = session.id(), "Datagram from unexpected source");
                return;
            }
            _ => {}
        }

        session.record_traffic(Instant::now(), data.len());

        if !session.apply_update(packet.entity_id, packet.sequence) {
            // Stale or duplicate: latest wins, drop silently
            return;
        }

        self.broadcast_packet(&packet).await;
    }

    /// Relay an applied entity update to every other relaying session with a
    /// known datagram address, best-effort
    pub async fn broadcast_packet(&self, packet: &Packet) {
        let encoded = match packet.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::debug!("Not relaying unencodable packet: {}", e);
                return;
            }
        };

        for peer in self.table.snapshot() {
            if peer.id() == packet.session_id || !peer.is_relaying() {
                continue;
            }
            if let Some(addr) = peer.udp_addr() {
                if let Err(e) = self.udp.send_to(&encoded, addr).await {
                    tracing::debug!(session_id = peer.id(), "Relay send failed: {}", e);
                }
            }
        }
    }

    /// The single teardown path for every disconnect cause
    ///
    /// Idempotent: whoever wins the Disconnecting transition runs the
    /// teardown; later callers are no-ops.
    pub async fn disconnect_session(&self, id: SessionId, reason: CloseReason) {
        if !self
            .table
            .transition(id, SessionStatus::Disconnecting)
            .unwrap_or(false)
        {
            return;
        }
        let session = match self.table.get(id) {
            Some(session) => session,
            None => return,
        };

        // Drain the close frame within the grace period, abandon otherwise
        let _ = timeout(
            self.config.disconnect_grace,
            session.send_control(&ControlMessage::Disconnect { reason }),
        )
        .await;
        session.close_write().await;

        let _ = self.table.transition(id, SessionStatus::Closed);
        self.table.remove(id);

        tracing::info!(
            session_id = id,
            name = %session.identity().name,
            %reason,
            "Session closed"
        );
        let completions = self.events.trigger_event(
            "onPlayerDisconnect",
            json!({
                "session_id": id,
                "name": session.identity().name,
                "reason": reason.to_string(),
            }),
        );
        tokio::spawn(wait_for_all(completions, EVENT_DRAIN_TIMEOUT));
    }

    /// UDP reactor: one socket serves all sessions' unreliable traffic
    async fn run_udp_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        loop {
            match self.udp.recv_from(&mut buf).await {
                Ok((n, src)) => self.handle_datagram(&buf[..n], src).await,
                Err(e) => {
                    tracing::warn!("UDP receive failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// Flood scan loop: reads snapshots, never blocks on a stalled connection
    async fn run_monitor_loop(self: Arc<Self>, monitor: PpsMonitor) {
        let mut interval = tokio::time::interval(self.config.monitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            for verdict in monitor.tick(Instant::now()) {
                match verdict {
                    FloodVerdict::Warn(id) => {
                        if let Some(session) = self.table.get(id) {
                            // Warning sends run detached so a stalled peer
                            // cannot hold up the scan
                            tokio::spawn(async move {
                                let _ = session
                                    .send_control(&ControlMessage::Warning {
                                        reason: CloseReason::PacketFlood,
                                        message: "packet rate exceeded, next breach disconnects"
                                            .to_string(),
                                    })
                                    .await;
                            });
                        }
                    }
                    FloodVerdict::Disconnect(id) => {
                        let core = Arc::clone(&self);
                        tokio::spawn(async move {
                            core.disconnect_session(id, CloseReason::PacketFlood).await;
                        });
                    }
                }
            }
        }
    }
}

/// Dispatches backend directives into the relay and the shutdown coordinator
pub struct RelayDirectiveSink {
    core: Arc<RelayCore>,
    coordinator: Arc<ShutdownCoordinator>,
}

impl RelayDirectiveSink {
    /// Create a sink over a running relay core
    #[must_use]
    pub fn new(core: Arc<RelayCore>, coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self { core, coordinator }
    }
}

#[async_trait::async_trait]
impl DirectiveSink for RelayDirectiveSink {
    async fn revoke_session(&self, id: SessionId) {
        self.core.disconnect_session(id, CloseReason::Revoked).await;
    }

    fn request_shutdown(&self) {
        self.coordinator.request();
    }
}

/// The relay server: owns the listeners and background tasks
pub struct RelayServer {
    config: RelayConfig,
    table: Arc<SessionTable>,
    content: Arc<dyn ContentStore>,
    events: Arc<dyn EventSink>,
    running: Arc<AtomicBool>,
    core: Option<Arc<RelayCore>>,
    server_task: Option<JoinHandle<()>>,
    udp_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
    connection_tasks: Arc<RwLock<Vec<JoinHandle<()>>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl RelayServer {
    /// Create a server with no content store or event sink installed
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self::with_collaborators(config, Arc::new(EmptyContentStore), Arc::new(NullEventSink))
    }

    /// Create a server with explicit collaborators
    #[must_use]
    pub fn with_collaborators(
        config: RelayConfig,
        content: Arc<dyn ContentStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            table: Arc::new(SessionTable::new()),
            content,
            events,
            running: Arc::new(AtomicBool::new(false)),
            core: None,
            server_task: None,
            udp_task: None,
            monitor_task: None,
            connection_tasks: Arc::new(RwLock::new(Vec::new())),
            shutdown_tx: None,
        }
    }

    /// Start listening; returns the bound address (UDP shares the port)
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.running.load(Ordering::Acquire) {
            return Err(RelayError::invalid_state("Server is already running"));
        }

        let addr: SocketAddr = self
            .config
            .bind_address
            .parse()
            .map_err(|e| RelayError::invalid_address(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::connection(format!("Failed to bind TCP: {}", e)))?;
        let bound = listener
            .local_addr()
            .map_err(|e| RelayError::connection(format!("No local address: {}", e)))?;
        let udp = UdpSocket::bind(bound)
            .await
            .map_err(|e| RelayError::connection(format!("Failed to bind UDP: {}", e)))?;

        let core = Arc::new(RelayCore {
            config: self.config.clone(),
            table: Arc::clone(&self.table),
            content: Arc::clone(&self.content),
            events: Arc::clone(&self.events),
            udp: Arc::new(udp),
        });
        self.core = Some(Arc::clone(&core));

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        let max_connections = self.config.max_connections;
        let running = Arc::clone(&self.running);
        let connection_tasks = Arc::clone(&self.connection_tasks);
        self.running.store(true, Ordering::Release);

        let accept_core = Arc::clone(&core);
        let server_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                                    Ok(permit) => permit,
                                    Err(_) => {
                                        tracing::warn!(
                                            "Connection limit reached ({}), rejecting {}",
                                            max_connections,
                                            peer_addr
                                        );
                                        drop(stream);
                                        continue;
                                    }
                                };

                                let task_core = Arc::clone(&accept_core);
                                let handle = tokio::spawn(task_core.handle_connection(
                                    stream,
                                    peer_addr,
                                    permit,
                                ));

                                let mut tasks = connection_tasks.write();
                                tasks.push(handle);
                                tasks.retain(|task| !task.is_finished());
                            }
                            Err(e) => {
                                tracing::error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Relay stopped accepting connections");
                        break;
                    }
                }
            }
            running.store(false, Ordering::Release);
        });
        self.server_task = Some(server_task);

        self.udp_task = Some(tokio::spawn(Arc::clone(&core).run_udp_loop()));

        let monitor = PpsMonitor::new(Arc::clone(&self.table), self.config.flood.clone());
        self.monitor_task = Some(tokio::spawn(Arc::clone(&core).run_monitor_loop(monitor)));

        tracing::info!(%bound, "Relay listening (TCP + UDP)");
        Ok(bound)
    }

    /// Stop the server: stop accepting, tear down every session with a
    /// coded ServerShutdown close, stop the reactors
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.server_task.take() {
            let _ = task.await;
        }

        if let Some(core) = &self.core {
            for session in self.table.snapshot() {
                core.disconnect_session(session.id(), CloseReason::ServerShutdown)
                    .await;
            }
        }

        if let Some(task) = self.udp_task.take() {
            task.abort();
        }
        if let Some(task) = self.monitor_task.take() {
            task.abort();
        }

        let tasks = std::mem::take(&mut *self.connection_tasks.write());
        for task in tasks {
            if !task.is_finished() {
                task.abort();
            }
        }

        self.running.store(false, Ordering::Release);
        tracing::info!("Relay stopped");
        Ok(())
    }

    /// Whether the server is accepting connections
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The session table
    #[must_use]
    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// The shared relay core (available once started)
    #[must_use]
    pub fn core(&self) -> Option<Arc<RelayCore>> {
        self.core.clone()
    }
}
