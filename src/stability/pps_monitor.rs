//! Packet-rate abuse monitor
//!
//! Scans the session table on a fixed period and compares each session's
//! most recently completed one-second bucket against configured thresholds.
//! The policy is two-strike: a first breach flags the session and records a
//! warning; a second breach within the cool-down escalates to disconnect.
//! A flagged session that stays under threshold for a full window returns to
//! Active, so a transient burst carries no permanent penalty.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::session::{SessionId, SessionStatus, SessionTable};

/// Flood policy parameters
///
/// These are policy, not structure: deployments tune them per game.
#[derive(Debug, Clone)]
pub struct FloodConfig {
    /// Maximum packets per second before a strike
    pub max_packets_per_sec: u64,
    /// Maximum bytes per second before a strike
    pub max_bytes_per_sec: u64,
    /// A second breach within this period after flagging escalates to
    /// disconnect
    pub cool_down: Duration,
    /// A flagged session under threshold for this long returns to Active
    pub window: Duration,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            max_packets_per_sec: 500,
            max_bytes_per_sec: 2 * 1024 * 1024,
            cool_down: Duration::from_secs(10),
            window: Duration::from_secs(5),
        }
    }
}

impl FloodConfig {
    /// Create the default flood policy
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the packets-per-second threshold
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_max_packets_per_sec(mut self, max: u64) -> Self {
        self.max_packets_per_sec = max;
        self
    }

    /// Set the bytes-per-second threshold
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_max_bytes_per_sec(mut self, max: u64) -> Self {
        self.max_bytes_per_sec = max;
        self
    }

    /// Set the escalation cool-down
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    /// Set the recovery window
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// What the relay loop should do about a session after a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodVerdict {
    /// First strike: session flagged, send a coded warning
    Warn(SessionId),
    /// Second strike within the cool-down: disconnect with reason PacketFlood
    Disconnect(SessionId),
}

#[derive(Debug, Clone, Copy)]
struct Strike {
    flagged_at: Instant,
    last_breach: Instant,
}

/// Periodic packet-rate scanner
pub struct PpsMonitor {
    config: FloodConfig,
    table: Arc<SessionTable>,
    strikes: Mutex<HashMap<SessionId, Strike>>,
}

impl PpsMonitor {
    /// Create a monitor over a session table
    #[must_use]
    pub fn new(table: Arc<SessionTable>, config: FloodConfig) -> Self {
        Self {
            config,
            table,
            strikes: Mutex::new(HashMap::new()),
        }
    }

    /// Scan all sessions once, applying status transitions and returning the
    /// verdicts the relay loop must act on
    ///
    /// Reads a table snapshot; never blocks on a stalled connection.
    pub fn tick(&self, now: Instant) -> Vec<FloodVerdict> {
        let snapshot = self.table.snapshot();
        let mut verdicts = Vec::new();
        let mut strikes = self.strikes.lock();

        for session in &snapshot {
            let id = session.id();
            let status = session.status();
            if !matches!(status, SessionStatus::Active | SessionStatus::Flagged) {
                continue;
            }

            let (packets, bytes) = session.rate_last_second(now);
            let breach =
                packets > self.config.max_packets_per_sec || bytes > self.config.max_bytes_per_sec;

            match status {
                SessionStatus::Active if breach => {
                    if self.table.transition(id, SessionStatus::Flagged).unwrap_or(false) {
                        strikes.insert(
                            id,
                            Strike {
                                flagged_at: now,
                                last_breach: now,
                            },
                        );
                        tracing::warn!(
                            session_id = id,
                            packets,
                            bytes,
                            "Session exceeded packet rate, flagged"
                        );
                        verdicts.push(FloodVerdict::Warn(id));
                    }
                }
                SessionStatus::Flagged => {
                    let strike = strikes.get(&id).copied();
                    if breach {
                        let within_cool_down = strike
                            .map(|s| now.duration_since(s.flagged_at) <= self.config.cool_down)
                            .unwrap_or(false);
                        if within_cool_down {
                            strikes.remove(&id);
                            tracing::warn!(
                                session_id = id,
                                packets,
                                bytes,
                                "Second packet rate breach within cool-down, disconnecting"
                            );
                            verdicts.push(FloodVerdict::Disconnect(id));
                        } else {
                            // Cool-down expired before the second breach:
                            // treat as a fresh first strike
                            strikes.insert(
                                id,
                                Strike {
                                    flagged_at: now,
                                    last_breach: now,
                                },
                            );
                            tracing::warn!(session_id = id, "Session re-flagged after cool-down");
                            verdicts.push(FloodVerdict::Warn(id));
                        }
                    } else {
                        let quiet_for_window = strike
                            .map(|s| now.duration_since(s.last_breach) >= self.config.window)
                            .unwrap_or(true);
                        if quiet_for_window
                            && self.table.transition(id, SessionStatus::Active).unwrap_or(false)
                        {
                            strikes.remove(&id);
                            tracing::info!(session_id = id, "Flagged session recovered");
                        }
                    }
                }
                _ => {}
            }
        }

        // Forget strikes for sessions that are gone
        strikes.retain(|id, _| snapshot.iter().any(|s| s.id() == *id));

        verdicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Identity, Session};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn flood_session(table: &SessionTable) -> Arc<Session> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let _server_side = listener.accept().await.unwrap();

        let peer = client.peer_addr().unwrap();
        let (_read, write) = client.into_split();
        let session = Arc::new(Session::new(
            table.allocate_id(),
            Identity {
                name: "burst".to_string(),
                token: None,
            },
            write,
            peer,
            Duration::from_secs(1),
            5,
        ));
        table.insert(Arc::clone(&session)).unwrap();
        table
            .transition(session.id(), SessionStatus::Active)
            .unwrap();
        session
    }

    fn config() -> FloodConfig {
        FloodConfig::new()
            .with_max_packets_per_sec(500)
            .with_cool_down(Duration::from_secs(10))
            .with_window(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_single_burst_flags_but_does_not_disconnect() {
        let table = Arc::new(SessionTable::new());
        let session = flood_session(&table).await;
        let monitor = PpsMonitor::new(Arc::clone(&table), config());

        let base = Instant::now();
        // 600 packets within one second against a 500/s threshold
        for _ in 0..600 {
            session.record_traffic(base + Duration::from_secs(3), 10);
        }

        let verdicts = monitor.tick(base + Duration::from_secs(4));
        assert_eq!(verdicts, vec![FloodVerdict::Warn(session.id())]);
        assert_eq!(session.status(), SessionStatus::Flagged);
    }

    #[tokio::test]
    async fn test_second_breach_within_cool_down_disconnects() {
        let table = Arc::new(SessionTable::new());
        let session = flood_session(&table).await;
        let monitor = PpsMonitor::new(Arc::clone(&table), config());

        let base = Instant::now();
        for _ in 0..600 {
            session.record_traffic(base + Duration::from_secs(3), 10);
        }
        monitor.tick(base + Duration::from_secs(4));
        assert_eq!(session.status(), SessionStatus::Flagged);

        // Second burst two seconds later, well within the 10s cool-down
        for _ in 0..600 {
            session.record_traffic(base + Duration::from_secs(5), 10);
        }
        let verdicts = monitor.tick(base + Duration::from_secs(6));
        assert_eq!(verdicts, vec![FloodVerdict::Disconnect(session.id())]);
    }

    #[tokio::test]
    async fn test_compliant_flagged_session_recovers() {
        let table = Arc::new(SessionTable::new());
        let session = flood_session(&table).await;
        let monitor = PpsMonitor::new(Arc::clone(&table), config());

        let base = Instant::now();
        for _ in 0..600 {
            session.record_traffic(base + Duration::from_secs(3), 10);
        }
        monitor.tick(base + Duration::from_secs(4));
        assert_eq!(session.status(), SessionStatus::Flagged);

        // Under threshold but window not yet elapsed: still flagged
        let verdicts = monitor.tick(base + Duration::from_secs(6));
        assert!(verdicts.is_empty());
        assert_eq!(session.status(), SessionStatus::Flagged);

        // Full window of compliance: back to Active
        let verdicts = monitor.tick(base + Duration::from_secs(9));
        assert!(verdicts.is_empty());
        assert_eq!(session.status(), SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_breach_after_cool_down_restarts_the_clock() {
        let table = Arc::new(SessionTable::new());
        let session = flood_session(&table).await;
        let monitor = PpsMonitor::new(
            Arc::clone(&table),
            config().with_cool_down(Duration::from_secs(2)).with_window(Duration::from_secs(60)),
        );

        let base = Instant::now();
        for _ in 0..600 {
            session.record_traffic(base + Duration::from_secs(3), 10);
        }
        monitor.tick(base + Duration::from_secs(4));
        assert_eq!(session.status(), SessionStatus::Flagged);

        // Breach again, but only after the cool-down expired: a fresh warning
        for _ in 0..600 {
            session.record_traffic(base + Duration::from_secs(8), 10);
        }
        let verdicts = monitor.tick(base + Duration::from_secs(9));
        assert_eq!(verdicts, vec![FloodVerdict::Warn(session.id())]);
        assert_eq!(session.status(), SessionStatus::Flagged);
    }

    #[tokio::test]
    async fn test_quiet_session_untouched() {
        let table = Arc::new(SessionTable::new());
        let session = flood_session(&table).await;
        let monitor = PpsMonitor::new(Arc::clone(&table), config());

        let base = Instant::now();
        for _ in 0..100 {
            session.record_traffic(base + Duration::from_secs(1), 10);
        }
        let verdicts = monitor.tick(base + Duration::from_secs(2));
        assert!(verdicts.is_empty());
        assert_eq!(session.status(), SessionStatus::Active);
    }
}
