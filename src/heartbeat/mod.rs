//! Backend heartbeat liaison
//!
//! Periodically reports an aggregate snapshot of the session table to a
//! backend registry and feeds backend-issued directives back into the relay.
//! Transport failures are retried with capped exponential backoff and are
//! never fatal: the server keeps serving in a degraded, unregistered state.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::session::{SessionId, SessionTable};
use crate::stability::ShutdownCoordinator;

/// Aggregate snapshot sent to the backend each tick, never mutated after send
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    /// Number of sessions currently relaying
    pub session_count: usize,
    /// Server uptime in seconds
    pub uptime_secs: u64,
    /// Server version
    pub version: String,
    /// Random per-process token so the backend can correlate restarts
    pub instance_token: String,
    /// Names of connected players
    pub players: Vec<String>,
}

/// Backend-issued instruction delivered via the heartbeat response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum Directive {
    /// Tear down one session
    RevokeSession { session_id: SessionId },
    /// Shut the whole server down
    Shutdown,
}

/// Backend registry wire boundary
///
/// Transport and encoding are the implementor's concern; the core only
/// specifies the retry/backoff and directive-dispatch contract.
#[async_trait]
pub trait BackendRegistry: Send + Sync {
    /// Publish a heartbeat record, returning any directives in the response
    async fn publish(&self, record: &HeartbeatRecord) -> Result<Vec<Directive>>;
}

/// Where directives land: the relay's teardown path and the shutdown
/// coordinator, behind a capability interface so tests substitute doubles
#[async_trait]
pub trait DirectiveSink: Send + Sync {
    /// Tear down the named session via the common disconnect path
    async fn revoke_session(&self, id: SessionId);
    /// Request process shutdown
    fn request_shutdown(&self);
}

/// Capped exponential retry delay
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff starting at `base`, doubling up to `cap`
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// Delay to wait before the next retry; doubles the following delay up
    /// to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    /// Reset to the base delay (on success)
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Heartbeat configuration
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Period between successful heartbeats
    pub interval: Duration,
    /// Base retry delay after a failure
    pub backoff_base: Duration,
    /// Maximum retry delay
    pub backoff_cap: Duration,
    /// Consecutive failures logged before suppression kicks in
    pub max_logged_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(60),
            max_logged_failures: 3,
        }
    }
}

impl HeartbeatConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat interval
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the base retry delay
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set the maximum retry delay
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap = cap;
        self
    }

    /// Set how many consecutive failures are logged before suppression
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_max_logged_failures(mut self, max: u32) -> Self {
        self.max_logged_failures = max;
        self
    }
}

struct LiaisonState {
    backoff: Backoff,
    consecutive_failures: u32,
}

/// Periodic backend reporter
pub struct HeartbeatLiaison {
    config: HeartbeatConfig,
    table: Arc<SessionTable>,
    registry: Arc<dyn BackendRegistry>,
    sink: Arc<dyn DirectiveSink>,
    started_at: Instant,
    instance_token: String,
    state: Mutex<LiaisonState>,
}

impl HeartbeatLiaison {
    /// Create a liaison over a session table
    #[must_use]
    pub fn new(
        config: HeartbeatConfig,
        table: Arc<SessionTable>,
        registry: Arc<dyn BackendRegistry>,
        sink: Arc<dyn DirectiveSink>,
    ) -> Self {
        let token: u128 = OsRng.gen();
        let state = LiaisonState {
            backoff: Backoff::new(config.backoff_base, config.backoff_cap),
            consecutive_failures: 0,
        };
        Self {
            config,
            table,
            registry,
            sink,
            started_at: Instant::now(),
            instance_token: format!("{:032x}", token),
            state: Mutex::new(state),
        }
    }

    /// Build the aggregate snapshot for this tick
    pub fn build_record(&self) -> HeartbeatRecord {
        HeartbeatRecord {
            session_count: self.table.player_names().len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_token: self.instance_token.clone(),
            players: self.table.player_names(),
        }
    }

    /// Publish one heartbeat; returns the delay until the next attempt
    /// (the configured interval on success, the backoff delay on failure)
    pub async fn tick(&self) -> Duration {
        let record = self.build_record();

        match self.registry.publish(&record).await {
            Ok(directives) => {
                {
                    let mut state = self.state.lock();
                    if state.consecutive_failures > 0 {
                        tracing::info!(
                            failures = state.consecutive_failures,
                            "Backend registry reachable again"
                        );
                    }
                    state.consecutive_failures = 0;
                    state.backoff.reset();
                }

                for directive in directives {
                    match directive {
                        Directive::RevokeSession { session_id } => {
                            tracing::info!(session_id, "Backend revoked session");
                            self.sink.revoke_session(session_id).await;
                        }
                        Directive::Shutdown => {
                            tracing::info!("Backend requested shutdown");
                            self.sink.request_shutdown();
                        }
                    }
                }

                self.config.interval
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.consecutive_failures += 1;
                if state.consecutive_failures <= self.config.max_logged_failures {
                    tracing::warn!(
                        failures = state.consecutive_failures,
                        "Heartbeat failed, serving unregistered: {}",
                        e
                    );
                    if state.consecutive_failures == self.config.max_logged_failures {
                        tracing::warn!("Suppressing further heartbeat failure logs");
                    }
                }
                state.backoff.next_delay()
            }
        }
    }

    /// Run the heartbeat loop until shutdown is requested
    pub async fn run(&self, coordinator: Arc<ShutdownCoordinator>) {
        loop {
            let delay = self.tick().await;
            tokio::select! {
                _ = coordinator.wait_requested() => {
                    tracing::debug!("Heartbeat loop stopping");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::error::RelayError;

    struct ScriptedRegistry {
        responses: Mutex<VecDeque<Result<Vec<Directive>>>>,
    }

    impl ScriptedRegistry {
        fn new(responses: Vec<Result<Vec<Directive>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl BackendRegistry for ScriptedRegistry {
        async fn publish(&self, _record: &HeartbeatRecord) -> Result<Vec<Directive>> {
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        revoked: Mutex<Vec<SessionId>>,
        shutdown: AtomicBool,
    }

    #[async_trait]
    impl DirectiveSink for RecordingSink {
        async fn revoke_session(&self, id: SessionId) {
            self.revoked.lock().push(id);
        }

        fn request_shutdown(&self) {
            self.shutdown.store(true, Ordering::Release);
        }
    }

    fn unavailable() -> Result<Vec<Directive>> {
        Err(RelayError::backend_unavailable("connection refused"))
    }

    fn liaison(
        registry: Arc<ScriptedRegistry>,
        sink: Arc<RecordingSink>,
    ) -> HeartbeatLiaison {
        let config = HeartbeatConfig::new()
            .with_interval(Duration::from_secs(15))
            .with_backoff_base(Duration::from_secs(5))
            .with_backoff_cap(Duration::from_secs(60));
        HeartbeatLiaison::new(config, Arc::new(SessionTable::new()), registry, sink)
    }

    #[tokio::test]
    async fn test_backoff_schedule_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(60));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_consecutive_failures_follow_schedule_then_reset() {
        let registry = ScriptedRegistry::new(vec![
            unavailable(),
            unavailable(),
            unavailable(),
            Ok(Vec::new()),
            unavailable(),
        ]);
        let sink = Arc::new(RecordingSink::default());
        let liaison = liaison(registry, sink);

        // Three failures: 5s, 10s, 20s (not 5, 10, 15)
        assert_eq!(liaison.tick().await, Duration::from_secs(5));
        assert_eq!(liaison.tick().await, Duration::from_secs(10));
        assert_eq!(liaison.tick().await, Duration::from_secs(20));

        // Success resets the schedule and returns the normal interval
        assert_eq!(liaison.tick().await, Duration::from_secs(15));
        assert_eq!(liaison.tick().await, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_directives_are_dispatched() {
        let registry = ScriptedRegistry::new(vec![Ok(vec![
            Directive::RevokeSession { session_id: 3 },
            Directive::Shutdown,
        ])]);
        let sink = Arc::new(RecordingSink::default());
        let liaison = liaison(registry, Arc::clone(&sink));

        liaison.tick().await;

        assert_eq!(*sink.revoked.lock(), vec![3]);
        assert!(sink.shutdown.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_record_contents() {
        let registry = ScriptedRegistry::new(vec![]);
        let sink = Arc::new(RecordingSink::default());
        let liaison = liaison(registry, sink);

        let record = liaison.build_record();
        assert_eq!(record.session_count, 0);
        assert_eq!(record.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(record.instance_token.len(), 32);
        assert!(record.players.is_empty());
    }

    #[tokio::test]
    async fn test_directive_serde_shape() {
        let json = serde_json::to_value(Directive::RevokeSession { session_id: 7 }).unwrap();
        assert_eq!(json["directive"], "revoke_session");
        assert_eq!(json["session_id"], 7);
    }
}
