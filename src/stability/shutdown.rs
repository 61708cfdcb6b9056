//! Process-wide shutdown coordination
//!
//! Components register shutdown actions during startup; on a termination
//! signal the actions run in registration order. Synchronous actions run to
//! completion inline; asynchronous actions are started at their position and
//! their handles awaited as a final step under one bounded global timeout.
//! Actions still pending at the timeout are abandoned and logged, never
//! allowed to block the process indefinitely.
//!
//! Signal handlers only set an atomic flag and notify the main loop; they
//! never perform I/O or take locks.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{RelayError, Result};

type SyncAction = Box<dyn FnOnce() + Send>;
type AsyncAction = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

enum Action {
    Sync(SyncAction),
    Async(AsyncAction),
}

/// Ordered shutdown action runner
pub struct ShutdownCoordinator {
    actions: Mutex<Vec<(String, Action)>>,
    requested: AtomicBool,
    triggered: AtomicBool,
    notify: Notify,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator with a global timeout for asynchronous actions
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            actions: Mutex::new(Vec::new()),
            requested: AtomicBool::new(false),
            triggered: AtomicBool::new(false),
            notify: Notify::new(),
            timeout,
        }
    }

    /// Create with the default timeout (30 seconds)
    #[must_use]
    pub fn with_default_timeout() -> Self {
        Self::new(Duration::from_secs(30))
    }

    /// Register a synchronous action, run inline at its position
    pub fn register_sync<F>(&self, name: impl Into<String>, action: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.register(name.into(), Action::Sync(Box::new(action)))
    }

    /// Register an asynchronous action, started at its position and awaited
    /// as a final step
    pub fn register_async<F, Fut>(&self, name: impl Into<String>, action: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(
            name.into(),
            Action::Async(Box::new(move || Box::pin(action()))),
        )
    }

    fn register(&self, name: String, action: Action) -> Result<()> {
        if self.requested.load(Ordering::Acquire) {
            return Err(RelayError::late_registration(format!(
                "Cannot register '{}': shutdown already started",
                name
            )));
        }
        self.actions.lock().push((name, action));
        Ok(())
    }

    /// Request shutdown (signal-safe: flag + notify only)
    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    /// Whether shutdown has been requested
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Wait until shutdown is requested
    pub async fn wait_requested(&self) {
        loop {
            if self.is_requested() {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Run every registered action in registration order
    ///
    /// Idempotent: the second and later calls are no-ops. Synchronous actions
    /// complete before the next action starts; asynchronous actions are
    /// started in order and awaited together under the global timeout.
    pub async fn trigger(&self) {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return;
        }
        self.requested.store(true, Ordering::Release);
        self.notify.notify_waiters();

        let actions = std::mem::take(&mut *self.actions.lock());
        tracing::info!(count = actions.len(), "Running shutdown actions");

        let mut pending: Vec<(String, JoinHandle<()>)> = Vec::new();
        for (name, action) in actions {
            match action {
                Action::Sync(run) => {
                    tracing::debug!(action = %name, "Running shutdown action");
                    run();
                }
                Action::Async(start) => {
                    tracing::debug!(action = %name, "Starting shutdown action");
                    pending.push((name, tokio::spawn(start())));
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.timeout;
        for (name, handle) in pending {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(action = %name, "Shutdown action panicked: {}", e);
                }
                Err(_) => {
                    tracing::warn!(action = %name, "Shutdown action abandoned at timeout");
                }
            }
        }

        tracing::info!("Shutdown actions complete");
    }
}

/// Map process termination signals onto the coordinator
///
/// SIGTERM and SIGINT request shutdown; SIGPIPE is logged and ignored. The
/// handlers do nothing beyond flag-and-notify.
#[cfg(unix)]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigpipe = signal(SignalKind::pipe())?;

    let term_coordinator = Arc::clone(&coordinator);
    tokio::spawn(async move {
        if sigterm.recv().await.is_some() {
            tracing::info!("Gracefully shutting down via SIGTERM");
            term_coordinator.request();
        }
    });

    tokio::spawn(async move {
        if sigint.recv().await.is_some() {
            tracing::info!("Gracefully shutting down via SIGINT");
            coordinator.request();
        }
    });

    tokio::spawn(async move {
        while sigpipe.recv().await.is_some() {
            tracing::debug!("Ignoring SIGPIPE");
        }
    });

    Ok(())
}

/// Ctrl-C fallback for non-unix targets
#[cfg(not(unix))]
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Gracefully shutting down via Ctrl-C");
            coordinator.request();
        }
    });
    Ok(())
}
