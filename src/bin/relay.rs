//! Standalone relay server binary
//!
//! Wires the relay core together with no-op collaborators: no content store,
//! no plugin engine, no backend registry transport. Hosts embedding the
//! library supply real implementations of the capability traits instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_server::{
    install_signal_handlers, wait_for_all, BackendRegistry, Directive, EventSink, HeartbeatConfig,
    HeartbeatLiaison, HeartbeatRecord, NullEventSink, RelayConfig, RelayDirectiveSink, RelayServer,
    RelayError, Result, ShutdownCoordinator,
};

/// Registry stub for running without a backend: every heartbeat "succeeds"
/// with no directives
struct NullBackendRegistry;

#[async_trait]
impl BackendRegistry for NullBackendRegistry {
    async fn publish(&self, record: &HeartbeatRecord) -> Result<Vec<Directive>> {
        tracing::debug!(
            sessions = record.session_count,
            uptime = record.uptime_secs,
            "Heartbeat (no backend configured)"
        );
        Ok(Vec::new())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let bind = std::env::var("RELAY_BIND").unwrap_or_else(|_| "0.0.0.0:30814".to_string());
    tracing::info!(%bind, version = env!("CARGO_PKG_VERSION"), "Starting relay server");

    let coordinator = Arc::new(ShutdownCoordinator::with_default_timeout());
    install_signal_handlers(Arc::clone(&coordinator))?;

    let events: Arc<dyn EventSink> = Arc::new(NullEventSink);

    // Plugins get a bounded chance to drain their onShutdown work
    let shutdown_events = Arc::clone(&events);
    coordinator.register_async("plugin-drain", move || async move {
        let completions = shutdown_events.trigger_event("onShutdown", serde_json::json!({}));
        wait_for_all(completions, Duration::from_secs(10)).await;
    })?;

    let mut server = RelayServer::new(RelayConfig::new(bind));
    let bound = server.start().await?;
    tracing::info!(%bound, "Relay ready");

    let core = server
        .core()
        .ok_or_else(|| RelayError::invalid_state("Server core missing after start"))?;
    let liaison = Arc::new(HeartbeatLiaison::new(
        HeartbeatConfig::default(),
        Arc::clone(server.table()),
        Arc::new(NullBackendRegistry),
        Arc::new(RelayDirectiveSink::new(core, Arc::clone(&coordinator))),
    ));
    let liaison_coordinator = Arc::clone(&coordinator);
    tokio::spawn(async move { liaison.run(liaison_coordinator).await });

    coordinator.wait_requested().await;
    coordinator.trigger().await;
    server.stop().await?;

    tracing::info!("Relay exited cleanly");
    Ok(())
}
