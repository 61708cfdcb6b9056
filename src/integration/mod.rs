//! Capability interfaces for external collaborators
//!
//! The relay core never depends on concrete engine or manager types: content
//! lookup and the plugin event system are traits, so hosts plug in their own
//! implementations and tests substitute doubles.

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Opaque completion handle returned by an event trigger
pub type EventCompletion = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Content lookup by hash, consumed during resource-transfer messages
///
/// The core does not compute or verify hashes itself; `None` means the hash
/// is unknown to the store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Look up content bytes by hash
    async fn lookup(&self, hash: &str) -> Option<Bytes>;
}

/// Plugin/event-system collaborator
///
/// Raised on connect, disconnect, and shutdown. Completions are opaque
/// awaitables; the core only ever starts and bounded-waits them.
pub trait EventSink: Send + Sync {
    /// Fire an event, returning the pending completions it produced
    fn trigger_event(&self, name: &str, args: serde_json::Value) -> Vec<EventCompletion>;
}

/// Await a set of event completions, bounded by `timeout`
///
/// Returns true when every completion finished in time.
pub async fn wait_for_all(completions: Vec<EventCompletion>, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    for completion in completions {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if tokio::time::timeout(remaining, completion).await.is_err() {
            return false;
        }
    }
    true
}

/// Content store with no content (standalone operation, tests)
pub struct EmptyContentStore;

#[async_trait]
impl ContentStore for EmptyContentStore {
    async fn lookup(&self, _hash: &str) -> Option<Bytes> {
        None
    }
}

/// Event sink that drops all events (standalone operation, tests)
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn trigger_event(&self, name: &str, _args: serde_json::Value) -> Vec<EventCompletion> {
        tracing::trace!(event = name, "Event dropped (no sink installed)");
        Vec::new()
    }
}
