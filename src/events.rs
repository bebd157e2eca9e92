//! Platform events
//!
//! A typed broadcast channel replacing ad-hoc event emitters: subsystems
//! publish [`PlatformEvent`]s and any number of observers subscribe.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of buffered events per subscriber
const DEFAULT_CAPACITY: usize = 1024;

/// What a cache invalidation targeted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationKind {
    Key,
    Pattern,
    Tag,
    Module,
}

/// Observability record for a cache invalidation
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationEvent {
    /// Invalidation kind
    pub kind: InvalidationKind,
    /// Key, pattern, tag or module name
    pub target: String,
    /// Module the invalidation was issued for, if any
    pub module: Option<String>,
    /// Free-form reason supplied by the caller
    pub reason: String,
    /// When the invalidation happened
    pub timestamp: DateTime<Utc>,
}

/// Events published by the platform
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum PlatformEvent {
    /// A physical connection was opened for a pool
    ConnectionCreated { pool: String },
    /// A pool was closed and its connections released
    ConnectionRemoved { pool: String },
    /// A pool health check or query failed
    PoolError { pool: String, message: String },
    /// Cache entries were invalidated
    CacheInvalidated(InvalidationEvent),
    /// A module moved to a new lifecycle state
    ModuleStateChanged { module: String, state: String },
}

impl PlatformEvent {
    /// Dotted topic name observers can filter on
    pub fn topic(&self) -> &'static str {
        match self {
            PlatformEvent::ConnectionCreated { .. } => "connection.created",
            PlatformEvent::ConnectionRemoved { .. } => "connection.removed",
            PlatformEvent::PoolError { .. } => "pool.error",
            PlatformEvent::CacheInvalidated(_) => "cache.invalidated",
            PlatformEvent::ModuleStateChanged { .. } => "module.state_changed",
        }
    }
}

/// Cloneable handle to the platform event channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PlatformEvent>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Register a new observer
    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: PlatformEvent) {
        let topic = event.topic();
        if self.sender.send(event).is_err() {
            trace!(topic, "event dropped, no subscribers");
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(PlatformEvent::ConnectionCreated {
            pool: "vendas".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic(), "connection.created");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(PlatformEvent::PoolError {
            pool: "default".to_string(),
            message: "boom".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
