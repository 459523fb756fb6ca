//! Event store abstraction and the in-memory implementation
//!
//! The engine talks to an append-only log per aggregate identity with
//! optimistic-concurrency appends. Persistent backings implement the same
//! trait; the in-memory store here is the engine's default and the one the
//! test suites run on.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use super::event_types::{Envelope, StoredEvent};

// =============================================================================
// Aggregate identity
// =============================================================================

/// Kind of event-sourced aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    /// The step catalog (one per engine)
    Catalog,

    /// Engine-wide active-flow notices (one per engine)
    Partition,

    /// One flow execution
    Flow,
}

/// Identity of an aggregate: `(kind, id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateRef {
    /// Aggregate kind
    pub kind: AggregateKind,

    /// Identifier within the kind; empty for singleton aggregates
    pub id: String,
}

impl AggregateRef {
    /// The catalog singleton
    #[must_use]
    pub fn catalog() -> Self {
        Self {
            kind: AggregateKind::Catalog,
            id: String::new(),
        }
    }

    /// The partition singleton
    #[must_use]
    pub fn partition() -> Self {
        Self {
            kind: AggregateKind::Partition,
            id: String::new(),
        }
    }

    /// A flow aggregate
    #[must_use]
    pub fn flow(flow_id: impl Into<String>) -> Self {
        Self {
            kind: AggregateKind::Flow,
            id: flow_id.into(),
        }
    }

    /// Topic name for hub subscriptions (`catalog`, `partition`, `flow:<id>`)
    #[must_use]
    pub fn topic(&self) -> String {
        match self.kind {
            AggregateKind::Catalog => "catalog".to_string(),
            AggregateKind::Partition => "partition".to_string(),
            AggregateKind::Flow => format!("flow:{}", self.id),
        }
    }
}

impl fmt::Display for AggregateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Event store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic concurrency conflict: the stream advanced past the
    /// expected version
    #[error("concurrency conflict on {aggregate}: expected version {expected}, found {actual}")]
    VersionConflict {
        aggregate: String,
        expected: u64,
        actual: u64,
    },

    /// Snapshot or event (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backing storage failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// =============================================================================
// Store trait
// =============================================================================

/// Snapshot blob with the version it captures
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Stream version the snapshot reflects
    pub version: u64,

    /// Opaque serialized state
    pub state: serde_json::Value,
}

/// Append-only event log per aggregate with optimistic concurrency
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically append events, expecting the stream to be at
    /// `expected_version`. Returns the new version.
    async fn append(
        &self,
        aggregate: &AggregateRef,
        expected_version: u64,
        events: Vec<Envelope>,
    ) -> Result<u64, StoreError>;

    /// Load events with version greater than `from_version`, in order
    async fn load(
        &self,
        aggregate: &AggregateRef,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// Current stream version (0 when the stream does not exist)
    async fn version(&self, aggregate: &AggregateRef) -> Result<u64, StoreError>;

    /// Persist an advisory snapshot
    async fn save_snapshot(
        &self,
        aggregate: &AggregateRef,
        snapshot: Snapshot,
    ) -> Result<(), StoreError>;

    /// Latest snapshot, when one exists
    async fn load_snapshot(
        &self,
        aggregate: &AggregateRef,
    ) -> Result<Option<Snapshot>, StoreError>;
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Default)]
struct Streams {
    events: HashMap<String, Vec<StoredEvent>>,
    snapshots: HashMap<String, Snapshot>,
}

/// In-memory event store.
///
/// Appends are linearizable per aggregate: the whole map is guarded by one
/// write lock, so version checks and inserts are atomic.
#[derive(Default)]
pub struct MemoryEventStore {
    streams: RwLock<Streams>,
}

impl MemoryEventStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(
        &self,
        aggregate: &AggregateRef,
        expected_version: u64,
        events: Vec<Envelope>,
    ) -> Result<u64, StoreError> {
        let key = aggregate.topic();
        let mut streams = self.streams.write().await;
        let stream = streams.events.entry(key).or_default();

        let actual = stream.len() as u64;
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                aggregate: aggregate.topic(),
                expected: expected_version,
                actual,
            });
        }

        let mut version = actual;
        for envelope in events {
            version += 1;
            stream.push(StoredEvent { version, envelope });
        }

        Ok(version)
    }

    async fn load(
        &self,
        aggregate: &AggregateRef,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let streams = self.streams.read().await;
        Ok(streams
            .events
            .get(&aggregate.topic())
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.version > from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn version(&self, aggregate: &AggregateRef) -> Result<u64, StoreError> {
        let streams = self.streams.read().await;
        Ok(streams
            .events
            .get(&aggregate.topic())
            .map(|stream| stream.len() as u64)
            .unwrap_or(0))
    }

    async fn save_snapshot(
        &self,
        aggregate: &AggregateRef,
        snapshot: Snapshot,
    ) -> Result<(), StoreError> {
        let mut streams = self.streams.write().await;
        streams.snapshots.insert(aggregate.topic(), snapshot);
        Ok(())
    }

    async fn load_snapshot(
        &self,
        aggregate: &AggregateRef,
    ) -> Result<Option<Snapshot>, StoreError> {
        let streams = self.streams.read().await;
        Ok(streams.snapshots.get(&aggregate.topic()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;

    fn envelope(flow_id: &str) -> Envelope {
        Envelope::now(Event::FlowActivated {
            flow_id: flow_id.to_string(),
        })
    }

    #[tokio::test]
    async fn test_append_and_load() {
        let store = MemoryEventStore::new();
        let aggregate = AggregateRef::flow("f1");

        let v = store
            .append(&aggregate, 0, vec![envelope("f1"), envelope("f1")])
            .await
            .unwrap();
        assert_eq!(v, 2);

        let events = store.load(&aggregate, 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].version, 1);
        assert_eq!(events[1].version, 2);

        let tail = store.load(&aggregate, 1).await.unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn test_version_conflict() {
        let store = MemoryEventStore::new();
        let aggregate = AggregateRef::flow("f1");

        store.append(&aggregate, 0, vec![envelope("f1")]).await.unwrap();

        let err = store
            .append(&aggregate, 0, vec![envelope("f1")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_streams_are_isolated() {
        let store = MemoryEventStore::new();
        store
            .append(&AggregateRef::flow("a"), 0, vec![envelope("a")])
            .await
            .unwrap();

        assert_eq!(store.version(&AggregateRef::flow("a")).await.unwrap(), 1);
        assert_eq!(store.version(&AggregateRef::flow("b")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let store = MemoryEventStore::new();
        let aggregate = AggregateRef::catalog();

        assert!(store.load_snapshot(&aggregate).await.unwrap().is_none());

        store
            .save_snapshot(
                &aggregate,
                Snapshot {
                    version: 5,
                    state: serde_json::json!({"steps": {}}),
                },
            )
            .await
            .unwrap();

        let snapshot = store.load_snapshot(&aggregate).await.unwrap().unwrap();
        assert_eq!(snapshot.version, 5);
    }

    #[test]
    fn test_topics() {
        assert_eq!(AggregateRef::catalog().topic(), "catalog");
        assert_eq!(AggregateRef::partition().topic(), "partition");
        assert_eq!(AggregateRef::flow("abc").topic(), "flow:abc");
    }
}
