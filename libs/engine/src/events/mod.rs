//! Event sourcing infrastructure: event types, store, aggregates, hub

mod aggregate;
mod event_types;
mod hub;
mod store;

pub use aggregate::{AggregateCache, AggregateState, FoldError, SNAPSHOT_INTERVAL};
pub use event_types::{Envelope, Event, StoredEvent, WorkItemSeed};
pub use hub::{Hub, Subscription};
pub use store::{AggregateKind, AggregateRef, EventStore, MemoryEventStore, Snapshot, StoreError};
