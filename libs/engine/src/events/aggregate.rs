//! Materialized aggregate states with an optimistic-concurrency apply loop
//!
//! A transaction loads the cached state (or replays it), runs a pure mutator
//! that proposes events, appends them expecting the known version, and
//! retries with capped jittered backoff when another writer won the race.
//! Long-running I/O never happens inside the per-aggregate lock.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use super::event_types::{Envelope, Event, StoredEvent};
use super::hub::Hub;
use super::store::{AggregateRef, EventStore, Snapshot, StoreError};

/// Snapshot cadence in events
pub const SNAPSHOT_INTERVAL: u64 = 50;

/// Bounded attempts before a concurrency conflict is surfaced
const MAX_APPLY_ATTEMPTS: u32 = 5;

// =============================================================================
// Aggregate state trait
// =============================================================================

/// Fold failure: the event is not applicable to the current state
#[derive(Debug, Error)]
#[error("invalid transition: {0}")]
pub struct FoldError(pub String);

/// State reconstructed by folding an aggregate's ordered event log.
///
/// Folds must be pure: they reference only the event payload and prior
/// state, so replaying the same log always produces the same state.
pub trait AggregateState:
    Clone + Default + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Apply one event
    fn fold(&mut self, envelope: &Envelope) -> Result<(), FoldError>;
}

// =============================================================================
// Aggregate cache
// =============================================================================

/// LRU of materialized aggregate states plus the apply loop
pub struct AggregateCache<S> {
    store: Arc<dyn EventStore>,
    hub: Arc<Hub>,
    states: Mutex<LruCache<String, (S, u64)>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: AggregateState> AggregateCache<S> {
    /// Create a cache over the given store and hub
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, hub: Arc<Hub>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            store,
            hub,
            states: Mutex::new(LruCache::new(capacity)),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drop the cached state so the next read replays from the store
    pub async fn invalidate(&self, aggregate: &AggregateRef) {
        self.states.lock().await.pop(&aggregate.topic());
    }

    /// Materialize the aggregate, using the cache, the latest snapshot, and
    /// the event log in that order.
    async fn materialize(&self, aggregate: &AggregateRef) -> Result<(S, u64), StoreError> {
        let key = aggregate.topic();

        if let Some(cached) = self.states.lock().await.get(&key) {
            return Ok(cached.clone());
        }

        let (mut state, mut version) = match self.store.load_snapshot(aggregate).await? {
            Some(snapshot) => match serde_json::from_value::<S>(snapshot.state) {
                Ok(state) => (state, snapshot.version),
                Err(e) => {
                    // Snapshots are advisory: fall back to a full replay
                    tracing::warn!(aggregate = %aggregate, error = %e, "snapshot unreadable, replaying log");
                    (S::default(), 0)
                }
            },
            None => (S::default(), 0),
        };

        for stored in self.store.load(aggregate, version).await? {
            if let Err(e) = state.fold(&stored.envelope) {
                return Err(StoreError::Storage(format!(
                    "replay of {aggregate} failed at version {}: {e}",
                    stored.version
                )));
            }
            version = stored.version;
        }

        self.states
            .lock()
            .await
            .put(key, (state.clone(), version));
        Ok((state, version))
    }

    /// Read the current state, or `None` when the aggregate has no events
    pub async fn get(&self, aggregate: &AggregateRef) -> Result<Option<(S, u64)>, StoreError> {
        let _guard = self.lock_for(&aggregate.topic()).await.lock_owned().await;
        let (state, version) = self.materialize(aggregate).await?;
        Ok((version > 0).then_some((state, version)))
    }

    /// Run a transaction against the aggregate.
    ///
    /// The mutator sees the current state and version and returns the events
    /// to append plus a return value. An empty event list commits nothing.
    /// Conflicts are retried with capped jittered backoff; exhaustion
    /// surfaces the conflict to the caller.
    pub async fn apply<R, E, F>(&self, aggregate: &AggregateRef, mut mutate: F) -> Result<R, E>
    where
        F: FnMut(&S, u64) -> Result<(Vec<Event>, R), E>,
        E: From<StoreError>,
    {
        let key = aggregate.topic();
        let lock = self.lock_for(&key).await;
        let _guard = lock.lock().await;

        let mut delays = conflict_backoff();

        for attempt in 1..=MAX_APPLY_ATTEMPTS {
            let (state, version) = self.materialize(aggregate).await?;
            let (events, ret) = mutate(&state, version)?;

            if events.is_empty() {
                return Ok(ret);
            }

            let envelopes: Vec<Envelope> = events.into_iter().map(Envelope::now).collect();

            match self
                .store
                .append(aggregate, version, envelopes.clone())
                .await
            {
                Ok(new_version) => {
                    self.commit_local(aggregate, state, version, &envelopes).await;
                    self.maybe_snapshot(aggregate, version, new_version).await;
                    return Ok(ret);
                }
                Err(StoreError::VersionConflict { .. }) if attempt < MAX_APPLY_ATTEMPTS => {
                    tracing::debug!(aggregate = %aggregate, attempt, "apply conflict, retrying");
                    self.invalidate(aggregate).await;
                    if let Some(delay) = delays.next_backoff() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(E::from(e)),
            }
        }

        Err(E::from(StoreError::Storage(format!(
            "apply on {aggregate} exhausted {MAX_APPLY_ATTEMPTS} attempts"
        ))))
    }

    /// Fold freshly appended events into the cached state and publish them
    async fn commit_local(
        &self,
        aggregate: &AggregateRef,
        mut state: S,
        base_version: u64,
        envelopes: &[Envelope],
    ) {
        let key = aggregate.topic();
        let mut stored = Vec::with_capacity(envelopes.len());
        let mut version = base_version;

        for envelope in envelopes {
            version += 1;
            if let Err(e) = state.fold(envelope) {
                // The mutator emitted an event its own state rejects; the log
                // is durable, so drop the cache and resync on next access.
                tracing::error!(aggregate = %aggregate, error = %e, "post-append fold failed");
                self.invalidate(aggregate).await;
                return;
            }
            stored.push(StoredEvent {
                version,
                envelope: envelope.clone(),
            });
        }

        self.states.lock().await.put(key.clone(), (state, version));
        self.hub.publish(&key, &stored).await;
    }

    async fn maybe_snapshot(&self, aggregate: &AggregateRef, old_version: u64, new_version: u64) {
        if old_version / SNAPSHOT_INTERVAL == new_version / SNAPSHOT_INTERVAL {
            return;
        }
        let Some((state, version)) = self.states.lock().await.get(&aggregate.topic()).cloned()
        else {
            return;
        };
        match serde_json::to_value(&state) {
            Ok(blob) => {
                let snapshot = Snapshot {
                    version,
                    state: blob,
                };
                if let Err(e) = self.store.save_snapshot(aggregate, snapshot).await {
                    tracing::warn!(aggregate = %aggregate, error = %e, "snapshot save failed");
                }
            }
            Err(e) => {
                tracing::warn!(aggregate = %aggregate, error = %e, "snapshot serialize failed");
            }
        }
    }
}

fn conflict_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(10),
        max_interval: Duration::from_millis(250),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventStore;
    use serde::Deserialize;

    /// Counts flow activations; rejects deactivation below zero
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Counter {
        active: i64,
    }

    impl AggregateState for Counter {
        fn fold(&mut self, envelope: &Envelope) -> Result<(), FoldError> {
            match &envelope.event {
                Event::FlowActivated { .. } => {
                    self.active += 1;
                    Ok(())
                }
                Event::FlowDeactivated { .. } => {
                    if self.active == 0 {
                        return Err(FoldError("deactivate below zero".to_string()));
                    }
                    self.active -= 1;
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    fn cache() -> AggregateCache<Counter> {
        AggregateCache::new(Arc::new(MemoryEventStore::new()), Arc::new(Hub::new()), 8)
    }

    #[tokio::test]
    async fn test_apply_appends_and_caches() {
        let cache = cache();
        let aggregate = AggregateRef::partition();

        let ret: Result<u64, StoreError> = cache
            .apply(&aggregate, |_state: &Counter, version| {
                Ok((
                    vec![Event::FlowActivated {
                        flow_id: "f1".to_string(),
                    }],
                    version,
                ))
            })
            .await;
        assert_eq!(ret.unwrap(), 0);

        let (state, version) = cache.get(&aggregate).await.unwrap().unwrap();
        assert_eq!(state.active, 1);
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_empty_event_list_commits_nothing() {
        let cache = cache();
        let aggregate = AggregateRef::partition();

        let ret: Result<&str, StoreError> = cache
            .apply(&aggregate, |_state: &Counter, _version| {
                Ok((vec![], "noop"))
            })
            .await;
        assert_eq!(ret.unwrap(), "noop");
        assert!(cache.get(&aggregate).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mutator_errors_pass_through() {
        let cache = cache();
        let aggregate = AggregateRef::partition();

        let ret: Result<(), StoreError> = cache
            .apply(&aggregate, |_state: &Counter, _version| {
                Err(StoreError::Storage("rejected".to_string()))
            })
            .await;
        assert!(matches!(ret, Err(StoreError::Storage(_))));
        assert!(cache.get(&aggregate).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_after_invalidate_matches() {
        let cache = cache();
        let aggregate = AggregateRef::partition();

        for _ in 0..3 {
            let _: Result<(), StoreError> = cache
                .apply(&aggregate, |_state: &Counter, _version| {
                    Ok((
                        vec![Event::FlowActivated {
                            flow_id: "f".to_string(),
                        }],
                        (),
                    ))
                })
                .await;
        }

        let (incremental, _) = cache.get(&aggregate).await.unwrap().unwrap();
        cache.invalidate(&aggregate).await;
        let (replayed, version) = cache.get(&aggregate).await.unwrap().unwrap();

        assert_eq!(incremental.active, replayed.active);
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn test_snapshot_written_at_interval() {
        let store = Arc::new(MemoryEventStore::new());
        let cache: AggregateCache<Counter> =
            AggregateCache::new(Arc::clone(&store) as Arc<dyn EventStore>, Arc::new(Hub::new()), 8);
        let aggregate = AggregateRef::partition();

        for _ in 0..SNAPSHOT_INTERVAL {
            let _: Result<(), StoreError> = cache
                .apply(&aggregate, |_state: &Counter, _version| {
                    Ok((
                        vec![Event::FlowActivated {
                            flow_id: "f".to_string(),
                        }],
                        (),
                    ))
                })
                .await;
        }

        let snapshot = store.load_snapshot(&aggregate).await.unwrap().unwrap();
        assert_eq!(snapshot.version, SNAPSHOT_INTERVAL);
    }
}
