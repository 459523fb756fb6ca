//! Retry timer queue
//!
//! A single in-memory min-heap keyed by due time, owned by one dedicated
//! task. Peers enqueue through a channel; a path index `(flow, step) ->
//! tokens` makes cancellation on step failure cheap (entries are dropped
//! lazily when popped). Durability comes from the persisted `RetryScheduled`
//! events; on recovery the heap is rebuilt from flow state.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

/// One scheduled retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    /// Owning flow
    pub flow_id: String,

    /// Step whose work item retries
    pub step_id: String,

    /// Work-item token
    pub token: Uuid,

    /// When the retry becomes due
    pub due_at: DateTime<Utc>,
}

impl Ord for RetryEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due_at
            .cmp(&other.due_at)
            .then_with(|| self.flow_id.cmp(&other.flow_id))
            .then_with(|| self.step_id.cmp(&other.step_id))
            .then_with(|| self.token.cmp(&other.token))
    }
}

impl PartialOrd for RetryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

enum Command {
    Schedule(RetryEntry),
    CancelStep { flow_id: String, step_id: String },
    CancelFlow { flow_id: String },
    Shutdown,
}

/// Handle to the retry timer task
#[derive(Clone)]
pub struct RetryQueue {
    commands: mpsc::UnboundedSender<Command>,
}

impl RetryQueue {
    /// Spawn the owning task. Due entries are delivered on the returned
    /// receiver for the scheduler to re-dispatch.
    #[must_use]
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<RetryEntry>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (due_tx, due_rx) = mpsc::unbounded_channel();

        tokio::spawn(run(command_rx, due_tx));

        (
            Self {
                commands: command_tx,
            },
            due_rx,
        )
    }

    /// Enqueue a retry
    pub fn schedule(&self, entry: RetryEntry) {
        let _ = self.commands.send(Command::Schedule(entry));
    }

    /// Drop every scheduled retry for one step
    pub fn cancel_step(&self, flow_id: &str, step_id: &str) {
        let _ = self.commands.send(Command::CancelStep {
            flow_id: flow_id.to_string(),
            step_id: step_id.to_string(),
        });
    }

    /// Drop every scheduled retry for one flow
    pub fn cancel_flow(&self, flow_id: &str) {
        let _ = self.commands.send(Command::CancelFlow {
            flow_id: flow_id.to_string(),
        });
    }

    /// Stop the timer task
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

async fn run(
    mut commands: mpsc::UnboundedReceiver<Command>,
    due_tx: mpsc::UnboundedSender<RetryEntry>,
) {
    let mut heap: BinaryHeap<Reverse<RetryEntry>> = BinaryHeap::new();
    let mut index: HashMap<(String, String), HashSet<Uuid>> = HashMap::new();

    loop {
        // Drain everything that is already due
        let now = Utc::now();
        while heap.peek().is_some_and(|Reverse(e)| e.due_at <= now) {
            let Some(Reverse(entry)) = heap.pop() else {
                break;
            };
            let path = (entry.flow_id.clone(), entry.step_id.clone());
            let live = index
                .get_mut(&path)
                .is_some_and(|tokens| tokens.remove(&entry.token));
            if live {
                tracing::debug!(flow_id = %entry.flow_id, step_id = %entry.step_id, "retry due");
                let _ = due_tx.send(entry);
            }
        }

        let sleep_for = heap.peek().map_or(chrono::Duration::days(1), |Reverse(e)| {
            (e.due_at - Utc::now()).max(chrono::Duration::zero())
        });
        let sleep_for = sleep_for.to_std().unwrap_or_default();

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Schedule(entry)) => {
                    index
                        .entry((entry.flow_id.clone(), entry.step_id.clone()))
                        .or_default()
                        .insert(entry.token);
                    heap.push(Reverse(entry));
                }
                Some(Command::CancelStep { flow_id, step_id }) => {
                    index.remove(&(flow_id, step_id));
                }
                Some(Command::CancelFlow { flow_id }) => {
                    index.retain(|(flow, _), _| flow != &flow_id);
                }
                Some(Command::Shutdown) | None => return,
            },
            () = tokio::time::sleep(sleep_for) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(flow: &str, step: &str, due_in_ms: i64) -> RetryEntry {
        RetryEntry {
            flow_id: flow.to_string(),
            step_id: step.to_string(),
            token: Uuid::new_v4(),
            due_at: Utc::now() + chrono::Duration::milliseconds(due_in_ms),
        }
    }

    #[tokio::test]
    async fn test_due_entry_is_delivered() {
        let (queue, mut due) = RetryQueue::spawn();
        queue.schedule(entry("f1", "s1", 20));

        let delivered = tokio::time::timeout(Duration::from_secs(2), due.recv())
            .await
            .expect("entry should come due")
            .unwrap();
        assert_eq!(delivered.flow_id, "f1");
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_earliest_first() {
        let (queue, mut due) = RetryQueue::spawn();
        queue.schedule(entry("f1", "late", 120));
        queue.schedule(entry("f1", "early", 20));

        let first = tokio::time::timeout(Duration::from_secs(2), due.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.step_id, "early");

        let second = tokio::time::timeout(Duration::from_secs(2), due.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.step_id, "late");
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_step_drops_entries() {
        let (queue, mut due) = RetryQueue::spawn();
        queue.schedule(entry("f1", "doomed", 50));
        queue.cancel_step("f1", "doomed");
        queue.schedule(entry("f1", "kept", 80));

        let delivered = tokio::time::timeout(Duration::from_secs(2), due.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.step_id, "kept");
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_flow_drops_all_steps() {
        let (queue, mut due) = RetryQueue::spawn();
        queue.schedule(entry("dead", "a", 30));
        queue.schedule(entry("dead", "b", 40));
        queue.schedule(entry("live", "c", 70));

        let delivered = tokio::time::timeout(Duration::from_secs(2), due.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.flow_id, "live");
        queue.shutdown();
    }
}
