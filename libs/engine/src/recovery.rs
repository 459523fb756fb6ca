//! Startup recovery
//!
//! Rehydrates the catalog, resumes every non-terminal flow from the active
//! index, re-dispatches in-flight sync/script work, leaves async work to its
//! pending webhook, and rebuilds the retry queue from persisted schedules.

use std::sync::Arc;

use argyll_domain::StepKind;

use crate::events::AggregateRef;
use crate::flow::FlowError;
use crate::retry::RetryEntry;
use crate::scheduler::{PartitionState, Scheduler, StartMode};

/// What recovery found and resumed
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    /// Non-terminal flows resumed
    pub flows_resumed: usize,

    /// In-flight work items re-dispatched
    pub work_redispatched: usize,

    /// Async work items left awaiting their webhook
    pub work_awaiting_webhook: usize,

    /// Retry schedules rebuilt
    pub retries_rescheduled: usize,
}

/// Run the startup pass. Replays the catalog, then walks the active-flow
/// index resuming execution.
pub async fn recover(scheduler: &Arc<Scheduler>) -> Result<RecoveryReport, FlowError> {
    let mut report = RecoveryReport::default();

    // Rehydrate the catalog aggregate by replay
    if let Err(e) = scheduler.catalog.snapshot().await {
        tracing::error!(error = %e, "catalog rehydration failed");
    }

    let active: Vec<String> = scheduler
        .partition
        .get(&AggregateRef::partition())
        .await?
        .map(|(state, _): (PartitionState, u64)| state.active.into_iter().collect())
        .unwrap_or_default();

    for flow_id in active {
        let Some((state, _)) = scheduler.flows.get(&Scheduler::flow_ref(&flow_id)).await? else {
            tracing::warn!(flow_id, "active index references a missing flow");
            continue;
        };

        if state.is_terminal() {
            scheduler.try_deactivate(&flow_id, &state).await;
            continue;
        }
        report.flows_resumed += 1;

        // Re-dispatch work that was in flight when the engine stopped.
        // Async items keep their persisted Active state: the webhook is
        // still the completion path, so they are not re-invoked.
        for (step_id, token) in state.active_work() {
            let Some(step) = state.plan.steps.get(&step_id).cloned() else {
                continue;
            };
            if step.kind() == StepKind::AsyncHttp {
                report.work_awaiting_webhook += 1;
                continue;
            }
            let Some(item) = state.work_item(&step_id, token) else {
                continue;
            };
            report.work_redispatched += 1;

            let scheduler = Arc::clone(scheduler);
            let flow_id = flow_id.clone();
            let inputs = item.inputs.clone();
            let binding = item.binding.clone();
            tokio::spawn(async move {
                scheduler
                    .run_work_item(&flow_id, step, token, inputs, binding, StartMode::Resume)
                    .await;
            });
        }

        // Replay outstanding retry schedules; overdue entries fire at once
        for (step_id, token, due_at) in state.pending_retries() {
            scheduler.retries.schedule(RetryEntry {
                flow_id: flow_id.clone(),
                step_id,
                token,
                due_at,
            });
            report.retries_rescheduled += 1;
        }

        // Pick up anything that became ready while the engine was down
        let scheduler = Arc::clone(scheduler);
        let flow_id = flow_id.clone();
        tokio::spawn(async move {
            scheduler.advance(&flow_id).await;
        });
    }

    tracing::info!(
        flows = report.flows_resumed,
        redispatched = report.work_redispatched,
        retries = report.retries_rescheduled,
        "recovery complete"
    );
    Ok(report)
}
