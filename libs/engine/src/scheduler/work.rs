//! Work-item execution and result application
//!
//! Invocation happens outside any aggregate lock: a transaction records
//! intent (`WorkStarted`), the invoker or script runtime does the long I/O,
//! and a second transaction applies the outcome together with aggregation,
//! retry scheduling, cascade analysis, and the flow verdict.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use argyll_domain::{remap_args, Args, Step, StepBody, StepResult, Value};

use crate::events::{AggregateState, Envelope, Event};
use crate::flow::{FlowError, FlowState, WorkStatus};
use crate::invoker::{
    webhook_url, InvocationOutcome, InvocationRequest, InvocationTarget, InvokeError,
};
use crate::plan::generate_plan;
use crate::retry::RetryEntry;

use super::rules::{self, FlowVerdict};
use super::{Scheduler, StartMode};

/// Interpreted outcome of one work-item execution
#[derive(Debug, Clone)]
pub enum WorkOutcome {
    /// The item succeeded with these outputs
    Success(Args),

    /// Transient failure: the retry path engages
    Transient(String),

    /// Permanent failure: the item fails immediately
    Permanent(String),
}

/// Post-commit actions decided inside the result transaction
#[derive(Default)]
struct ResultActions {
    applied: bool,
    step_completed: bool,
    step_failed: bool,
    schedule: Option<RetryEntry>,
    verdict: Option<FlowVerdict>,
    progressed: bool,
}

impl Scheduler {
    // =========================================================================
    // Work-item execution
    // =========================================================================

    /// Execute one work item end to end.
    ///
    /// Acquires the step's parallelism slot, re-checks the predicate for
    /// for-each items, records `WorkStarted`, consults the memoization
    /// cache, invokes by kind, and applies the result.
    pub(crate) fn run_work_item<'a>(
        self: &'a Arc<Self>,
        flow_id: &'a str,
        step: Step,
        token: Uuid,
        inputs: Args,
        binding: BTreeMap<String, Value>,
        mode: StartMode,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        let _guard = self.track_task();

        let merged = step.work.merged_with(&self.settings.retry_defaults);
        let semaphore = self
            .semaphore(flow_id, &step.id, merged.parallelism)
            .await;
        let Ok(_permit) = semaphore.acquire_owned().await else {
            return;
        };

        // Fine-grained for-each skipping: the predicate is re-evaluated with
        // the item's own inputs
        let mut item_outcome: Option<WorkOutcome> = None;
        if !binding.is_empty() {
            if let Some(predicate) = &step.predicate {
                item_outcome = match self.scripts.eval_predicate(predicate, &inputs).await {
                    Ok(true) => None,
                    Ok(false) => Some(WorkOutcome::Success(Args::new())),
                    Err(e) => Some(WorkOutcome::Permanent(format!("predicate error: {e}"))),
                };
            }
        }

        if mode != StartMode::Resume {
            let replaces = match mode {
                StartMode::Retry { replaces } => replaces,
                _ => None,
            };
            let started = self.mark_started(flow_id, &step.id, token, replaces).await;
            if !started {
                return;
            }
        }

        if let Some(outcome) = item_outcome {
            let _ = self
                .apply_work_result(flow_id, &step, token, &inputs, outcome, false)
                .await;
            return;
        }

        // Memoized steps skip invocation on a cache hit
        if step.memoizable {
            if let Some(outputs) = self.memo.lookup(&step, &inputs) {
                tracing::debug!(flow_id, step_id = %step.id, "memoization hit");
                let _ = self
                    .apply_work_result(
                        flow_id,
                        &step,
                        token,
                        &inputs,
                        WorkOutcome::Success(outputs),
                        false,
                    )
                    .await;
                return;
            }
        }

        let Some(outcome) = self.invoke_step(flow_id, &step, token, &inputs).await else {
            // Async invocation acknowledged: the webhook completes it later
            return;
        };

        let _ = self
            .apply_work_result(flow_id, &step, token, &inputs, outcome, false)
            .await;
        })
    }

    /// Record `WorkStarted`, tolerating stale dispatches (the step may have
    /// failed or the flow finished while we awaited the semaphore)
    async fn mark_started(
        &self,
        flow_id: &str,
        step_id: &str,
        token: Uuid,
        replaces: Option<Uuid>,
    ) -> bool {
        let result: Result<bool, FlowError> = self
            .flows
            .apply(
                &Self::flow_ref(flow_id),
                |state: &FlowState, _version| {
                    if state.is_terminal() {
                        return Ok((vec![], false));
                    }
                    let lookup_token = replaces.unwrap_or(token);
                    let pending = state
                        .work_item(step_id, lookup_token)
                        .is_some_and(|item| item.status == WorkStatus::Pending);
                    if !pending {
                        return Ok((vec![], false));
                    }
                    Ok((
                        vec![Event::WorkStarted {
                            flow_id: state.id.clone(),
                            step_id: step_id.to_string(),
                            token,
                            replaces: replaces.filter(|old| *old != token),
                        }],
                        true,
                    ))
                },
            )
            .await;

        result.unwrap_or(false)
    }

    // =========================================================================
    // Invocation by kind
    // =========================================================================

    /// Invoke the step body. Returns `None` when an async invocation was
    /// acknowledged and the completion will arrive through the webhook.
    async fn invoke_step(
        self: &Arc<Self>,
        flow_id: &str,
        step: &Step,
        token: Uuid,
        inputs: &Args,
    ) -> Option<WorkOutcome> {
        let timeout = step
            .body
            .timeout_ms()
            .map_or(self.settings.step_timeout, Duration::from_millis);

        match &step.body {
            StepBody::Script { script } => {
                Some(match self.scripts.eval_script(script, inputs).await {
                    Ok(outputs) => WorkOutcome::Success(outputs),
                    Err(e) => WorkOutcome::Permanent(e.to_string()),
                })
            }

            StepBody::SyncHttp { endpoint, .. } => {
                let request = InvocationRequest {
                    flow_id: flow_id.to_string(),
                    step_id: step.id.clone(),
                    token,
                    target: InvocationTarget::SyncHttp {
                        endpoint: endpoint.clone(),
                    },
                    arguments: inputs.clone(),
                    timeout,
                };
                Some(self.call_invoker(request, timeout).await)
            }

            StepBody::AsyncHttp { endpoint, .. } => {
                let request = InvocationRequest {
                    flow_id: flow_id.to_string(),
                    step_id: step.id.clone(),
                    token,
                    target: InvocationTarget::AsyncHttp {
                        endpoint: endpoint.clone(),
                        webhook_url: webhook_url(
                            &self.settings.webhook_base,
                            flow_id,
                            &step.id,
                            token,
                        ),
                    },
                    arguments: inputs.clone(),
                    timeout,
                };
                match tokio::time::timeout(timeout, self.invoker.invoke(request)).await {
                    Ok(Ok(InvocationOutcome::Accepted)) => None,
                    Ok(Ok(InvocationOutcome::Completed(result))) => {
                        Some(interpret_result(result))
                    }
                    Ok(Err(e)) => Some(interpret_error(e)),
                    Err(_) => Some(WorkOutcome::Transient("invocation timed out".to_string())),
                }
            }

            StepBody::Flow {
                goals,
                input_map,
                output_map,
            } => Some(
                self.run_child_flow(flow_id, step, inputs, goals, input_map, output_map)
                    .await,
            ),
        }
    }

    async fn call_invoker(&self, request: InvocationRequest, timeout: Duration) -> WorkOutcome {
        match tokio::time::timeout(timeout, self.invoker.invoke(request)).await {
            Ok(Ok(InvocationOutcome::Completed(result))) => interpret_result(result),
            Ok(Ok(InvocationOutcome::Accepted)) => WorkOutcome::Permanent(
                "synchronous endpoint returned an asynchronous acknowledgement".to_string(),
            ),
            Ok(Err(e)) => interpret_error(e),
            Err(_) => WorkOutcome::Transient("invocation timed out".to_string()),
        }
    }

    /// Run a child flow and map its terminal state back into this work item
    async fn run_child_flow(
        self: &Arc<Self>,
        flow_id: &str,
        step: &Step,
        inputs: &Args,
        goals: &[String],
        input_map: &BTreeMap<String, String>,
        output_map: &BTreeMap<String, String>,
    ) -> WorkOutcome {
        let child_id = format!("{flow_id}.{}.{}", step.id, Uuid::new_v4());
        let init = remap_args(input_map, inputs);

        let catalog_state = match self.catalog.snapshot().await {
            Ok(state) => state,
            Err(e) => return WorkOutcome::Permanent(format!("catalog unavailable: {e}")),
        };
        let plan = match generate_plan(&catalog_state.steps, goals, &init) {
            Ok(plan) => plan,
            Err(e) => return WorkOutcome::Permanent(format!("child flow planning failed: {e}")),
        };

        // Subscribe before starting so the terminal event cannot be missed
        let mut subscription = self
            .hub
            .subscribe(
                &crate::events::AggregateRef::flow(&child_id).topic(),
                vec!["flow_completed".to_string(), "flow_failed".to_string()],
            )
            .await;

        if let Err(e) = self.start_flow(&child_id, plan, init).await {
            return WorkOutcome::Permanent(format!("child flow start failed: {e}"));
        }

        loop {
            match subscription.recv().await {
                Some(stored) => match stored.event() {
                    Event::FlowCompleted { .. } => break,
                    Event::FlowFailed { error, .. } => {
                        return WorkOutcome::Permanent(format!(
                            "child flow '{child_id}' failed: {error}"
                        ));
                    }
                    _ => {}
                },
                None => {
                    return WorkOutcome::Transient(format!(
                        "child flow '{child_id}' subscription closed"
                    ));
                }
            }
        }

        // Collect the child's attributes and re-key them for the parent
        match self.flows.get(&Self::flow_ref(&child_id)).await {
            Ok(Some((child, _))) => {
                let child_attrs: Args = child
                    .attributes
                    .iter()
                    .map(|(name, attr)| (name.clone(), attr.value.clone()))
                    .collect();
                WorkOutcome::Success(remap_args(output_map, &child_attrs))
            }
            _ => WorkOutcome::Permanent(format!("child flow '{child_id}' state unavailable")),
        }
    }

    // =========================================================================
    // Result application
    // =========================================================================

    /// Apply a work-item outcome in one transaction: the work event, output
    /// aggregation, retry scheduling, step terminal events, the cascade, and
    /// the flow verdict.
    ///
    /// With `strict` set, a stale or duplicate completion is surfaced as
    /// `InvalidTransition` (the webhook idempotency signal); otherwise it is
    /// silently dropped.
    pub(crate) async fn apply_work_result(
        self: &Arc<Self>,
        flow_id: &str,
        step: &Step,
        token: Uuid,
        inputs: &Args,
        outcome: WorkOutcome,
        strict: bool,
    ) -> Result<bool, FlowError> {
        let merged = step.work.merged_with(&self.settings.retry_defaults);

        let actions: ResultActions = self
            .flows
            .apply(&Self::flow_ref(flow_id), |state: &FlowState, _version| {
                plan_result(state, step, token, &outcome, &merged, strict)
            })
            .await?;

        if !actions.applied {
            return Ok(false);
        }

        if let WorkOutcome::Success(outputs) = &outcome {
            if step.memoizable {
                self.memo.store(step, inputs, outputs);
            }
        }

        if let Some(entry) = actions.schedule {
            self.retries.schedule(entry);
        }
        if actions.step_failed {
            self.retries.cancel_step(flow_id, &step.id);
        }

        match &actions.verdict {
            Some(FlowVerdict::Failed { .. }) => self.retries.cancel_flow(flow_id),
            Some(FlowVerdict::Completed) | None => {}
        }

        // A trailing work event may have been the last thing holding a
        // terminal flow in the active set
        if let Ok(Some((state, _))) = self.flows.get(&Self::flow_ref(flow_id)).await {
            if state.is_terminal() {
                self.try_deactivate(flow_id, &state).await;
            } else if actions.progressed {
                // New attributes may have made downstream steps ready
                let scheduler = Arc::clone(self);
                let flow_id = flow_id.to_string();
                tokio::spawn(async move {
                    scheduler.advance(&flow_id).await;
                });
            }
        }

        let _ = actions.step_completed;
        Ok(true)
    }

    // =========================================================================
    // External completion (webhook / sync response path)
    // =========================================================================

    /// Complete a work item from an externally delivered `StepResult`.
    ///
    /// Validates the work-item state and produces the matching
    /// `WorkSucceeded`/`WorkFailed`; a duplicate delivery is rejected with
    /// `InvalidTransition` and produces no events.
    pub async fn complete_work(
        self: &Arc<Self>,
        flow_id: &str,
        step_id: &str,
        token: Uuid,
        result: StepResult,
    ) -> Result<(), FlowError> {
        let state = self
            .flows
            .get(&Self::flow_ref(flow_id))
            .await?
            .map(|(state, _)| state)
            .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))?;

        let Some(step) = state.plan.steps.get(step_id).cloned() else {
            return Err(FlowError::InvalidTransition(format!(
                "step '{step_id}' is not part of flow '{flow_id}'"
            )));
        };
        let inputs = state
            .work_item(step_id, token)
            .map(|item| item.inputs.clone())
            .ok_or_else(|| {
                FlowError::InvalidTransition(format!("unknown work token {token}"))
            })?;

        let outcome = interpret_result(result);
        self.apply_work_result(flow_id, &step, token, &inputs, outcome, true)
            .await?;
        Ok(())
    }

    /// Current state of a flow
    pub async fn get_flow(&self, flow_id: &str) -> Result<FlowState, FlowError> {
        self.flows
            .get(&Self::flow_ref(flow_id))
            .await?
            .map(|(state, _)| state)
            .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))
    }
}

// =============================================================================
// Pure result planning
// =============================================================================

fn interpret_result(result: StepResult) -> WorkOutcome {
    if result.success {
        WorkOutcome::Success(result.outputs_or_default())
    } else {
        WorkOutcome::Permanent(
            result
                .error
                .unwrap_or_else(|| "step reported failure".to_string()),
        )
    }
}

fn interpret_error(error: InvokeError) -> WorkOutcome {
    match error {
        InvokeError::Transient(e) => WorkOutcome::Transient(e),
        InvokeError::Timeout => WorkOutcome::Transient("invocation timed out".to_string()),
        InvokeError::Permanent(e) => WorkOutcome::Permanent(e),
    }
}

/// Compute the event batch for one work-item outcome
#[allow(clippy::too_many_lines)]
fn plan_result(
    state: &FlowState,
    step: &Step,
    token: Uuid,
    outcome: &WorkOutcome,
    merged: &argyll_domain::WorkConfig,
    strict: bool,
) -> Result<(Vec<Event>, ResultActions), FlowError> {
    let mut scratch = state.clone();
    let mut events: Vec<Event> = Vec::new();
    let mut actions = ResultActions::default();

    let Some(item) = state.work_item(&step.id, token) else {
        if strict {
            return Err(FlowError::InvalidTransition(format!(
                "unknown work token {token} on step '{}'",
                step.id
            )));
        }
        return Ok((vec![], actions));
    };

    let mut push = |scratch: &mut FlowState, events: &mut Vec<Event>, event: Event| -> bool {
        let envelope = Envelope::now(event.clone());
        match scratch.fold(&envelope) {
            Ok(()) => {
                events.push(event);
                true
            }
            Err(e) => {
                tracing::debug!(step_id = %step.id, error = %e, "result event dropped");
                false
            }
        }
    };

    match outcome {
        WorkOutcome::Success(outputs) => {
            if !matches!(item.status, WorkStatus::Active | WorkStatus::NotCompleted) {
                if strict {
                    return Err(FlowError::InvalidTransition(format!(
                        "work {token} is already {:?}",
                        item.status
                    )));
                }
                return Ok((vec![], actions));
            }

            push(
                &mut scratch,
                &mut events,
                Event::WorkSucceeded {
                    flow_id: state.id.clone(),
                    step_id: step.id.clone(),
                    token,
                    outputs: outputs.clone(),
                },
            );
            actions.applied = true;

            let all_succeeded = scratch
                .execution(&step.id)
                .is_some_and(|e| {
                    e.work_items
                        .values()
                        .all(|i| i.status == WorkStatus::Succeeded)
                });

            // This success may have been the last open item of a step that
            // already lost a sibling: the step fails once everything settles
            let sibling_failure = scratch.execution(&step.id).and_then(|e| {
                let all_terminal = e.work_items.values().all(|i| i.status.is_terminal());
                if !all_terminal {
                    return None;
                }
                e.work_items
                    .values()
                    .find(|i| i.status == WorkStatus::Failed)
                    .map(|i| {
                        i.error
                            .clone()
                            .unwrap_or_else(|| "work item failed".to_string())
                    })
            });

            if let Some(error) = sibling_failure {
                push(
                    &mut scratch,
                    &mut events,
                    Event::StepFailed {
                        flow_id: state.id.clone(),
                        step_id: step.id.clone(),
                        error,
                    },
                );
                actions.step_failed = true;
            } else if all_succeeded {
                let aggregated = rules::aggregate_outputs(&scratch, step);

                // Attribute sets precede the step's terminal event
                for name in step.outputs() {
                    if let Some(value) = aggregated.get(name) {
                        push(
                            &mut scratch,
                            &mut events,
                            Event::AttributeSet {
                                flow_id: state.id.clone(),
                                name: name.to_string(),
                                value: value.clone(),
                                provider: Some(step.id.clone()),
                            },
                        );
                    }
                }

                push(
                    &mut scratch,
                    &mut events,
                    Event::StepCompleted {
                        flow_id: state.id.clone(),
                        step_id: step.id.clone(),
                        outputs: aggregated,
                    },
                );
                actions.step_completed = true;
                actions.progressed = true;
            }
        }

        WorkOutcome::Transient(error) => {
            if item.status != WorkStatus::Active {
                if strict {
                    return Err(FlowError::InvalidTransition(format!(
                        "work {token} is not active"
                    )));
                }
                return Ok((vec![], actions));
            }

            push(
                &mut scratch,
                &mut events,
                Event::WorkNotCompleted {
                    flow_id: state.id.clone(),
                    step_id: step.id.clone(),
                    token,
                    error: error.clone(),
                },
            );
            actions.applied = true;

            let exhausted = merged.retries_remaining(item.retry_count) == Some(0);
            if exhausted {
                fail_work(
                    &mut scratch,
                    &mut events,
                    &mut push,
                    state,
                    step,
                    token,
                    &format!("retries exhausted: {error}"),
                    &mut actions,
                );
            } else {
                let attempt = item.retry_count + 1;
                let delay = merged.delay_ms(attempt);
                let due_at = Utc::now() + chrono::Duration::milliseconds(delay as i64);
                push(
                    &mut scratch,
                    &mut events,
                    Event::RetryScheduled {
                        flow_id: state.id.clone(),
                        step_id: step.id.clone(),
                        token,
                        attempt,
                        due_at,
                    },
                );
                actions.schedule = Some(RetryEntry {
                    flow_id: state.id.clone(),
                    step_id: step.id.clone(),
                    token,
                    due_at,
                });
            }
        }

        WorkOutcome::Permanent(error) => {
            if !matches!(item.status, WorkStatus::Active | WorkStatus::NotCompleted) {
                if strict {
                    return Err(FlowError::InvalidTransition(format!(
                        "work {token} is already {:?}",
                        item.status
                    )));
                }
                return Ok((vec![], actions));
            }

            fail_work(
                &mut scratch,
                &mut events,
                &mut push,
                state,
                step,
                token,
                error,
                &mut actions,
            );
            actions.applied = true;
        }
    }

    // Cascade unreachable steps, then decide the flow verdict
    if actions.step_failed || actions.step_completed || actions.applied {
        for step_id in rules::unreachable_steps(&scratch) {
            push(
                &mut scratch,
                &mut events,
                Event::StepFailed {
                    flow_id: state.id.clone(),
                    step_id,
                    error: rules::UNREACHABLE_INPUT.to_string(),
                },
            );
        }
        if let Some(verdict) = rules::flow_verdict(&scratch) {
            let event = match &verdict {
                FlowVerdict::Completed => Event::FlowCompleted {
                    flow_id: state.id.clone(),
                },
                FlowVerdict::Failed { error } => Event::FlowFailed {
                    flow_id: state.id.clone(),
                    error: error.clone(),
                },
            };
            if push(&mut scratch, &mut events, event) {
                actions.verdict = Some(verdict);
            }
        }

        // A failed flow cancels parked retries so it can deactivate
        if matches!(actions.verdict, Some(FlowVerdict::Failed { .. })) {
            for (step_id, cancel_token) in rules::cancellable_work(&scratch) {
                push(
                    &mut scratch,
                    &mut events,
                    Event::WorkFailed {
                        flow_id: state.id.clone(),
                        step_id: step_id.clone(),
                        token: cancel_token,
                        error: rules::RETRY_CANCELED.to_string(),
                    },
                );
                let all_terminal = scratch.execution(&step_id).is_some_and(|e| {
                    e.work_items.values().all(|i| i.status.is_terminal())
                });
                if all_terminal {
                    push(
                        &mut scratch,
                        &mut events,
                        Event::StepFailed {
                            flow_id: state.id.clone(),
                            step_id,
                            error: rules::RETRY_CANCELED.to_string(),
                        },
                    );
                }
            }
        }
    }

    Ok((events, actions))
}

/// Fail one work item and, once every item of the step is terminal, the
/// step itself
#[allow(clippy::too_many_arguments)]
fn fail_work(
    scratch: &mut FlowState,
    events: &mut Vec<Event>,
    push: &mut impl FnMut(&mut FlowState, &mut Vec<Event>, Event) -> bool,
    state: &FlowState,
    step: &Step,
    token: Uuid,
    error: &str,
    actions: &mut ResultActions,
) {
    push(
        scratch,
        events,
        Event::WorkFailed {
            flow_id: state.id.clone(),
            step_id: step.id.clone(),
            token,
            error: error.to_string(),
        },
    );

    let all_terminal = scratch.execution(&step.id).is_some_and(|e| {
        e.work_items
            .values()
            .all(|item| item.status.is_terminal())
    });
    if all_terminal {
        push(
            scratch,
            events,
            Event::StepFailed {
                flow_id: state.id.clone(),
                step_id: step.id.clone(),
                error: error.to_string(),
            },
        );
        actions.step_failed = true;
    }
}
