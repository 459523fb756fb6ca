//! Scheduler / work executor
//!
//! The central driver: derives ready steps from flow state, dispatches them
//! inside aggregate transactions, executes work items outside any lock, and
//! applies results with retry, cascade, and completion semantics. All state
//! changes go through the flow aggregate's apply loop; the scheduler itself
//! holds only transient handles (semaphores, the retry queue, task counts).

pub mod partition;
pub mod rules;
mod work;

pub use partition::PartitionState;
pub use work::WorkOutcome;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use argyll_domain::{Args, Step, WorkConfig};
use argyll_script::ScriptRuntime;

use crate::catalog::Catalog;
use crate::events::{AggregateCache, AggregateRef, AggregateState, Event, Hub};
use crate::flow::{ExecStatus, FlowError, FlowState};
use crate::invoker::StepInvoker;
use crate::memo::MemoCache;
use crate::plan::ExecutionPlan;
use crate::retry::{RetryEntry, RetryQueue};

use rules::{FlowVerdict, PREDICATE_FALSE};

// =============================================================================
// Settings
// =============================================================================

/// Scheduler tuning knobs
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Base URL for async webhook callbacks
    pub webhook_base: String,

    /// Default per-invocation deadline when a step omits one
    pub step_timeout: Duration,

    /// Engine-wide retry defaults, used for zero-valued step fields
    pub retry_defaults: WorkConfig,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            webhook_base: "http://localhost:8080".to_string(),
            step_timeout: Duration::from_secs(30),
            retry_defaults: WorkConfig {
                max_retries: 3,
                init_backoff_ms: 1_000,
                max_backoff_ms: 60_000,
                backoff: argyll_domain::BackoffKind::Exponential,
                parallelism: 1,
            },
        }
    }
}

// =============================================================================
// Dispatch bookkeeping
// =============================================================================

/// Pre-computed decision for one ready step (predicates are evaluated
/// before the dispatch transaction so the mutator stays pure)
enum Decision {
    Start { step: Step, inputs: Args },
    Skip { step_id: String, reason: String },
    Fail { step_id: String, error: String },
}

/// One dispatched work item handed to the executor after commit
struct WorkHandle {
    step: Step,
    token: Uuid,
    inputs: Args,
    binding: std::collections::BTreeMap<String, argyll_domain::Value>,
}

/// What a dispatch transaction produced
#[derive(Default)]
struct DispatchResult {
    handles: Vec<WorkHandle>,
    emitted: usize,
    verdict: Option<FlowVerdict>,
}

/// How a work item is being started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartMode {
    /// First dispatch: the item is Pending with no retry history
    Fresh,

    /// Retry re-dispatch; `replaces` carries the retired token when the
    /// step is not memoizable
    Retry { replaces: Option<Uuid> },

    /// Recovery of an item already Active in the log
    Resume,
}

// =============================================================================
// Scheduler
// =============================================================================

/// The work executor driving all flows
pub struct Scheduler {
    pub(crate) flows: AggregateCache<FlowState>,
    pub(crate) partition: AggregateCache<PartitionState>,
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) hub: Arc<Hub>,
    pub(crate) scripts: Arc<ScriptRuntime>,
    pub(crate) memo: Arc<MemoCache>,
    pub(crate) retries: RetryQueue,
    pub(crate) invoker: Arc<dyn StepInvoker>,
    pub(crate) settings: SchedulerSettings,
    semaphores: Mutex<HashMap<(String, String), Arc<Semaphore>>>,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
}

impl Scheduler {
    /// Create the scheduler and spawn its retry-consumer task
    #[must_use]
    pub fn new(
        flows: AggregateCache<FlowState>,
        partition: AggregateCache<PartitionState>,
        catalog: Arc<Catalog>,
        hub: Arc<Hub>,
        scripts: Arc<ScriptRuntime>,
        memo: Arc<MemoCache>,
        invoker: Arc<dyn StepInvoker>,
        settings: SchedulerSettings,
    ) -> Arc<Self> {
        let (retries, mut due_rx) = RetryQueue::spawn();

        let scheduler = Arc::new(Self {
            flows,
            partition,
            catalog,
            hub,
            scripts,
            memo,
            retries,
            invoker,
            settings,
            semaphores: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
        });

        let weak = Arc::downgrade(&scheduler);
        tokio::spawn(async move {
            while let Some(entry) = due_rx.recv().await {
                let Some(scheduler) = weak.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    scheduler.redispatch(entry).await;
                });
            }
        });

        scheduler
    }

    pub(crate) fn flow_ref(flow_id: &str) -> AggregateRef {
        AggregateRef::flow(flow_id)
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub(crate) fn track_task(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { counter: &self.in_flight }
    }

    /// Per-(flow, step) parallelism gate
    pub(crate) async fn semaphore(
        &self,
        flow_id: &str,
        step_id: &str,
        parallelism: usize,
    ) -> Arc<Semaphore> {
        let key = (flow_id.to_string(), step_id.to_string());
        let mut semaphores = self.semaphores.lock().await;
        Arc::clone(
            semaphores
                .entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(parallelism.max(1)))),
        )
    }

    // =========================================================================
    // Flow start
    // =========================================================================

    /// Start a flow from a previously generated plan
    pub async fn start_flow(
        self: &Arc<Self>,
        flow_id: &str,
        plan: ExecutionPlan,
        init: Args,
    ) -> Result<(), FlowError> {
        let missing = plan.missing_required(&init);
        if !missing.is_empty() {
            return Err(FlowError::MissingRequired(missing));
        }

        let flow_id_owned = flow_id.to_string();
        self.flows
            .apply(&Self::flow_ref(flow_id), |_state: &FlowState, version| {
                if version > 0 {
                    return Err(FlowError::DuplicateFlow(flow_id_owned.clone()));
                }
                Ok((
                    vec![Event::FlowStarted {
                        flow_id: flow_id_owned.clone(),
                        plan: plan.clone(),
                        init: init.clone(),
                    }],
                    (),
                ))
            })
            .await?;

        let flow_id_owned = flow_id.to_string();
        self.partition
            .apply(
                &AggregateRef::partition(),
                |state: &PartitionState, _version| {
                    if state.is_active(&flow_id_owned) {
                        return Ok((vec![], ()));
                    }
                    Ok::<_, FlowError>((
                        vec![Event::FlowActivated {
                            flow_id: flow_id_owned.clone(),
                        }],
                        (),
                    ))
                },
            )
            .await?;

        tracing::info!(flow_id, "flow started");
        self.advance(flow_id).await;
        Ok(())
    }

    // =========================================================================
    // Advance: dispatch everything that is ready
    // =========================================================================

    /// Drive the flow forward until no dispatch transaction emits events.
    ///
    /// Predicates are evaluated before each transaction; the mutator
    /// re-validates against current state, so a stale decision degrades to a
    /// no-op rather than a double dispatch.
    pub async fn advance(self: &Arc<Self>, flow_id: &str) {
        loop {
            let state = match self.flows.get(&Self::flow_ref(flow_id)).await {
                Ok(Some((state, _))) => state,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(flow_id, error = %e, "flow load failed");
                    return;
                }
            };

            if state.is_terminal() {
                self.try_deactivate(flow_id, &state).await;
                return;
            }
            if !self.is_accepting() {
                return;
            }

            let decisions = self.decide(&state).await;
            let result = self.commit_dispatch(flow_id, &decisions).await;

            let Ok(result) = result else {
                tracing::error!(flow_id, "dispatch transaction failed");
                return;
            };

            for handle in result.handles {
                let scheduler = Arc::clone(self);
                let flow_id = flow_id.to_string();
                tokio::spawn(async move {
                    scheduler
                        .run_work_item(
                            &flow_id,
                            handle.step,
                            handle.token,
                            handle.inputs,
                            handle.binding,
                            StartMode::Fresh,
                        )
                        .await;
                });
            }

            match result.verdict {
                Some(FlowVerdict::Failed { .. }) => {
                    self.retries.cancel_flow(flow_id);
                }
                Some(FlowVerdict::Completed) | None => {}
            }

            if result.emitted == 0 {
                return;
            }
        }
    }

    /// Evaluate predicates for every ready step
    async fn decide(&self, state: &FlowState) -> Vec<Decision> {
        let mut decisions = Vec::new();

        for step_id in rules::ready_steps(state) {
            let Some(step) = state.plan.steps.get(&step_id).cloned() else {
                continue;
            };
            let inputs = rules::gather_inputs(state, &step);

            let decision = match &step.predicate {
                None => Decision::Start { step, inputs },
                Some(predicate) => {
                    match self.scripts.eval_predicate(predicate, &inputs).await {
                        Ok(true) => Decision::Start { step, inputs },
                        Ok(false) => Decision::Skip {
                            step_id,
                            reason: PREDICATE_FALSE.to_string(),
                        },
                        Err(e) => Decision::Fail {
                            step_id,
                            error: format!("predicate error: {e}"),
                        },
                    }
                }
            };
            decisions.push(decision);
        }

        decisions
    }

    /// One dispatch transaction: emit step events for still-valid decisions,
    /// run the cascade, and decide the flow verdict.
    async fn commit_dispatch(
        &self,
        flow_id: &str,
        decisions: &[Decision],
    ) -> Result<DispatchResult, FlowError> {
        self.flows
            .apply(&Self::flow_ref(flow_id), |state: &FlowState, _version| {
                let mut scratch = state.clone();
                let mut events: Vec<Event> = Vec::new();
                let mut result = DispatchResult::default();

                let mut push = |scratch: &mut FlowState, events: &mut Vec<Event>, event: Event| {
                    let envelope = crate::events::Envelope::now(event.clone());
                    if let Err(e) = scratch.fold(&envelope) {
                        tracing::debug!(flow_id = %state.id, error = %e, "stale dispatch decision dropped");
                        return false;
                    }
                    events.push(event);
                    true
                };

                for decision in decisions {
                    match decision {
                        Decision::Start { step, inputs } => {
                            let pending = scratch
                                .execution(&step.id)
                                .is_some_and(|e| e.status == ExecStatus::Pending);
                            if !pending {
                                continue;
                            }
                            if !rules::outputs_needed(&scratch, step) {
                                push(
                                    &mut scratch,
                                    &mut events,
                                    Event::StepSkipped {
                                        flow_id: state.id.clone(),
                                        step_id: step.id.clone(),
                                        reason: rules::OUTPUTS_NOT_NEEDED.to_string(),
                                    },
                                );
                                continue;
                            }

                            let seeds = rules::expand_work_items(step, inputs);
                            let started = push(
                                &mut scratch,
                                &mut events,
                                Event::StepStarted {
                                    flow_id: state.id.clone(),
                                    step_id: step.id.clone(),
                                    inputs: inputs.clone(),
                                    work_items: seeds.clone(),
                                },
                            );
                            if started {
                                for seed in seeds {
                                    result.handles.push(WorkHandle {
                                        step: step.clone(),
                                        token: seed.token,
                                        inputs: seed.inputs,
                                        binding: seed.binding,
                                    });
                                }
                            }
                        }

                        Decision::Skip { step_id, reason } => {
                            push(
                                &mut scratch,
                                &mut events,
                                Event::StepSkipped {
                                    flow_id: state.id.clone(),
                                    step_id: step_id.clone(),
                                    reason: reason.clone(),
                                },
                            );
                        }

                        Decision::Fail { step_id, error } => {
                            push(
                                &mut scratch,
                                &mut events,
                                Event::StepFailed {
                                    flow_id: state.id.clone(),
                                    step_id: step_id.clone(),
                                    error: error.clone(),
                                },
                            );
                        }
                    }
                }

                // Unreachability cascade over the post-decision state
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

                // Terminal verdict
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
                        result.verdict = Some(verdict);
                    }
                }

                // A failed flow cancels parked retries so it can deactivate
                if matches!(result.verdict, Some(FlowVerdict::Failed { .. })) {
                    for (step_id, token) in rules::cancellable_work(&scratch) {
                        push(
                            &mut scratch,
                            &mut events,
                            Event::WorkFailed {
                                flow_id: state.id.clone(),
                                step_id: step_id.clone(),
                                token,
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

                result.emitted = events.len();
                Ok::<_, FlowError>((events, result))
            })
            .await
    }

    // =========================================================================
    // Deactivation
    // =========================================================================

    /// Retire a terminal flow from the active set once no work remains
    pub(crate) async fn try_deactivate(&self, flow_id: &str, state: &FlowState) {
        if !state.can_deactivate() {
            return;
        }
        self.retries.cancel_flow(flow_id);

        let flow_id_owned = flow_id.to_string();
        let result = self
            .partition
            .apply(
                &AggregateRef::partition(),
                |partition: &PartitionState, _version| {
                    if !partition.is_active(&flow_id_owned) {
                        return Ok((vec![], ()));
                    }
                    Ok::<_, FlowError>((
                        vec![Event::FlowDeactivated {
                            flow_id: flow_id_owned.clone(),
                        }],
                        (),
                    ))
                },
            )
            .await;

        match result {
            Ok(()) => tracing::info!(flow_id, "flow deactivated"),
            Err(e) => tracing::error!(flow_id, error = %e, "deactivation failed"),
        }
    }

    // =========================================================================
    // Retry re-dispatch
    // =========================================================================

    /// A scheduled retry came due: restart the work item within the owning
    /// flow's transaction. Memoizable steps reuse the token; others get a
    /// fresh one.
    async fn redispatch(self: Arc<Self>, entry: RetryEntry) {
        let state = match self.flows.get(&Self::flow_ref(&entry.flow_id)).await {
            Ok(Some((state, _))) => state,
            _ => return,
        };
        if state.is_terminal() || !self.is_accepting() {
            return;
        }

        let Some(step) = state.plan.steps.get(&entry.step_id).cloned() else {
            return;
        };
        let Some(item) = state.work_item(&entry.step_id, entry.token) else {
            return;
        };
        if item.status != crate::flow::WorkStatus::Pending || item.next_retry_at.is_none() {
            return;
        }

        let inputs = item.inputs.clone();
        let binding = item.binding.clone();
        let (token, replaces) = if step.memoizable {
            (entry.token, None)
        } else {
            (Uuid::new_v4(), Some(entry.token))
        };

        tracing::debug!(
            flow_id = %entry.flow_id,
            step_id = %entry.step_id,
            retry_count = item.retry_count,
            "re-dispatching retry"
        );

        self.run_work_item(
            &entry.flow_id,
            step,
            token,
            inputs,
            binding,
            StartMode::Retry { replaces },
        )
        .await;
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop accepting new work and wait (bounded) for in-flight invocations.
    ///
    /// Retry schedules survive through their persisted `RetryScheduled`
    /// events; no new events are needed on shutdown.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        self.retries.shutdown();

        let deadline = tokio::time::Instant::now() + grace;
        while self.in_flight.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let remaining = self.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            tracing::warn!(remaining, "shutdown grace elapsed with work in flight");
        }
    }
}

/// Decrements the in-flight counter on drop
pub(crate) struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
