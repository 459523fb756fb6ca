//! Flow aggregate state
//!
//! A flow's state is entirely reconstructed by folding its ordered event
//! log. Appliers are pure and enforce the transition matrix; the duplicate
//! terminal rejection on work items is the idempotency guarantee consumed by
//! async webhook delivery.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use argyll_domain::{Args, Value};

use crate::events::{AggregateState, Envelope, Event, FoldError, WorkItemSeed};
use crate::plan::ExecutionPlan;

// =============================================================================
// Statuses
// =============================================================================

/// Flow lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl FlowStatus {
    /// Whether this is a terminal status
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Per-step execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
}

impl ExecStatus {
    /// Whether this is a terminal status
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether the step finished without producing its outputs
    #[must_use]
    pub fn is_terminal_non_success(self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }
}

/// Work item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Active,
    Succeeded,
    Failed,
    /// Transient failure awaiting a retry decision; not terminal
    NotCompleted,
}

impl WorkStatus {
    /// Whether this is a terminal status
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

// =============================================================================
// State records
// =============================================================================

/// One concrete invocation of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Routing token
    pub token: Uuid,

    /// Inputs for this item
    pub inputs: Args,

    /// Current status
    pub status: WorkStatus,

    /// Retry attempts so far
    pub retry_count: u32,

    /// When the next retry is due, while one is scheduled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Outputs on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Args>,

    /// Error from the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// For-each bindings that produced this item
    #[serde(default)]
    pub binding: BTreeMap<String, Value>,
}

impl WorkItem {
    fn from_seed(seed: &WorkItemSeed) -> Self {
        Self {
            token: seed.token,
            inputs: seed.inputs.clone(),
            status: WorkStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            outputs: None,
            error: None,
            binding: seed.binding.clone(),
        }
    }
}

/// Execution state of one step within a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Current status
    pub status: ExecStatus,

    /// Gathered inputs at dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Args>,

    /// Aggregated outputs at completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Args>,

    /// Failure error or skip reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Work items by token
    #[serde(default)]
    pub work_items: BTreeMap<Uuid, WorkItem>,

    /// When the step was dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the step reached a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            status: ExecStatus::Pending,
            inputs: None,
            outputs: None,
            error: None,
            work_items: BTreeMap::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// A flow attribute with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    /// Current value
    pub value: Value,

    /// Step that produced it, `None` for initial values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// When the value was set
    pub set_at: DateTime<Utc>,
}

// =============================================================================
// Flow state
// =============================================================================

/// Materialized state of one flow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowState {
    /// Flow id
    pub id: String,

    /// The immutable plan this flow executes
    pub plan: ExecutionPlan,

    /// Initial attribute values
    pub init: Args,

    /// Lifecycle status
    pub status: FlowStatus,

    /// Attribute store
    pub attributes: BTreeMap<String, AttributeValue>,

    /// Per-step execution state
    pub executions: BTreeMap<String, ExecutionState>,
}

impl Default for FlowStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl FlowState {
    /// Execution state of a step
    #[must_use]
    pub fn execution(&self, step_id: &str) -> Option<&ExecutionState> {
        self.executions.get(step_id)
    }

    /// Work item by step and token
    #[must_use]
    pub fn work_item(&self, step_id: &str, token: Uuid) -> Option<&WorkItem> {
        self.executions
            .get(step_id)
            .and_then(|e| e.work_items.get(&token))
    }

    /// Current attribute value
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).map(|a| &a.value)
    }

    /// Whether the flow reached a terminal status
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `(step_id, token)` pairs currently in flight
    #[must_use]
    pub fn active_work(&self) -> Vec<(String, Uuid)> {
        self.executions
            .iter()
            .flat_map(|(step_id, exec)| {
                exec.work_items
                    .values()
                    .filter(|item| item.status == WorkStatus::Active)
                    .map(move |item| (step_id.clone(), item.token))
            })
            .collect()
    }

    /// Work items with a scheduled retry under a non-terminal step
    #[must_use]
    pub fn pending_retries(&self) -> Vec<(String, Uuid, DateTime<Utc>)> {
        self.executions
            .iter()
            .filter(|(_, exec)| !exec.status.is_terminal())
            .flat_map(|(step_id, exec)| {
                exec.work_items.values().filter_map(move |item| {
                    (item.status == WorkStatus::Pending)
                        .then(|| item.next_retry_at.map(|due| (step_id.clone(), item.token, due)))
                        .flatten()
                })
            })
            .collect()
    }

    /// A flow leaves the active set only when terminal with no in-flight
    /// work and no outstanding retries
    #[must_use]
    pub fn can_deactivate(&self) -> bool {
        self.is_terminal() && self.active_work().is_empty() && self.pending_retries().is_empty()
    }

    fn execution_mut(&mut self, step_id: &str) -> Result<&mut ExecutionState, FoldError> {
        self.executions
            .get_mut(step_id)
            .ok_or_else(|| FoldError(format!("step '{step_id}' is not in the plan")))
    }

    fn work_item_mut(
        &mut self,
        step_id: &str,
        token: Uuid,
    ) -> Result<&mut WorkItem, FoldError> {
        self.executions
            .get_mut(step_id)
            .ok_or_else(|| FoldError(format!("step '{step_id}' is not in the plan")))?
            .work_items
            .get_mut(&token)
            .ok_or_else(|| FoldError(format!("unknown work token {token} on step '{step_id}'")))
    }
}

impl AggregateState for FlowState {
    #[allow(clippy::too_many_lines)]
    fn fold(&mut self, envelope: &Envelope) -> Result<(), FoldError> {
        let ts = envelope.timestamp;
        match &envelope.event {
            Event::FlowStarted {
                flow_id,
                plan,
                init,
            } => {
                if self.status != FlowStatus::Pending || !self.id.is_empty() {
                    return Err(FoldError(format!("flow '{flow_id}' already started")));
                }
                self.id = flow_id.clone();
                self.plan = plan.clone();
                self.init = init.clone();
                self.status = FlowStatus::Active;
                for (name, value) in init {
                    self.attributes.insert(
                        name.clone(),
                        AttributeValue {
                            value: value.clone(),
                            provider: None,
                            set_at: ts,
                        },
                    );
                }
                for step_id in plan.steps.keys() {
                    self.executions
                        .insert(step_id.clone(), ExecutionState::default());
                }
                Ok(())
            }

            Event::StepStarted {
                step_id,
                inputs,
                work_items,
                ..
            } => {
                let exec = self.execution_mut(step_id)?;
                if exec.status != ExecStatus::Pending {
                    return Err(FoldError(format!(
                        "step '{step_id}' cannot start from {:?}",
                        exec.status
                    )));
                }
                exec.status = ExecStatus::Active;
                exec.inputs = Some(inputs.clone());
                exec.started_at = Some(ts);
                for seed in work_items {
                    exec.work_items
                        .insert(seed.token, WorkItem::from_seed(seed));
                }
                Ok(())
            }

            Event::WorkStarted {
                step_id,
                token,
                replaces,
                ..
            } => {
                // A regenerated retry token retires the old item and carries
                // its inputs and retry count forward under the new token
                if let Some(old_token) = replaces {
                    let exec = self.execution_mut(step_id)?;
                    let Some(old_item) = exec.work_items.remove(old_token) else {
                        return Err(FoldError(format!(
                            "unknown replaced token {old_token} on step '{step_id}'"
                        )));
                    };
                    if old_item.status != WorkStatus::Pending {
                        exec.work_items.insert(*old_token, old_item);
                        return Err(FoldError(format!(
                            "replaced token {old_token} is not pending"
                        )));
                    }
                    exec.work_items.insert(
                        *token,
                        WorkItem {
                            token: *token,
                            ..old_item
                        },
                    );
                }

                let item = self.work_item_mut(step_id, *token)?;
                if item.status != WorkStatus::Pending {
                    return Err(FoldError(format!(
                        "work {token} cannot start from {:?}",
                        item.status
                    )));
                }
                item.status = WorkStatus::Active;
                item.next_retry_at = None;
                Ok(())
            }

            Event::WorkSucceeded {
                step_id,
                token,
                outputs,
                ..
            } => {
                let item = self.work_item_mut(step_id, *token)?;
                if !matches!(item.status, WorkStatus::Active | WorkStatus::NotCompleted) {
                    return Err(FoldError(format!(
                        "work {token} cannot succeed from {:?}",
                        item.status
                    )));
                }
                item.status = WorkStatus::Succeeded;
                item.outputs = Some(outputs.clone());
                item.error = None;
                item.next_retry_at = None;
                Ok(())
            }

            Event::WorkFailed {
                step_id,
                token,
                error,
                ..
            } => {
                let item = self.work_item_mut(step_id, *token)?;
                // A pending item with a scheduled retry can be failed
                // directly when its retry is canceled
                let retry_parked =
                    item.status == WorkStatus::Pending && item.next_retry_at.is_some();
                if !matches!(item.status, WorkStatus::Active | WorkStatus::NotCompleted)
                    && !retry_parked
                {
                    return Err(FoldError(format!(
                        "work {token} cannot fail from {:?}",
                        item.status
                    )));
                }
                item.status = WorkStatus::Failed;
                item.error = Some(error.clone());
                item.next_retry_at = None;
                Ok(())
            }

            Event::WorkNotCompleted {
                step_id,
                token,
                error,
                ..
            } => {
                let item = self.work_item_mut(step_id, *token)?;
                if item.status != WorkStatus::Active {
                    return Err(FoldError(format!(
                        "work {token} cannot be marked incomplete from {:?}",
                        item.status
                    )));
                }
                item.status = WorkStatus::NotCompleted;
                item.error = Some(error.clone());
                Ok(())
            }

            Event::RetryScheduled {
                step_id,
                token,
                attempt,
                due_at,
                ..
            } => {
                let item = self.work_item_mut(step_id, *token)?;
                if item.status != WorkStatus::NotCompleted {
                    return Err(FoldError(format!(
                        "retry for {token} requires NotCompleted, found {:?}",
                        item.status
                    )));
                }
                if *attempt <= item.retry_count {
                    return Err(FoldError(format!(
                        "retry attempt {attempt} is not after {}",
                        item.retry_count
                    )));
                }
                item.status = WorkStatus::Pending;
                item.retry_count = *attempt;
                item.next_retry_at = Some(*due_at);
                Ok(())
            }

            Event::AttributeSet {
                name,
                value,
                provider,
                ..
            } => {
                if self.status != FlowStatus::Active {
                    return Err(FoldError(format!(
                        "attribute '{name}' set on a {:?} flow",
                        self.status
                    )));
                }
                // Later providers overwrite: last writer wins by append order
                self.attributes.insert(
                    name.clone(),
                    AttributeValue {
                        value: value.clone(),
                        provider: provider.clone(),
                        set_at: ts,
                    },
                );
                Ok(())
            }

            Event::StepCompleted {
                step_id, outputs, ..
            } => {
                let exec = self.execution_mut(step_id)?;
                if exec.status != ExecStatus::Active {
                    return Err(FoldError(format!(
                        "step '{step_id}' cannot complete from {:?}",
                        exec.status
                    )));
                }
                if exec
                    .work_items
                    .values()
                    .any(|item| item.status != WorkStatus::Succeeded)
                {
                    return Err(FoldError(format!(
                        "step '{step_id}' has unfinished work items"
                    )));
                }
                exec.status = ExecStatus::Completed;
                exec.outputs = Some(outputs.clone());
                exec.finished_at = Some(ts);
                Ok(())
            }

            Event::StepFailed { step_id, error, .. } => {
                let exec = self.execution_mut(step_id)?;
                if exec.status.is_terminal() {
                    return Err(FoldError(format!(
                        "step '{step_id}' cannot fail from {:?}",
                        exec.status
                    )));
                }
                exec.status = ExecStatus::Failed;
                exec.error = Some(error.clone());
                exec.finished_at = Some(ts);
                Ok(())
            }

            Event::StepSkipped { step_id, reason, .. } => {
                let exec = self.execution_mut(step_id)?;
                if exec.status.is_terminal() {
                    return Err(FoldError(format!(
                        "step '{step_id}' cannot be skipped from {:?}",
                        exec.status
                    )));
                }
                exec.status = ExecStatus::Skipped;
                exec.error = Some(reason.clone());
                exec.finished_at = Some(ts);
                Ok(())
            }

            Event::FlowCompleted { .. } => {
                if self.status != FlowStatus::Active {
                    return Err(FoldError(format!(
                        "flow cannot complete from {:?}",
                        self.status
                    )));
                }
                let unfinished_goal = self.plan.goals.iter().find(|goal| {
                    self.executions
                        .get(*goal)
                        .is_none_or(|e| !matches!(e.status, ExecStatus::Completed | ExecStatus::Skipped))
                });
                if let Some(goal) = unfinished_goal {
                    return Err(FoldError(format!(
                        "goal '{goal}' has not completed"
                    )));
                }
                self.status = FlowStatus::Completed;
                Ok(())
            }

            Event::FlowFailed { .. } => {
                if self.status != FlowStatus::Active {
                    return Err(FoldError(format!(
                        "flow cannot fail from {:?}",
                        self.status
                    )));
                }
                self.status = FlowStatus::Failed;
                Ok(())
            }

            other => Err(FoldError(format!(
                "flow aggregate cannot apply '{}'",
                other.event_type()
            ))),
        }
    }
}
