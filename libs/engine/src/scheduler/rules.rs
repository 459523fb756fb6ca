//! Pure scheduling rules
//!
//! Readiness, input gathering, for-each expansion, output aggregation, and
//! the unreachability cascade. Everything here is a pure function of flow
//! state so the dispatch transactions stay free of I/O.

use std::collections::BTreeMap;

use uuid::Uuid;

use argyll_domain::{AttrRole, Args, Step, Value};

use crate::events::WorkItemSeed;
use crate::flow::{ExecStatus, FlowState, WorkStatus};

/// Reason attached to steps failed by the cascade
pub const UNREACHABLE_INPUT: &str = "required input no longer available";

/// Reason attached to steps skipped because nothing consumes their outputs
pub const OUTPUTS_NOT_NEEDED: &str = "outputs not needed";

/// Reason attached to steps skipped by their predicate
pub const PREDICATE_FALSE: &str = "predicate returned false";

/// Error attached to work whose retry is canceled by a terminal flow
pub const RETRY_CANCELED: &str = "retry canceled: flow reached a terminal state";

// =============================================================================
// Readiness
// =============================================================================

/// Whether every input the step needs is available in the flow.
///
/// Const inputs always count as present through their default, and so do
/// declared defaults for other roles; optional inputs never block.
#[must_use]
pub fn inputs_ready(state: &FlowState, step: &Step) -> bool {
    step.inputs().all(|(name, spec)| match spec.role {
        AttrRole::Const => true,
        AttrRole::Optional => true,
        AttrRole::Required => {
            state.attributes.contains_key(name) || spec.default.is_some()
        }
        AttrRole::Output => true,
    })
}

/// Whether the step's outputs are still needed: it is a goal, or some
/// pending downstream consumer in the plan can still use one of them.
#[must_use]
pub fn outputs_needed(state: &FlowState, step: &Step) -> bool {
    if state.plan.is_goal(&step.id) {
        return true;
    }
    step.outputs().any(|name| {
        state
            .plan
            .attributes
            .consumers_of(name)
            .iter()
            .any(|consumer| {
                consumer != &step.id
                    && state
                        .execution(consumer)
                        .is_some_and(|e| e.status == ExecStatus::Pending)
            })
    })
}

/// Pending steps whose inputs are all available
#[must_use]
pub fn ready_steps(state: &FlowState) -> Vec<String> {
    state
        .plan
        .steps
        .iter()
        .filter(|(id, step)| {
            state
                .execution(id)
                .is_some_and(|e| e.status == ExecStatus::Pending)
                && inputs_ready(state, step)
        })
        .map(|(id, _)| id.clone())
        .collect()
}

// =============================================================================
// Input gathering
// =============================================================================

/// Gather the inputs for a dispatch: Const defaults always win, then flow
/// attributes, then declared defaults; missing optional inputs are omitted.
#[must_use]
pub fn gather_inputs(state: &FlowState, step: &Step) -> Args {
    let mut inputs = Args::new();
    for (name, spec) in step.inputs() {
        let value = match spec.role {
            AttrRole::Const => spec.default.clone(),
            _ => state
                .attribute(name)
                .cloned()
                .or_else(|| spec.default.clone()),
        };
        if let Some(value) = value {
            inputs.insert(name.to_string(), value);
        }
    }
    inputs
}

// =============================================================================
// For-each expansion
// =============================================================================

/// Expand the gathered inputs into work items: the Cartesian product across
/// every for-each input whose supplied value is an array. Scalar values pass
/// through unexpanded; with no expansion a single item carries everything.
#[must_use]
pub fn expand_work_items(step: &Step, inputs: &Args) -> Vec<WorkItemSeed> {
    let expansions: Vec<(String, Vec<Value>)> = step
        .for_each_inputs()
        .filter_map(|name| {
            inputs
                .get(name)
                .and_then(Value::as_seq)
                .map(|items| (name.to_string(), items.to_vec()))
        })
        .collect();

    if expansions.is_empty() {
        return vec![WorkItemSeed {
            token: Uuid::new_v4(),
            inputs: inputs.clone(),
            binding: BTreeMap::new(),
        }];
    }

    let mut bindings: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new()];
    for (name, elements) in &expansions {
        let mut next = Vec::with_capacity(bindings.len() * elements.len());
        for binding in &bindings {
            for element in elements {
                let mut extended = binding.clone();
                extended.insert(name.clone(), element.clone());
                next.push(extended);
            }
        }
        bindings = next;
    }

    bindings
        .into_iter()
        .map(|binding| {
            let mut item_inputs = inputs.clone();
            for (name, element) in &binding {
                item_inputs.insert(name.clone(), element.clone());
            }
            WorkItemSeed {
                token: Uuid::new_v4(),
                inputs: item_inputs,
                binding,
            }
        })
        .collect()
}

// =============================================================================
// Output aggregation
// =============================================================================

/// Aggregate the outputs of a finished step into flow-attribute values.
///
/// A single work item maps its outputs one-to-one. Multiple work items
/// produce, per declared output, a sequence of objects carrying the item's
/// for-each bindings plus the output value under its own name; order follows
/// item completion and is not guaranteed.
#[must_use]
pub fn aggregate_outputs(state: &FlowState, step: &Step) -> Args {
    let Some(exec) = state.execution(&step.id) else {
        return Args::new();
    };

    let items: Vec<_> = exec
        .work_items
        .values()
        .filter(|item| item.status == WorkStatus::Succeeded)
        .collect();

    if items.len() == 1 && items[0].binding.is_empty() {
        return items[0].outputs.clone().unwrap_or_default();
    }

    let mut aggregated = Args::new();
    for name in step.outputs() {
        let sequence: Vec<Value> = items
            .iter()
            .filter_map(|item| {
                let value = item.outputs.as_ref()?.get(name)?;
                let mut element = item.binding.clone();
                element.insert(name.to_string(), value.clone());
                Some(Value::Map(element))
            })
            .collect();
        if !sequence.is_empty() {
            aggregated.insert(name.to_string(), Value::Seq(sequence));
        }
    }
    aggregated
}

// =============================================================================
// Unreachability cascade
// =============================================================================

/// Pending steps that can no longer run: some required input has no value
/// yet and every in-plan provider of it finished without producing it.
/// Computed to a fixed point so failures cascade.
#[must_use]
pub fn unreachable_steps(state: &FlowState) -> Vec<String> {
    let mut failed: Vec<String> = Vec::new();

    loop {
        let mut changed = false;

        for (step_id, step) in &state.plan.steps {
            if failed.contains(step_id) {
                continue;
            }
            let pending = state
                .execution(step_id)
                .is_some_and(|e| e.status == ExecStatus::Pending);
            if !pending {
                continue;
            }

            let blocked = step.inputs().any(|(name, spec)| {
                if !matches!(spec.role, AttrRole::Required) || spec.default.is_some() {
                    return false;
                }
                if state.attributes.contains_key(name) {
                    return false;
                }
                let providers = state.plan.attributes.providers_of(name);
                providers.iter().all(|provider| {
                    failed.contains(provider)
                        || state
                            .execution(provider)
                            .is_none_or(|e| e.status.is_terminal_non_success())
                })
            });

            if blocked {
                failed.push(step_id.clone());
                changed = true;
            }
        }

        if !changed {
            return failed;
        }
    }
}

/// Work items that will never run again once the flow is terminal: items
/// parked behind a scheduled retry (or mid-retry-decision) under a
/// non-terminal step. Failing them in the same transaction keeps the
/// deactivation rule satisfiable.
#[must_use]
pub fn cancellable_work(state: &FlowState) -> Vec<(String, uuid::Uuid)> {
    state
        .executions
        .iter()
        .filter(|(_, exec)| !exec.status.is_terminal())
        .flat_map(|(step_id, exec)| {
            exec.work_items
                .values()
                .filter(|item| {
                    item.status == WorkStatus::NotCompleted
                        || (item.status == WorkStatus::Pending && item.next_retry_at.is_some())
                })
                .map(move |item| (step_id.clone(), item.token))
        })
        .collect()
}

/// Terminal decision for the whole flow once something changed
#[must_use]
pub fn flow_verdict(state: &FlowState) -> Option<FlowVerdict> {
    let mut failed_goal: Option<&str> = None;
    let mut all_done = true;

    for goal in &state.plan.goals {
        match state.execution(goal).map(|e| e.status) {
            Some(ExecStatus::Failed) => {
                failed_goal = Some(goal);
                break;
            }
            Some(ExecStatus::Completed | ExecStatus::Skipped) => {}
            _ => all_done = false,
        }
    }

    if let Some(goal) = failed_goal {
        return Some(FlowVerdict::Failed {
            error: format!("goal step '{goal}' failed"),
        });
    }
    all_done.then_some(FlowVerdict::Completed)
}

/// Outcome of the terminal check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowVerdict {
    /// Every goal finished without failing
    Completed,

    /// A goal failed or became unreachable
    Failed { error: String },
}
