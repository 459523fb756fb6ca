//! Plan generation
//!
//! Two passes over the catalog: a satisfiability fixed point that decides
//! which steps could ever run given the initial values, then a depth-first
//! walk from the goals that pulls in every satisfiable provider of every
//! needed input.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use thiserror::Error;

use argyll_domain::{Args, Step};

use super::ExecutionPlan;
use crate::graph::AttributeGraph;

// =============================================================================
// Errors
// =============================================================================

/// Plan generation errors
#[derive(Debug, Error)]
pub enum PlanError {
    /// No goals were supplied
    #[error("at least one goal step is required")]
    EmptyGoals,

    /// A goal does not exist in the catalog
    #[error("unknown goal step '{goal}'{}", suggestion.as_ref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default())]
    UnknownGoal {
        goal: String,
        suggestion: Option<String>,
    },
}

/// Find a similar step id using Levenshtein distance
fn find_similar(target: &str, candidates: impl Iterator<Item = impl AsRef<str>>) -> Option<String> {
    let mut best: Option<String> = None;
    let mut best_distance = usize::MAX;

    for candidate in candidates {
        let candidate = candidate.as_ref();
        let distance = strsim::levenshtein(target, candidate);
        if distance < best_distance && distance <= 3 {
            best_distance = distance;
            best = Some(candidate.to_string());
        }
    }

    best
}

// =============================================================================
// Generation
// =============================================================================

/// Compute the execution plan for the given goals and initial values
pub fn generate_plan(
    catalog: &BTreeMap<String, Step>,
    goals: &[String],
    init: &Args,
) -> Result<ExecutionPlan, PlanError> {
    if goals.is_empty() {
        return Err(PlanError::EmptyGoals);
    }
    for goal in goals {
        if !catalog.contains_key(goal) {
            return Err(PlanError::UnknownGoal {
                goal: goal.clone(),
                suggestion: find_similar(goal, catalog.keys()),
            });
        }
    }

    let full_graph = AttributeGraph::build(catalog.values(), None);
    let satisfiable = satisfiable_steps(catalog, init);

    let mut walk = GoalWalk {
        catalog,
        graph: &full_graph,
        satisfiable: &satisfiable,
        init,
        visited: HashSet::new(),
        included: BTreeSet::new(),
        required: BTreeSet::new(),
    };
    for goal in goals {
        walk.visit(goal);
    }

    let steps: BTreeMap<String, Step> = walk
        .included
        .iter()
        .filter_map(|id| catalog.get(id).map(|s| (id.clone(), s.clone())))
        .collect();
    let included = walk.included;
    let required = walk.required;

    let attributes = AttributeGraph::build(steps.values(), None).project(&included);

    Ok(ExecutionPlan {
        goals: goals.to_vec(),
        steps,
        attributes,
        required,
    })
}

/// Fixed point: a step is satisfiable when every required input is either an
/// initial value or an output of an already-satisfiable step.
fn satisfiable_steps(catalog: &BTreeMap<String, Step>, init: &Args) -> HashSet<String> {
    let mut available: HashSet<String> = init.keys().cloned().collect();
    let mut satisfiable: HashSet<String> = HashSet::new();

    loop {
        let mut changed = false;

        for (id, step) in catalog {
            if satisfiable.contains(id) {
                continue;
            }
            let ready = step
                .required_inputs()
                .all(|name| available.contains(name));
            if ready {
                satisfiable.insert(id.clone());
                for output in step.outputs() {
                    changed |= available.insert(output.to_string());
                }
                changed = true;
            }
        }

        if !changed {
            return satisfiable;
        }
    }
}

struct GoalWalk<'a> {
    catalog: &'a BTreeMap<String, Step>,
    graph: &'a AttributeGraph,
    satisfiable: &'a HashSet<String>,
    init: &'a Args,
    visited: HashSet<String>,
    included: BTreeSet<String>,
    required: BTreeSet<String>,
}

impl GoalWalk<'_> {
    fn visit(&mut self, step_id: &str) {
        if !self.visited.insert(step_id.to_string()) {
            return;
        }
        let Some(step) = self.catalog.get(step_id) else {
            return;
        };

        // A step whose every output is already supplied adds nothing
        let mut outputs = step.outputs().peekable();
        let has_outputs = outputs.peek().is_some();
        let all_supplied = has_outputs && step.outputs().all(|name| self.init.contains_key(name));
        if all_supplied {
            return;
        }

        self.included.insert(step_id.to_string());

        for (name, spec) in step.inputs() {
            // Const inputs are pinned to their default and never need a provider
            if matches!(spec.role, argyll_domain::AttrRole::Const) {
                continue;
            }
            if self.init.contains_key(name) {
                continue;
            }

            let providers: Vec<String> = self
                .graph
                .providers_of(name)
                .into_iter()
                .filter(|p| self.satisfiable.contains(p))
                .collect();

            if providers.is_empty() {
                if matches!(spec.role, argyll_domain::AttrRole::Required)
                    && spec.default.is_none()
                {
                    self.required.insert(name.to_string());
                }
                continue;
            }

            // All satisfiable providers race at execution time
            for provider in providers {
                self.visit(&provider);
            }
        }
    }
}
