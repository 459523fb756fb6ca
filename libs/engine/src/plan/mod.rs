//! Execution planning
//!
//! From a set of goal steps and the initial attribute values, compute the
//! minimal subset of the catalog required to satisfy the goals, together
//! with the per-flow attribute projection.

mod generator;

pub use generator::{generate_plan, PlanError};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use argyll_domain::{Args, Step};

use crate::graph::AttributeGraph;

/// The immutable plan a flow executes.
///
/// Step definitions are embedded so a flow replays identically even after
/// the catalog changes underneath it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Goal step ids, in request order
    pub goals: Vec<String>,

    /// Steps included in the plan, keyed by id
    pub steps: BTreeMap<String, Step>,

    /// Provider/consumer projection restricted to `steps`
    pub attributes: AttributeGraph,

    /// Required attribute names with no satisfiable provider; these must be
    /// supplied as initial values for the flow to start
    pub required: BTreeSet<String>,
}

impl ExecutionPlan {
    /// Required attributes not covered by the given initial values
    #[must_use]
    pub fn missing_required(&self, init: &Args) -> BTreeSet<String> {
        self.required
            .iter()
            .filter(|name| !init.contains_key(*name))
            .cloned()
            .collect()
    }

    /// Whether the step id is a goal of this plan
    #[must_use]
    pub fn is_goal(&self, step_id: &str) -> bool {
        self.goals.iter().any(|g| g == step_id)
    }
}
