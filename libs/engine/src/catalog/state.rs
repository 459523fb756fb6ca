//! Catalog aggregate state
//!
//! Folded from catalog events: the step registry, the global attribute
//! provider/consumer graph, and per-step health.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use argyll_domain::Step;

use crate::events::{AggregateState, Envelope, Event, FoldError};
use crate::graph::AttributeGraph;

/// Health of a registered step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Not yet probed
    Unknown,

    /// Last probe (or script compile) succeeded
    Healthy,

    /// Last probe failed
    Unhealthy,
}

/// Health record for one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    /// Current status
    pub status: HealthStatus,

    /// Error from the last failed probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Materialized catalog state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogState {
    /// Registered steps by id
    pub steps: BTreeMap<String, Step>,

    /// Global attribute graph, rebuilt on every admit/remove
    pub attributes: AttributeGraph,

    /// Per-step health
    pub health: BTreeMap<String, HealthState>,
}

impl CatalogState {
    fn rebuild_graph(&mut self) {
        self.attributes = AttributeGraph::build(self.steps.values(), None);
    }

    fn admit(&mut self, step: Step) {
        // Initial health must fold deterministically from the event payload.
        // Registration compiles every script the step carries before the
        // admission event is emitted, so a script-bearing step in the log has
        // a verified compile behind it and starts healthy. Steps without
        // scripts (HTTP bodies) have had nothing exercised yet and stay
        // unknown until the external prober reports through
        // `StepHealthChanged`.
        let status = if step.has_scripts() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        };
        self.health.insert(
            step.id.clone(),
            HealthState {
                status,
                error: None,
            },
        );
        self.steps.insert(step.id.clone(), step);
        self.rebuild_graph();
    }
}

impl AggregateState for CatalogState {
    fn fold(&mut self, envelope: &Envelope) -> Result<(), FoldError> {
        match &envelope.event {
            Event::StepRegistered { step } => {
                if self.steps.contains_key(&step.id) {
                    return Err(FoldError(format!(
                        "step '{}' is already registered",
                        step.id
                    )));
                }
                self.admit(step.clone());
                Ok(())
            }

            Event::StepUpdated { step } => {
                if !self.steps.contains_key(&step.id) {
                    return Err(FoldError(format!("step '{}' is not registered", step.id)));
                }
                self.admit(step.clone());
                Ok(())
            }

            Event::StepUnregistered { step_id } => {
                if self.steps.remove(step_id).is_none() {
                    return Err(FoldError(format!("step '{step_id}' is not registered")));
                }
                self.health.remove(step_id);
                self.rebuild_graph();
                Ok(())
            }

            Event::StepHealthChanged {
                step_id,
                status,
                error,
            } => {
                let Some(entry) = self.health.get_mut(step_id) else {
                    return Err(FoldError(format!("step '{step_id}' is not registered")));
                };
                entry.status = *status;
                entry.error = error.clone();
                Ok(())
            }

            other => Err(FoldError(format!(
                "catalog aggregate cannot apply '{}'",
                other.event_type()
            ))),
        }
    }
}
