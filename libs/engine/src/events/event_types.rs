//! Engine event types
//!
//! Every state change in the system is captured as an immutable event.
//! Events serialize to `{type, timestamp, data}` envelopes; `data` carries
//! the aggregate-scoped payload including `flow_id`/`step_id`/`token` where
//! applicable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use argyll_domain::{Args, Step, Value};

use crate::catalog::HealthStatus;
use crate::plan::ExecutionPlan;

// =============================================================================
// Events
// =============================================================================

/// One work item to create at step dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemSeed {
    /// Token routing completions to this item
    pub token: Uuid,

    /// Inputs for this item (for-each attributes replaced by their element)
    pub inputs: Args,

    /// The for-each bindings that produced this item, empty when the step
    /// did not expand
    #[serde(default)]
    pub binding: BTreeMap<String, Value>,
}

/// All engine events, across the catalog, partition, and flow aggregates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    // =========================================================================
    // Catalog aggregate
    // =========================================================================
    /// A step entered the catalog
    StepRegistered { step: Step },

    /// A step definition was replaced
    StepUpdated { step: Step },

    /// A step left the catalog
    StepUnregistered { step_id: String },

    /// A step's health status transitioned
    StepHealthChanged {
        step_id: String,
        status: HealthStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // =========================================================================
    // Partition aggregate (engine-wide active-flow notices)
    // =========================================================================
    /// A flow entered the active set
    FlowActivated { flow_id: String },

    /// A terminal flow with no remaining work left the active set
    FlowDeactivated { flow_id: String },

    // =========================================================================
    // Flow aggregate
    // =========================================================================
    /// A flow was created from a plan and initial values
    FlowStarted {
        flow_id: String,
        plan: ExecutionPlan,
        init: Args,
    },

    /// A step was dispatched with its work items
    StepStarted {
        flow_id: String,
        step_id: String,
        inputs: Args,
        work_items: Vec<WorkItemSeed>,
    },

    /// A work item began executing.
    ///
    /// On a retry of a non-memoizable step the token is regenerated;
    /// `replaces` names the retired token so the applier can rekey the item.
    WorkStarted {
        flow_id: String,
        step_id: String,
        token: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replaces: Option<Uuid>,
    },

    /// A work item finished successfully
    WorkSucceeded {
        flow_id: String,
        step_id: String,
        token: Uuid,
        outputs: Args,
    },

    /// A work item failed permanently
    WorkFailed {
        flow_id: String,
        step_id: String,
        token: Uuid,
        error: String,
    },

    /// A work item failed transiently and may be retried
    WorkNotCompleted {
        flow_id: String,
        step_id: String,
        token: Uuid,
        error: String,
    },

    /// A retry was scheduled for a transiently failed work item
    RetryScheduled {
        flow_id: String,
        step_id: String,
        token: Uuid,
        attempt: u32,
        due_at: DateTime<Utc>,
    },

    /// A flow attribute was set
    AttributeSet {
        flow_id: String,
        name: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },

    /// Every work item of the step succeeded
    StepCompleted {
        flow_id: String,
        step_id: String,
        outputs: Args,
    },

    /// The step failed (work exhausted retries, predicate error, or cascade)
    StepFailed {
        flow_id: String,
        step_id: String,
        error: String,
    },

    /// The step was skipped without executing
    StepSkipped {
        flow_id: String,
        step_id: String,
        reason: String,
    },

    /// Every goal completed
    FlowCompleted { flow_id: String },

    /// A goal failed or became unreachable
    FlowFailed { flow_id: String, error: String },
}

impl Event {
    /// Event type name used in the wire envelope and for subscriptions
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StepRegistered { .. } => "step_registered",
            Self::StepUpdated { .. } => "step_updated",
            Self::StepUnregistered { .. } => "step_unregistered",
            Self::StepHealthChanged { .. } => "step_health_changed",
            Self::FlowActivated { .. } => "flow_activated",
            Self::FlowDeactivated { .. } => "flow_deactivated",
            Self::FlowStarted { .. } => "flow_started",
            Self::StepStarted { .. } => "step_started",
            Self::WorkStarted { .. } => "work_started",
            Self::WorkSucceeded { .. } => "work_succeeded",
            Self::WorkFailed { .. } => "work_failed",
            Self::WorkNotCompleted { .. } => "work_not_completed",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::AttributeSet { .. } => "attribute_set",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepSkipped { .. } => "step_skipped",
            Self::FlowCompleted { .. } => "flow_completed",
            Self::FlowFailed { .. } => "flow_failed",
        }
    }

    /// The flow this event belongs to, when it is a flow event
    #[must_use]
    pub fn flow_id(&self) -> Option<&str> {
        match self {
            Self::FlowStarted { flow_id, .. }
            | Self::StepStarted { flow_id, .. }
            | Self::WorkStarted { flow_id, .. }
            | Self::WorkSucceeded { flow_id, .. }
            | Self::WorkFailed { flow_id, .. }
            | Self::WorkNotCompleted { flow_id, .. }
            | Self::RetryScheduled { flow_id, .. }
            | Self::AttributeSet { flow_id, .. }
            | Self::StepCompleted { flow_id, .. }
            | Self::StepFailed { flow_id, .. }
            | Self::StepSkipped { flow_id, .. }
            | Self::FlowCompleted { flow_id }
            | Self::FlowFailed { flow_id, .. }
            | Self::FlowActivated { flow_id }
            | Self::FlowDeactivated { flow_id } => Some(flow_id),
            _ => None,
        }
    }
}

// =============================================================================
// Envelope and stored form
// =============================================================================

/// An event stamped with its occurrence time.
///
/// Serializes to the wire shape `{type, timestamp, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// When the event occurred
    pub timestamp: DateTime<Utc>,

    /// The event payload
    #[serde(flatten)]
    pub event: Event,
}

impl Envelope {
    /// Stamp an event with the current time
    #[must_use]
    pub fn now(event: Event) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

/// An event as persisted in a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Version within the aggregate stream (1-based, monotonically increasing)
    pub version: u64,

    /// The enveloped event
    #[serde(flatten)]
    pub envelope: Envelope,
}

impl StoredEvent {
    /// The contained event
    #[must_use]
    pub fn event(&self) -> &Event {
        &self.envelope.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let envelope = Envelope::now(Event::FlowCompleted {
            flow_id: "f1".to_string(),
        });
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["type"], "flow_completed");
        assert_eq!(json["data"]["flow_id"], "f1");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_roundtrip() {
        let envelope = Envelope::now(Event::AttributeSet {
            flow_id: "f1".to_string(),
            name: "total".to_string(),
            value: Value::Int(7),
            provider: Some("sum".to_string()),
        });
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(envelope.event, parsed.event);
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(
            Event::WorkStarted {
                flow_id: "f".into(),
                step_id: "s".into(),
                token: Uuid::new_v4(),
                replaces: None,
            }
            .event_type(),
            "work_started"
        );
        assert_eq!(
            Event::StepUnregistered {
                step_id: "s".into()
            }
            .event_type(),
            "step_unregistered"
        );
    }

    #[test]
    fn test_stored_event_serialization() {
        let stored = StoredEvent {
            version: 3,
            envelope: Envelope::now(Event::FlowActivated {
                flow_id: "f1".to_string(),
            }),
        };
        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["version"], 3);
        assert_eq!(json["type"], "flow_activated");
    }
}
