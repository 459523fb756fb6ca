//! Partition aggregate: the engine-wide active-flow index
//!
//! Tracks which flows are live so recovery knows what to resume and the
//! catalog knows which goals are in use.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::events::{AggregateState, Envelope, Event, FoldError};

/// Materialized active-flow index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionState {
    /// Flows currently in the active set
    pub active: BTreeSet<String>,
}

impl PartitionState {
    /// Whether a flow is in the active set
    #[must_use]
    pub fn is_active(&self, flow_id: &str) -> bool {
        self.active.contains(flow_id)
    }
}

impl AggregateState for PartitionState {
    fn fold(&mut self, envelope: &Envelope) -> Result<(), FoldError> {
        match &envelope.event {
            Event::FlowActivated { flow_id } => {
                if !self.active.insert(flow_id.clone()) {
                    return Err(FoldError(format!("flow '{flow_id}' is already active")));
                }
                Ok(())
            }
            Event::FlowDeactivated { flow_id } => {
                if !self.active.remove(flow_id) {
                    return Err(FoldError(format!("flow '{flow_id}' is not active")));
                }
                Ok(())
            }
            other => Err(FoldError(format!(
                "partition aggregate cannot apply '{}'",
                other.event_type()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activate_deactivate() {
        let mut state = PartitionState::default();
        state
            .fold(&Envelope::now(Event::FlowActivated {
                flow_id: "f1".to_string(),
            }))
            .unwrap();
        assert!(state.is_active("f1"));

        state
            .fold(&Envelope::now(Event::FlowDeactivated {
                flow_id: "f1".to_string(),
            }))
            .unwrap();
        assert!(!state.is_active("f1"));
    }

    #[test]
    fn test_double_activate_rejected() {
        let mut state = PartitionState::default();
        let event = Envelope::now(Event::FlowActivated {
            flow_id: "f1".to_string(),
        });
        state.fold(&event).unwrap();
        assert!(state.fold(&event).is_err());
    }
}
