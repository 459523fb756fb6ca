//! Flow aggregate: execution state machine for a single flow

mod state;

pub use state::{
    AttributeValue, ExecStatus, ExecutionState, FlowState, FlowStatus, WorkItem, WorkStatus,
};

use std::collections::BTreeSet;

use thiserror::Error;

use crate::events::StoreError;
use crate::plan::PlanError;

/// Flow operation errors
#[derive(Debug, Error)]
pub enum FlowError {
    /// Required attributes were not supplied as initial values
    #[error("missing required initial attributes: {}", .0.iter().cloned().collect::<Vec<_>>().join(", "))]
    MissingRequired(BTreeSet<String>),

    /// A flow with this id already exists
    #[error("flow '{0}' already exists")]
    DuplicateFlow(String),

    /// The flow does not exist
    #[error("flow '{0}' not found")]
    NotFound(String),

    /// The requested state transition is not allowed (e.g. a duplicate
    /// webhook delivery for an already-terminal work item)
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Planning failed
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Event store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}
