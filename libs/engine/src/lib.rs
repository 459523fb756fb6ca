//! Argyll engine core
//!
//! Goal-driven, event-sourced workflow orchestration: the step catalog, the
//! plan generator, the flow aggregate, the scheduler/work executor, the
//! retry timer queue, the memoization cache, and startup recovery. Transport
//! adapters sit on top of [`Engine`]; step endpoints sit behind the
//! [`invoker::StepInvoker`] seam.

pub mod catalog;
pub mod engine;
pub mod events;
pub mod flow;
pub mod graph;
pub mod invoker;
pub mod memo;
pub mod plan;
pub mod recovery;
pub mod retry;
pub mod scheduler;

pub use catalog::{Catalog, CatalogError, CatalogState, HealthStatus};
pub use engine::{Engine, EngineConfig, EngineError};
pub use events::{
    AggregateRef, Envelope, Event, EventStore, Hub, MemoryEventStore, StoreError, StoredEvent,
    Subscription,
};
pub use flow::{ExecStatus, FlowError, FlowState, FlowStatus, WorkStatus};
pub use invoker::{
    InvocationOutcome, InvocationRequest, InvocationTarget, InvokeError, StepInvoker,
};
pub use plan::{ExecutionPlan, PlanError};
pub use recovery::RecoveryReport;
