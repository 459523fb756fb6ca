//! Engine facade
//!
//! Wires the catalog, scheduler, caches, and event infrastructure together
//! and exposes the core API consumed by transport adapters.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use argyll_domain::{Args, Step, StepResult, WorkConfig};
use argyll_script::{ScriptError, ScriptRuntime, ScriptRuntimeConfig};

use crate::catalog::{Catalog, CatalogError, CatalogState, HealthStatus};
use crate::events::{
    AggregateCache, AggregateRef, EventStore, Hub, StoreError, Subscription,
};
use crate::flow::{FlowError, FlowState};
use crate::invoker::StepInvoker;
use crate::memo::MemoCache;
use crate::plan::{generate_plan, ExecutionPlan, PlanError};
use crate::recovery::{recover, RecoveryReport};
use crate::scheduler::{Scheduler, SchedulerSettings};

// =============================================================================
// Errors
// =============================================================================

/// Umbrella error for the core API
#[derive(Debug, Error)]
pub enum EngineError {
    /// Catalog operation failed
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Flow operation failed
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// Planning failed
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// Script runtime failure
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// Event store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// Configuration
// =============================================================================

/// Engine tuning knobs, typically loaded from the environment
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL for async webhook callbacks
    pub webhook_base: String,

    /// Default per-invocation deadline when a step omits one
    pub step_timeout: Duration,

    /// Flow materialized-view LRU capacity
    pub flow_cache_size: usize,

    /// Memoization LRU capacity
    pub memo_cache_size: usize,

    /// Compiled-script LRU capacity
    pub script_cache_size: usize,

    /// Imperative-dialect engine pool size
    pub script_pool_size: usize,

    /// Engine-wide retry defaults for zero-valued step fields
    pub retry_defaults: WorkConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let settings = SchedulerSettings::default();
        Self {
            webhook_base: settings.webhook_base,
            step_timeout: settings.step_timeout,
            flow_cache_size: 1_024,
            memo_cache_size: 1_024,
            script_cache_size: 1_024,
            script_pool_size: 10,
            retry_defaults: settings.retry_defaults,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The workflow engine
pub struct Engine {
    catalog: Arc<Catalog>,
    scheduler: Arc<Scheduler>,
    hub: Arc<Hub>,
}

impl Engine {
    /// Build an engine over the given store and invoker
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        invoker: Arc<dyn StepInvoker>,
        config: EngineConfig,
    ) -> Self {
        let hub = Arc::new(Hub::new());
        let scripts = Arc::new(ScriptRuntime::new(&ScriptRuntimeConfig {
            cache_size: config.script_cache_size,
            pool_size: config.script_pool_size,
        }));

        let catalog = Arc::new(Catalog::new(
            AggregateCache::new(Arc::clone(&store), Arc::clone(&hub), 1),
            Arc::clone(&scripts),
        ));
        let flows = AggregateCache::new(
            Arc::clone(&store),
            Arc::clone(&hub),
            config.flow_cache_size,
        );
        let partition = AggregateCache::new(Arc::clone(&store), Arc::clone(&hub), 1);
        let memo = Arc::new(MemoCache::new(config.memo_cache_size));

        let scheduler = Scheduler::new(
            flows,
            partition,
            Arc::clone(&catalog),
            Arc::clone(&hub),
            scripts,
            memo,
            invoker,
            SchedulerSettings {
                webhook_base: config.webhook_base,
                step_timeout: config.step_timeout,
                retry_defaults: config.retry_defaults,
            },
        );

        Self {
            catalog,
            scheduler,
            hub,
        }
    }

    // =========================================================================
    // Catalog surface
    // =========================================================================

    /// Register a step (idempotent for identical definitions)
    pub async fn register_step(&self, step: Step) -> Result<(), EngineError> {
        self.catalog.register_step(step).await?;
        Ok(())
    }

    /// Replace a step definition
    pub async fn update_step(&self, step: Step) -> Result<(), EngineError> {
        self.catalog.update_step(step).await?;
        Ok(())
    }

    /// Remove a step; fails with `InUse` while it is a goal of an active flow
    pub async fn unregister_step(&self, step_id: &str) -> Result<(), EngineError> {
        if self.step_in_use(step_id).await? {
            return Err(CatalogError::InUse(step_id.to_string()).into());
        }
        self.catalog.unregister_step(step_id).await?;
        Ok(())
    }

    async fn step_in_use(&self, step_id: &str) -> Result<bool, EngineError> {
        let active = self
            .scheduler
            .partition_snapshot()
            .await
            .map_err(FlowError::from)?;
        for flow_id in active {
            match self.scheduler.get_flow(&flow_id).await {
                Ok(state) => {
                    if !state.is_terminal() && state.plan.is_goal(step_id) {
                        return Ok(true);
                    }
                }
                Err(FlowError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Record a health probe result for a step
    pub async fn set_step_health(
        &self,
        step_id: &str,
        status: HealthStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        self.catalog.set_step_health(step_id, status, error).await?;
        Ok(())
    }

    /// Fetch one step definition
    pub async fn get_step(&self, step_id: &str) -> Result<Step, EngineError> {
        Ok(self.catalog.get_step(step_id).await?)
    }

    /// Snapshot of the whole catalog
    pub async fn catalog_state(&self) -> Result<CatalogState, EngineError> {
        Ok(self.catalog.snapshot().await?)
    }

    // =========================================================================
    // Flow surface
    // =========================================================================

    /// Compute the execution plan for the given goals and initial values
    pub async fn get_execution_plan(
        &self,
        goals: &[String],
        init: &Args,
    ) -> Result<ExecutionPlan, EngineError> {
        let catalog = self.catalog.snapshot().await?;
        Ok(generate_plan(&catalog.steps, goals, init)?)
    }

    /// Plan and start a flow
    pub async fn start_flow(
        &self,
        flow_id: &str,
        goals: &[String],
        init: Args,
    ) -> Result<(), EngineError> {
        let plan = self.get_execution_plan(goals, &init).await?;
        self.start_flow_with_plan(flow_id, plan, init).await
    }

    /// Start a flow from a previously computed plan
    pub async fn start_flow_with_plan(
        &self,
        flow_id: &str,
        plan: ExecutionPlan,
        init: Args,
    ) -> Result<(), EngineError> {
        self.scheduler.start_flow(flow_id, plan, init).await?;
        Ok(())
    }

    /// Current state of a flow
    pub async fn get_flow_state(&self, flow_id: &str) -> Result<FlowState, EngineError> {
        Ok(self.scheduler.get_flow(flow_id).await?)
    }

    /// Complete a work item from an external `StepResult` (webhook and
    /// sync-response path). A duplicate delivery yields `InvalidTransition`
    /// and no events.
    pub async fn complete_work(
        &self,
        flow_id: &str,
        step_id: &str,
        token: Uuid,
        result: StepResult,
    ) -> Result<(), EngineError> {
        self.scheduler
            .complete_work(flow_id, step_id, token, result)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Events, recovery, shutdown
    // =========================================================================

    /// Subscribe to an aggregate topic (`catalog`, `partition`,
    /// `flow:<id>`), optionally filtered by event types
    pub async fn subscribe(&self, topic: &str, event_types: Vec<String>) -> Subscription {
        self.hub.subscribe(topic, event_types).await
    }

    /// Run the startup recovery pass
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        Ok(recover(&self.scheduler).await?)
    }

    /// Stop accepting work and wait (bounded) for in-flight invocations
    pub async fn shutdown(&self, grace: Duration) {
        self.scheduler.shutdown(grace).await;
    }
}

impl Scheduler {
    /// Active flows per the partition index
    pub(crate) async fn partition_snapshot(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .partition
            .get(&AggregateRef::partition())
            .await?
            .map(|(state, _)| state.active.into_iter().collect())
            .unwrap_or_default())
    }
}
