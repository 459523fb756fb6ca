//! Argyll engine daemon
//!
//! Boots the engine over the in-memory event store, runs recovery, and
//! parks until ctrl-c. Transport adapters connect through the library API;
//! HTTP step kinds need an external `StepInvoker` wired in place of the
//! placeholder used here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use argyll_common::{init_tracing, RuntimeConfig};
use argyll_engine::{
    Engine, EngineConfig, InvocationOutcome, InvocationRequest, InvokeError, MemoryEventStore,
    StepInvoker,
};

/// Placeholder invoker: script and sub-flow steps run in-process; HTTP step
/// kinds fail permanently until a real invoker is wired in.
struct DisabledHttpInvoker;

#[async_trait]
impl StepInvoker for DisabledHttpInvoker {
    async fn invoke(
        &self,
        request: InvocationRequest,
    ) -> Result<InvocationOutcome, InvokeError> {
        Err(InvokeError::Permanent(format!(
            "no HTTP invoker configured for step '{}'",
            request.step_id
        )))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = RuntimeConfig::from_env()?;
    tracing::info!(
        host = %config.api_host,
        port = config.api_port,
        "starting argyll engine"
    );

    let store = Arc::new(MemoryEventStore::new());
    let engine = Engine::new(
        store,
        Arc::new(DisabledHttpInvoker),
        EngineConfig {
            webhook_base: config.webhook_base_url.clone(),
            step_timeout: config.step_timeout,
            flow_cache_size: config.flow_cache_size,
            memo_cache_size: config.memo_cache_size,
            script_cache_size: config.script_cache_size,
            script_pool_size: config.script_pool_size,
            retry_defaults: config.retry_defaults.clone(),
        },
    );

    let report = engine.recover().await?;
    tracing::info!(
        flows = report.flows_resumed,
        retries = report.retries_rescheduled,
        "recovery finished"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    engine.shutdown(Duration::from_secs(10)).await;

    Ok(())
}
