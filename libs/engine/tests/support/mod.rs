//! Shared fixtures for the engine integration suites
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use argyll_domain::{
    AttrRole, AttrType, AttributeSpec, Args, BackoffKind, ScriptSpec, Step, StepBody, StepResult,
    Value, WorkConfig,
};
use argyll_engine::{
    Engine, EngineConfig, EventStore, FlowState, InvocationOutcome, InvocationRequest,
    InvokeError, MemoryEventStore, StepInvoker,
};

// =============================================================================
// Scripted invoker
// =============================================================================

/// One scripted response
#[derive(Debug, Clone)]
pub enum TestResponse {
    Ok(StepResult),
    Accepted,
    Transient(String),
}

/// Invoker double with per-step response scripts and invocation counters.
/// The last response of a script repeats once the script is exhausted.
#[derive(Default)]
pub struct TestInvoker {
    scripts: Mutex<HashMap<String, Vec<TestResponse>>>,
    counts: Mutex<HashMap<String, usize>>,
}

impl TestInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `step_id` with a successful result carrying `outputs`
    pub async fn succeed_with(&self, step_id: &str, outputs: &[(&str, Value)]) {
        let outputs: Args = outputs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        self.respond(step_id, vec![TestResponse::Ok(StepResult::ok(outputs))])
            .await;
    }

    /// Script a sequence of responses for `step_id`
    pub async fn respond(&self, step_id: &str, responses: Vec<TestResponse>) {
        self.scripts
            .lock()
            .await
            .insert(step_id.to_string(), responses);
    }

    /// How many times `step_id` was invoked
    pub async fn count(&self, step_id: &str) -> usize {
        *self.counts.lock().await.get(step_id).unwrap_or(&0)
    }

    /// Total invocations across all steps
    pub async fn total(&self) -> usize {
        self.counts.lock().await.values().sum()
    }
}

#[async_trait]
impl StepInvoker for TestInvoker {
    async fn invoke(
        &self,
        request: InvocationRequest,
    ) -> Result<InvocationOutcome, InvokeError> {
        let call_index = {
            let mut counts = self.counts.lock().await;
            let entry = counts.entry(request.step_id.clone()).or_insert(0);
            let index = *entry;
            *entry += 1;
            index
        };

        let response = {
            let scripts = self.scripts.lock().await;
            scripts.get(&request.step_id).map(|responses| {
                responses
                    .get(call_index)
                    .or_else(|| responses.last())
                    .cloned()
            })
        };

        match response.flatten() {
            None => Ok(InvocationOutcome::Completed(StepResult::ok(Args::new()))),
            Some(TestResponse::Ok(result)) => Ok(InvocationOutcome::Completed(result)),
            Some(TestResponse::Accepted) => Ok(InvocationOutcome::Accepted),
            Some(TestResponse::Transient(error)) => Err(InvokeError::Transient(error)),
        }
    }
}

// =============================================================================
// Engine fixture
// =============================================================================

/// Build an engine over a fresh in-memory store and the given invoker
pub fn engine_with(invoker: Arc<TestInvoker>) -> (Engine, Arc<MemoryEventStore>) {
    let store = Arc::new(MemoryEventStore::new());
    let config = EngineConfig {
        step_timeout: Duration::from_secs(2),
        retry_defaults: WorkConfig {
            max_retries: 1,
            init_backoff_ms: 20,
            max_backoff_ms: 200,
            backoff: BackoffKind::Fixed,
            parallelism: 1,
        },
        ..EngineConfig::default()
    };
    let engine = Engine::new(Arc::clone(&store) as Arc<dyn EventStore>, invoker, config);
    (engine, store)
}

/// Start a flow and wait for its terminal event
pub async fn run_flow(engine: &Engine, flow_id: &str, goals: &[&str], init: Args) -> FlowState {
    let mut subscription = engine
        .subscribe(
            &format!("flow:{flow_id}"),
            vec!["flow_completed".to_string(), "flow_failed".to_string()],
        )
        .await;

    let goals: Vec<String> = goals.iter().map(|g| (*g).to_string()).collect();
    engine
        .start_flow(flow_id, &goals, init)
        .await
        .expect("flow should start");

    tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("flow should reach a terminal state")
        .expect("subscription should stay open");

    engine
        .get_flow_state(flow_id)
        .await
        .expect("flow state should be readable")
}

// =============================================================================
// Step constructors
// =============================================================================

/// Synchronous HTTP step with required inputs and declared outputs
pub fn sync_step(id: &str, inputs: &[&str], outputs: &[&str]) -> Step {
    Step {
        id: id.to_string(),
        attributes: attrs(inputs, outputs),
        body: StepBody::SyncHttp {
            endpoint: format!("http://steps.test/{id}"),
            health_endpoint: None,
            timeout_ms: None,
        },
        predicate: None,
        work: WorkConfig::default(),
        memoizable: false,
    }
}

/// Asynchronous HTTP step
pub fn async_step(id: &str, inputs: &[&str], outputs: &[&str]) -> Step {
    Step {
        id: id.to_string(),
        attributes: attrs(inputs, outputs),
        body: StepBody::AsyncHttp {
            endpoint: format!("http://steps.test/{id}"),
            health_endpoint: None,
            timeout_ms: None,
        },
        predicate: None,
        work: WorkConfig::default(),
        memoizable: false,
    }
}

/// Script-bodied step
pub fn script_step(id: &str, inputs: &[&str], outputs: &[&str], source: &str) -> Step {
    Step {
        id: id.to_string(),
        attributes: attrs(inputs, outputs),
        body: StepBody::Script {
            script: ScriptSpec::rhai(source),
        },
        predicate: None,
        work: WorkConfig::default(),
        memoizable: false,
    }
}

/// Sub-flow step
pub fn flow_step(
    id: &str,
    inputs: &[&str],
    outputs: &[&str],
    goals: &[&str],
    input_map: &[(&str, &str)],
    output_map: &[(&str, &str)],
) -> Step {
    let map = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    };
    Step {
        id: id.to_string(),
        attributes: attrs(inputs, outputs),
        body: StepBody::Flow {
            goals: goals.iter().map(|g| (*g).to_string()).collect(),
            input_map: map(input_map),
            output_map: map(output_map),
        },
        predicate: None,
        work: WorkConfig::default(),
        memoizable: false,
    }
}

fn attrs(inputs: &[&str], outputs: &[&str]) -> BTreeMap<String, AttributeSpec> {
    let mut attributes = BTreeMap::new();
    for name in inputs {
        attributes.insert(
            (*name).to_string(),
            AttributeSpec::input(AttrRole::Required, AttrType::Any),
        );
    }
    for name in outputs {
        attributes.insert((*name).to_string(), AttributeSpec::output(AttrType::Any));
    }
    attributes
}

/// Args literal helper
pub fn args(pairs: &[(&str, Value)]) -> Args {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// String value shorthand
pub fn s(text: &str) -> Value {
    Value::Str(text.to_string())
}
