//! Retry semantics: scheduling, backoff, token reuse, and exhaustion

mod support;

use std::sync::Arc;

use argyll_domain::{Args, BackoffKind, WorkConfig};
use argyll_engine::{AggregateRef, Event, FlowStatus};
use chrono::Utc;
use uuid::Uuid;

use support::{engine_with, run_flow, s, sync_step, TestInvoker, TestResponse};

fn retrying_work() -> WorkConfig {
    WorkConfig {
        max_retries: 2,
        init_backoff_ms: 200,
        max_backoff_ms: 1_000,
        backoff: BackoffKind::Fixed,
        parallelism: 1,
    }
}

/// Event log for one flow, as (event type, event) pairs
async fn flow_events(
    store: &argyll_engine::MemoryEventStore,
    flow_id: &str,
) -> Vec<(String, Event)> {
    use argyll_engine::EventStore;
    store
        .load(&AggregateRef::flow(flow_id), 0)
        .await
        .unwrap()
        .into_iter()
        .map(|stored| {
            (
                stored.event().event_type().to_string(),
                stored.event().clone(),
            )
        })
        .collect()
}

#[tokio::test]
async fn test_transient_failure_retries_then_succeeds() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, store) = engine_with(Arc::clone(&invoker));

    let mut flaky = sync_step("flaky", &[], &["out"]);
    flaky.work = retrying_work();
    engine.register_step(flaky).await.unwrap();

    invoker
        .respond(
            "flaky",
            vec![
                TestResponse::Transient("connection reset".to_string()),
                TestResponse::Ok(argyll_domain::StepResult::ok(
                    [("out".to_string(), s("recovered"))].into_iter().collect(),
                )),
            ],
        )
        .await;

    let started_at = Utc::now();
    let state = run_flow(&engine, "retry", &["flaky"], Args::new()).await;

    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(state.attribute("out"), Some(&s("recovered")));
    assert_eq!(invoker.count("flaky").await, 2);

    let types: Vec<String> = flow_events(&store, "retry")
        .await
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    let expected = [
        "step_started",
        "work_started",
        "work_not_completed",
        "retry_scheduled",
        "work_started",
        "work_succeeded",
    ];
    // The expected sequence appears in order within the log
    let mut cursor = 0;
    for t in &types {
        if cursor < expected.len() && t == expected[cursor] {
            cursor += 1;
        }
    }
    assert_eq!(cursor, expected.len(), "log was: {types:?}");

    // The scheduled retry used attempt 1 and the fixed 200ms delay
    for (_, event) in flow_events(&store, "retry").await {
        if let Event::RetryScheduled {
            attempt, due_at, ..
        } = event
        {
            assert_eq!(attempt, 1);
            let delay = (due_at - started_at).num_milliseconds();
            assert!((150..1_500).contains(&delay), "delay was {delay}ms");
        }
    }
}

#[tokio::test]
async fn test_exponential_backoff_doubles_scheduled_delays() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, store) = engine_with(Arc::clone(&invoker));

    let mut flaky = sync_step("flaky", &[], &["out"]);
    flaky.work = WorkConfig {
        max_retries: 2,
        init_backoff_ms: 100,
        max_backoff_ms: 2_000,
        backoff: BackoffKind::Exponential,
        parallelism: 1,
    };
    engine.register_step(flaky).await.unwrap();

    invoker
        .respond(
            "flaky",
            vec![
                TestResponse::Transient("reset".to_string()),
                TestResponse::Transient("reset again".to_string()),
                TestResponse::Ok(argyll_domain::StepResult::ok(Args::new())),
            ],
        )
        .await;

    let state = run_flow(&engine, "expo", &["flaky"], Args::new()).await;
    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(invoker.count("flaky").await, 3);

    // Scheduled delays double: init * 2^attempt gives 200ms then 400ms
    use argyll_engine::EventStore;
    let stored = store.load(&AggregateRef::flow("expo"), 0).await.unwrap();
    let mut delays = Vec::new();
    for event in &stored {
        if let Event::RetryScheduled {
            attempt, due_at, ..
        } = event.event()
        {
            delays.push((*attempt, (*due_at - event.envelope.timestamp).num_milliseconds()));
        }
    }
    assert_eq!(delays.len(), 2);
    assert_eq!(delays[0].0, 1);
    assert!(
        (150..300).contains(&delays[0].1),
        "first delay was {}ms",
        delays[0].1
    );
    assert_eq!(delays[1].0, 2);
    assert!(
        (350..500).contains(&delays[1].1),
        "second delay was {}ms",
        delays[1].1
    );
}

async fn work_started_tokens(
    store: &argyll_engine::MemoryEventStore,
    flow_id: &str,
) -> Vec<Uuid> {
    flow_events(store, flow_id)
        .await
        .into_iter()
        .filter_map(|(_, event)| match event {
            Event::WorkStarted { token, .. } => Some(token),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_retry_regenerates_token_for_non_memoizable() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, store) = engine_with(Arc::clone(&invoker));

    let mut flaky = sync_step("flaky", &[], &["out"]);
    flaky.work = retrying_work();
    engine.register_step(flaky).await.unwrap();

    invoker
        .respond(
            "flaky",
            vec![
                TestResponse::Transient("reset".to_string()),
                TestResponse::Ok(argyll_domain::StepResult::ok(Args::new())),
            ],
        )
        .await;

    run_flow(&engine, "fresh-token", &["flaky"], Args::new()).await;

    let tokens = work_started_tokens(&store, "fresh-token").await;
    assert_eq!(tokens.len(), 2);
    assert_ne!(tokens[0], tokens[1]);
}

#[tokio::test]
async fn test_retry_reuses_token_for_memoizable() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, store) = engine_with(Arc::clone(&invoker));

    let mut flaky = sync_step("flaky", &[], &["out"]);
    flaky.work = retrying_work();
    flaky.memoizable = true;
    engine.register_step(flaky).await.unwrap();

    invoker
        .respond(
            "flaky",
            vec![
                TestResponse::Transient("reset".to_string()),
                TestResponse::Ok(argyll_domain::StepResult::ok(Args::new())),
            ],
        )
        .await;

    run_flow(&engine, "same-token", &["flaky"], Args::new()).await;

    let tokens = work_started_tokens(&store, "same-token").await;
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0], tokens[1]);
}

#[tokio::test]
async fn test_retry_exhaustion_fails_step_and_flow() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, store) = engine_with(Arc::clone(&invoker));

    let mut doomed = sync_step("doomed", &[], &["out"]);
    doomed.work = WorkConfig {
        max_retries: 2,
        init_backoff_ms: 20,
        max_backoff_ms: 100,
        backoff: BackoffKind::Fixed,
        parallelism: 1,
    };
    engine.register_step(doomed).await.unwrap();

    invoker
        .respond(
            "doomed",
            vec![TestResponse::Transient("still down".to_string())],
        )
        .await;

    let state = run_flow(&engine, "exhausted", &["doomed"], Args::new()).await;

    assert_eq!(state.status, FlowStatus::Failed);
    let exec = state.execution("doomed").unwrap();
    assert!(exec.error.as_deref().unwrap().contains("retries exhausted"));

    // Initial attempt plus two retries
    assert_eq!(invoker.count("doomed").await, 3);

    // retry_count is strictly increasing across the schedule events
    let mut attempts = Vec::new();
    for (_, event) in flow_events(&store, "exhausted").await {
        if let Event::RetryScheduled { attempt, .. } = event {
            attempts.push(attempt);
        }
    }
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test]
async fn test_permanent_failure_skips_retry() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, store) = engine_with(Arc::clone(&invoker));

    let mut fatal = sync_step("fatal", &[], &["out"]);
    fatal.work = retrying_work();
    engine.register_step(fatal).await.unwrap();

    invoker
        .respond(
            "fatal",
            vec![TestResponse::Ok(argyll_domain::StepResult::err(
                "bad request",
            ))],
        )
        .await;

    let state = run_flow(&engine, "no-retry", &["fatal"], Args::new()).await;

    assert_eq!(state.status, FlowStatus::Failed);
    assert_eq!(invoker.count("fatal").await, 1);

    let types: Vec<String> = flow_events(&store, "no-retry")
        .await
        .into_iter()
        .map(|(t, _)| t)
        .collect();
    assert!(!types.contains(&"retry_scheduled".to_string()));
    assert!(types.contains(&"work_failed".to_string()));
}
