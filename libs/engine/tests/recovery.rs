//! Startup recovery: resuming flows from the persisted log

mod support;

use std::sync::Arc;
use std::time::Duration;

use argyll_domain::{Args, StepResult};
use argyll_engine::{Engine, EngineConfig, FlowStatus, WorkStatus};

use support::{args, async_step, engine_with, s, TestInvoker, TestResponse};

#[tokio::test]
async fn test_async_work_survives_restart_and_completes_via_webhook() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, store) = engine_with(Arc::clone(&invoker));

    engine
        .register_step(async_step("slow", &[], &["result"]))
        .await
        .unwrap();
    invoker.respond("slow", vec![TestResponse::Accepted]).await;

    engine
        .start_flow("restarted", &["slow".to_string()], Args::new())
        .await
        .unwrap();

    // Wait for the invocation to be acknowledged
    let token = loop {
        let state = engine.get_flow_state("restarted").await.unwrap();
        let active = state
            .execution("slow")
            .and_then(|e| {
                e.work_items
                    .values()
                    .find(|item| item.status == WorkStatus::Active)
            })
            .map(|item| item.token);
        if let Some(token) = active {
            break token;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    // "Restart": a fresh engine over the same store
    drop(engine);
    let replacement_invoker = Arc::new(TestInvoker::new());
    let engine = Engine::new(
        store,
        Arc::clone(&replacement_invoker) as Arc<dyn argyll_engine::StepInvoker>,
        EngineConfig::default(),
    );

    let report = engine.recover().await.unwrap();
    assert_eq!(report.flows_resumed, 1);
    // The async item is preserved, not re-invoked
    assert_eq!(report.work_awaiting_webhook, 1);
    assert_eq!(report.work_redispatched, 0);
    assert_eq!(replacement_invoker.total().await, 0);

    // The persisted Active state still routes the webhook
    let mut terminal = engine
        .subscribe("flow:restarted", vec!["flow_completed".to_string()])
        .await;
    engine
        .complete_work(
            "restarted",
            "slow",
            token,
            StepResult::ok(args(&[("result", s("late"))])),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(3), terminal.recv())
        .await
        .expect("flow should complete after the webhook")
        .unwrap();

    let state = engine.get_flow_state("restarted").await.unwrap();
    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(state.attribute("result"), Some(&s("late")));
}

#[tokio::test]
async fn test_recovery_with_no_active_flows_is_quiet() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, _store) = engine_with(invoker);

    let report = engine.recover().await.unwrap();
    assert_eq!(report.flows_resumed, 0);
    assert_eq!(report.retries_rescheduled, 0);
}
