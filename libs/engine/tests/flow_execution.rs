//! End-to-end flow execution: chains, diamonds, lazy planning, memoization,
//! and sub-flows

mod support;

use std::sync::Arc;

use argyll_domain::{Args, Value};
use argyll_engine::{ExecStatus, FlowStatus};

use support::{args, engine_with, flow_step, run_flow, s, script_step, sync_step, TestInvoker};

#[tokio::test]
async fn test_linear_chain_completes() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, _store) = engine_with(Arc::clone(&invoker));

    engine.register_step(sync_step("a", &[], &["a"])).await.unwrap();
    engine.register_step(sync_step("b", &["a"], &["b"])).await.unwrap();
    engine.register_step(sync_step("c", &["b"], &["c"])).await.unwrap();

    invoker.succeed_with("a", &[("a", s("from-A"))]).await;
    invoker.succeed_with("b", &[("b", s("from-B"))]).await;
    invoker.succeed_with("c", &[("c", s("done"))]).await;

    let state = run_flow(&engine, "linear", &["c"], Args::new()).await;

    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(state.attribute("a"), Some(&s("from-A")));
    assert_eq!(state.attribute("b"), Some(&s("from-B")));
    assert_eq!(state.attribute("c"), Some(&s("done")));

    assert_eq!(invoker.count("a").await, 1);
    assert_eq!(invoker.count("b").await, 1);
    assert_eq!(invoker.count("c").await, 1);
}

#[tokio::test]
async fn test_diamond_completes() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, _store) = engine_with(Arc::clone(&invoker));

    engine
        .register_step(script_step(
            "a",
            &[],
            &["p", "q"],
            r##"#{ p: "left", q: "right" }"##,
        ))
        .await
        .unwrap();
    engine
        .register_step(script_step("b", &["p"], &["x"], r##"#{ x: "via-" + p }"##))
        .await
        .unwrap();
    engine
        .register_step(script_step("c", &["q"], &["y"], r##"#{ y: "via-" + q }"##))
        .await
        .unwrap();
    engine
        .register_step(script_step(
            "d",
            &["x", "y"],
            &["z"],
            r##"#{ z: x + "+" + y }"##,
        ))
        .await
        .unwrap();

    let state = run_flow(&engine, "diamond", &["d"], Args::new()).await;

    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(state.attribute("z"), Some(&s("via-left+via-right")));
    assert_eq!(state.execution("b").unwrap().status, ExecStatus::Completed);
    assert_eq!(state.execution("c").unwrap().status, ExecStatus::Completed);
    assert_eq!(state.executions.len(), 4);
}

#[tokio::test]
async fn test_lazy_planning_ignores_unrelated_steps() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, _store) = engine_with(Arc::clone(&invoker));

    engine.register_step(sync_step("a", &[], &["a"])).await.unwrap();
    engine.register_step(sync_step("b", &["a"], &["b"])).await.unwrap();
    engine.register_step(sync_step("c", &["b"], &["c"])).await.unwrap();
    for name in ["d", "e", "f", "g", "h", "i", "j"] {
        let output = format!("out_{name}");
        engine
            .register_step(sync_step(name, &[], &[output.as_str()]))
            .await
            .unwrap();
    }

    invoker.succeed_with("a", &[("a", s("va"))]).await;
    invoker.succeed_with("b", &[("b", s("vb"))]).await;
    invoker.succeed_with("c", &[("c", s("vc"))]).await;

    let state = run_flow(&engine, "lazy", &["c"], Args::new()).await;

    assert_eq!(state.status, FlowStatus::Completed);
    // Only the three steps feeding the goal are planned and executed
    assert_eq!(state.executions.len(), 3);
    assert_eq!(invoker.total().await, 3);
    assert!(state.execution("d").is_none());
}

#[tokio::test]
async fn test_init_supplied_attribute_skips_provider() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, _store) = engine_with(Arc::clone(&invoker));

    engine.register_step(sync_step("a", &[], &["a"])).await.unwrap();
    engine.register_step(sync_step("b", &["a"], &["b"])).await.unwrap();

    invoker.succeed_with("b", &[("b", s("vb"))]).await;

    let state = run_flow(&engine, "seeded", &["b"], args(&[("a", s("given"))])).await;

    assert_eq!(state.status, FlowStatus::Completed);
    assert!(state.execution("a").is_none());
    assert_eq!(invoker.count("a").await, 0);
    // Initial values carry no provider
    assert!(state.attributes["a"].provider.is_none());
    assert_eq!(
        state.attributes["b"].provider.as_deref(),
        Some("b")
    );
}

#[tokio::test]
async fn test_memoized_step_invoked_once_across_flows() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, _store) = engine_with(Arc::clone(&invoker));

    let mut cached = sync_step("expensive", &[], &["answer"]);
    cached.memoizable = true;
    engine.register_step(cached).await.unwrap();

    invoker
        .succeed_with("expensive", &[("answer", Value::Int(42))])
        .await;

    let first = run_flow(&engine, "memo-1", &["expensive"], Args::new()).await;
    let second = run_flow(&engine, "memo-2", &["expensive"], Args::new()).await;

    assert_eq!(first.status, FlowStatus::Completed);
    assert_eq!(second.status, FlowStatus::Completed);
    assert_eq!(second.attribute("answer"), Some(&Value::Int(42)));
    // The second flow was served from the memoization cache
    assert_eq!(invoker.count("expensive").await, 1);
}

#[tokio::test]
async fn test_sub_flow_maps_inputs_and_outputs() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, _store) = engine_with(Arc::clone(&invoker));

    engine
        .register_step(sync_step("inner", &["raw"], &["processed"]))
        .await
        .unwrap();
    engine
        .register_step(flow_step(
            "outer",
            &["order"],
            &["final"],
            &["inner"],
            &[("order", "raw")],
            &[("processed", "final")],
        ))
        .await
        .unwrap();

    invoker
        .succeed_with("inner", &[("processed", s("cooked"))])
        .await;

    let state = run_flow(
        &engine,
        "parent",
        &["outer"],
        args(&[("order", s("ingredients"))]),
    )
    .await;

    assert_eq!(state.status, FlowStatus::Completed);
    assert_eq!(state.attribute("final"), Some(&s("cooked")));
    assert_eq!(invoker.count("inner").await, 1);
}

#[tokio::test]
async fn test_flow_deactivates_after_completion() {
    let invoker = Arc::new(TestInvoker::new());
    let (engine, _store) = engine_with(Arc::clone(&invoker));

    engine.register_step(sync_step("a", &[], &["a"])).await.unwrap();
    invoker.succeed_with("a", &[("a", s("va"))]).await;

    let mut deactivations = engine
        .subscribe("partition", vec!["flow_deactivated".to_string()])
        .await;

    let state = run_flow(&engine, "short", &["a"], Args::new()).await;
    assert_eq!(state.status, FlowStatus::Completed);

    let event = tokio::time::timeout(std::time::Duration::from_secs(3), deactivations.recv())
        .await
        .expect("flow should be deactivated")
        .unwrap();
    assert_eq!(event.event().event_type(), "flow_deactivated");
}
