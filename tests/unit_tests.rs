use std::sync::Arc;
use std::time::Duration;

use vcluster_orchestrator::providers::HistoryStore;
use vcluster_orchestrator::providers::fs::FsHistoryStore;
use vcluster_orchestrator::providers::in_memory::InMemoryHistoryStore;
use vcluster_orchestrator::runtime::registry::ActivityRegistry;
use vcluster_orchestrator::runtime::{self, RuntimeError};
use vcluster_orchestrator::{
    Action, Event, Executor, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus, SYSTEM_TRACE_ACTIVITY,
    run_turn,
};

mod common;

async fn add_one(ctx: OrchestrationContext) -> String {
    let a = ctx.schedule_activity("AddOne", "2").into_activity().await.unwrap_or_default();
    format!("a={a}")
}

fn add_one_registry() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("AddOne", |input: String| async move {
            Ok(input.parse::<i32>().unwrap_or(0).saturating_add(1).to_string())
        })
        .build()
}

#[test]
fn first_turn_emits_one_action_per_awaited_future() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let _ = ctx.schedule_activity("Trigger", "create").into_activity().await;
        "unreachable".to_string()
    };
    let (hist, actions, out) = run_turn(Vec::new(), orchestrator);
    assert!(out.is_none(), "must not complete in the first turn");
    assert_eq!(
        actions,
        vec![Action::CallActivity {
            id: 1,
            name: "Trigger".into(),
            input: "create".into()
        }]
    );
    assert!(matches!(hist[0], Event::ActivityScheduled { id: 1, .. }));
}

#[test]
fn completion_resolves_by_correlation_id_not_position() {
    let history = vec![
        Event::ActivityScheduled {
            id: 1,
            name: "Trigger".into(),
            input: "create".into(),
        },
        Event::TimerFired { id: 42, fire_at_ms: 0 },
        Event::ActivityCompleted {
            id: 1,
            result: "accepted".into(),
        },
    ];
    let orchestrator =
        |ctx: OrchestrationContext| async move { ctx.schedule_activity("Trigger", "create").into_activity().await };
    let (_, actions, out) = run_turn(history, orchestrator);
    assert!(actions.is_empty(), "resolved from history, nothing new to do");
    assert_eq!(out, Some(Ok("accepted".to_string())));
}

#[test]
fn trace_is_emitted_once_across_replays() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        ctx.trace_info("starting");
        ctx.schedule_timer(1_000).into_timer().await;
        "done".to_string()
    };
    let (hist, actions, _) = run_turn(Vec::new(), orchestrator);
    let traces = |acts: &[Action]| {
        acts.iter()
            .filter(|a| matches!(a, Action::CallActivity { name, .. } if name == SYSTEM_TRACE_ACTIVITY))
            .count()
    };
    assert_eq!(traces(&actions), 1);

    let (_, replay_actions, out) = run_turn(hist, orchestrator);
    assert!(out.is_none());
    assert_eq!(traces(&replay_actions), 0, "replay must not trace again");
}

#[test]
fn continue_as_new_is_recorded_as_an_action() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        ctx.continue_as_new("attempt-2");
        String::new()
    };
    let (_, actions, out) = run_turn(Vec::new(), orchestrator);
    assert_eq!(out, Some(String::new()));
    assert_eq!(
        actions,
        vec![Action::ContinueAsNew {
            input: "attempt-2".into()
        }]
    );
}

#[test]
fn executor_drives_activity_then_timer() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let r = ctx.schedule_activity("Trigger", "create").into_activity().await.unwrap();
        ctx.schedule_timer(10).into_timer().await;
        format!("{r}+waited")
    };
    let (hist, out) = Executor::drive_to_completion(Vec::new(), orchestrator, |actions, hist| {
        for a in actions {
            match a {
                Action::CallActivity { id, input, .. } => hist.push(Event::ActivityCompleted {
                    id,
                    result: format!("ok:{input}"),
                }),
                Action::CreateTimer { id, .. } => hist.push(Event::TimerFired { id, fire_at_ms: 0 }),
                other => panic!("unexpected action {other:?}"),
            }
        }
    });
    assert_eq!(out, "ok:create+waited");
    assert_eq!(hist.len(), 4);
}

#[tokio::test]
async fn runtime_output_replays_without_new_actions() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("AddOneOrch", |ctx, _input| async move { Ok(add_one(ctx).await) })
        .build();
    let rt = runtime::Runtime::start(Arc::new(add_one_registry()), orchestrations).await;
    let handle = rt
        .clone()
        .start_orchestration("inst-replay", "AddOneOrch", "")
        .await
        .unwrap();
    let (final_history, output) = handle.await.unwrap();
    assert_eq!(output.as_deref(), Ok("a=3"));

    let (_, actions, replayed) = run_turn(final_history, add_one);
    assert!(actions.is_empty());
    assert_eq!(replayed.as_deref(), Some("a=3"));
    rt.shutdown().await;
}

#[tokio::test]
async fn status_tracks_running_completed_and_failed() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Sleeps", |ctx, _| async move {
            ctx.schedule_timer(200).into_timer().await;
            Ok("slept".to_string())
        })
        .register("Fails", |_ctx, _| async move { Err("nope".to_string()) })
        .build();
    let rt = runtime::Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;

    assert_eq!(rt.get_orchestration_status("missing").await, OrchestrationStatus::NotFound);

    rt.clone().start_orchestration_detached("s1", "Sleeps", "").await.unwrap();
    assert_eq!(rt.get_orchestration_status("s1").await, OrchestrationStatus::Running);
    assert_eq!(
        rt.wait_for_orchestration("s1", Duration::from_secs(5)).await.unwrap(),
        OrchestrationStatus::Completed {
            output: "slept".into()
        }
    );

    rt.clone().start_orchestration_detached("f1", "Fails", "").await.unwrap();
    assert_eq!(
        rt.wait_for_orchestration("f1", Duration::from_secs(5)).await.unwrap(),
        OrchestrationStatus::Failed { error: "nope".into() }
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn second_start_of_active_instance_is_rejected() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Waits", |ctx, _| async move { Ok(ctx.schedule_wait("Go").into_event().await) })
        .build();
    let rt = runtime::Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;

    let h = rt.clone().start_orchestration("once", "Waits", "").await.unwrap();
    let err = rt.clone().start_orchestration("once", "Waits", "").await.unwrap_err();
    assert_eq!(err, RuntimeError::AlreadyActive("once".into()));

    assert!(common::wait_for_subscription(rt.history_store(), "once", "Go", 2_000).await);
    rt.raise_event("once", "Go", "went").await.unwrap();
    let (hist, out) = h.await.unwrap();
    assert_eq!(out.as_deref(), Ok("went"));
    let starts = hist
        .iter()
        .filter(|e| matches!(e, Event::OrchestrationStarted { .. }))
        .count();
    assert_eq!(starts, 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn client_errors_for_unknown_targets() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Noop", |_ctx, _| async move { Ok(String::new()) })
        .build();
    let rt = runtime::Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;

    assert_eq!(
        rt.raise_event("nobody", "Go", "").await,
        Err(RuntimeError::NotFound("nobody".into()))
    );
    assert_eq!(
        rt.clone().start_orchestration_detached("x", "Missing", "").await,
        Err(RuntimeError::UnknownOrchestration("Missing".into()))
    );

    // Finished instances no longer accept events
    rt.clone().start_orchestration_detached("done", "Noop", "").await.unwrap();
    rt.wait_for_orchestration("done", Duration::from_secs(5)).await.unwrap();
    assert!(matches!(
        rt.raise_event("done", "Go", "").await,
        Err(RuntimeError::NotFound(_))
    ));
    rt.shutdown().await;
}

#[tokio::test]
async fn continue_as_new_rolls_into_fresh_executions() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Countdown", |ctx, input: String| async move {
            let n: u32 = input.parse().map_err(|e| format!("bad input: {e}"))?;
            if n > 0 {
                ctx.schedule_timer(5).into_timer().await;
                ctx.continue_as_new((n - 1).to_string());
                return Ok(String::new());
            }
            Ok("liftoff".to_string())
        })
        .build();
    let rt = runtime::Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;

    let h = rt.clone().start_orchestration("cd", "Countdown", "2").await.unwrap();
    let (hist, out) = h.await.unwrap();
    assert_eq!(out.as_deref(), Ok("liftoff"));
    assert!(matches!(&hist[0], Event::OrchestrationStarted { input, .. } if input == "0"));
    assert_eq!(rt.list_executions("cd").await, vec![1, 2, 3]);

    let first = rt.get_execution_history("cd", 1).await;
    assert!(matches!(
        first.last(),
        Some(Event::OrchestrationContinuedAsNew { input }) if input == "1"
    ));
    rt.shutdown().await;
}

#[tokio::test]
async fn typed_orchestration_round_trips_structured_input() {
    #[derive(serde::Serialize, serde::Deserialize)]
    struct Sizes {
        cpu: u32,
        memory_gi: u32,
    }

    let orchestrations = OrchestrationRegistry::builder()
        .register_typed::<Sizes, u32, _, _>("Total", |_ctx, sizes: Sizes| async move {
            Ok(sizes.cpu + sizes.memory_gi)
        })
        .build();
    let rt = runtime::Runtime::start(Arc::new(ActivityRegistry::builder().build()), orchestrations).await;
    let h = rt
        .clone()
        .start_orchestration_typed::<Sizes, u32>("typed", "Total", Sizes { cpu: 2, memory_gi: 4 })
        .await
        .unwrap();
    let (_, out) = h.await.unwrap();
    assert_eq!(out, Ok(6));
    rt.shutdown().await;
}

async fn check_multi_execution_contract(store: &dyn HistoryStore) {
    assert_eq!(store.create_new_execution("i1", "O", "first").await.unwrap(), 1);
    store
        .append("i1", vec![Event::OrchestrationContinuedAsNew { input: "second".into() }])
        .await
        .unwrap();
    assert_eq!(store.create_new_execution("i1", "O", "second").await.unwrap(), 2);
    store
        .append("i1", vec![Event::OrchestrationCompleted { output: "ok".into() }])
        .await
        .unwrap();

    assert_eq!(store.list_executions("i1").await, vec![1, 2]);
    assert_eq!(store.latest_execution_id("i1").await, Some(2));
    let older = store.read_with_execution("i1", 1).await;
    assert_eq!(older.len(), 2);
    assert!(matches!(&older[0], Event::OrchestrationStarted { input, .. } if input == "first"));
    let latest = store.read("i1").await;
    assert_eq!(latest, store.read_with_execution("i1", 2).await);
    assert!(matches!(latest.last(), Some(Event::OrchestrationCompleted { .. })));
    assert_eq!(store.list_instances().await, vec!["i1".to_string()]);
    assert!(store.read("unknown").await.is_empty());
}

#[tokio::test]
async fn in_memory_store_keeps_executions_apart() {
    check_multi_execution_contract(&InMemoryHistoryStore::default()).await;
}

#[tokio::test]
async fn fs_store_keeps_executions_apart() {
    let dir = tempfile::tempdir().unwrap();
    check_multi_execution_contract(&FsHistoryStore::new(dir.path(), true)).await;
}
