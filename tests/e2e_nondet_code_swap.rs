// Workflow code swapped between activations: the replayed decisions no longer
// match history, so the run fails with a nondeterminism diagnostic and no
// decision of the new code is appended.

use duraflow::runtime::Runtime;
use duraflow::{ActivityRegistry, Client, ErrorDetails, EventKind, InstanceStatus, WorkflowContext, WorkflowRegistry};
use std::sync::Arc;
use std::time::Duration;

mod common;

fn activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        // Slow enough that the first runtime is shutting down when it completes.
        .register("A1", |_ctx, input: String| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(format!("A1:{input}"))
        })
        .register("B1", |_ctx, input: String| async move { Ok(format!("B1:{input}")) })
        .build()
}

fn code_a() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register("SwapTest", |ctx: WorkflowContext, _input: String| async move {
            ctx.schedule_activity("A1", "foo").await.map_err(|e| e.to_string())
        })
        .build()
}

fn code_b() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register("SwapTest", |ctx: WorkflowContext, _input: String| async move {
            ctx.schedule_activity("B1", "bar").await.map_err(|e| e.to_string())
        })
        .build()
}

#[tokio::test]
async fn code_swap_triggers_nondeterminism() {
    let store = common::in_memory();
    let client = Client::new(store.clone());

    let rt_a = Runtime::start_with_options(store.clone(), Arc::new(activities()), code_a(), common::fast_options()).await;
    let instance = client.submit("ns", "inst-swap", None, "SwapTest", "").await.unwrap();
    assert!(
        common::wait_for_history(&store, &instance, |h| common::has_scheduled(h, "A1"), 5_000).await,
        "timed out waiting for A1 schedule"
    );
    rt_a.shutdown().await;

    // The in-flight A1 finished during shutdown; its completion waits for a coordinator.
    assert!(common::wait_for_history(&store, &instance, |h| common::count(h, "ActivityCompleted") == 1, 5_000).await);
    assert_eq!(
        client.get_status(&instance).await.unwrap(),
        InstanceStatus::Running
    );

    let rt_b = Runtime::start_with_options(store.clone(), Arc::new(activities()), code_b(), common::fast_options()).await;
    let status = client
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    match status {
        InstanceStatus::Failed {
            details: ErrorDetails::Nondeterminism { expected, actual, .. },
        } => {
            assert!(expected.contains("A1"), "expected side: {expected}");
            assert!(actual.contains("B1"), "actual side: {actual}");
        }
        other => panic!("expected nondeterminism failure, got {other:?}"),
    }

    let history = client.read_history(&instance).await.unwrap();
    common::assert_well_formed(&history);
    assert!(!common::has_scheduled(&history, "B1"), "new code's decision was appended");
    let tail: Vec<&str> = history.iter().rev().take(2).map(|e| e.kind.name()).collect();
    assert_eq!(tail, vec!["WorkflowFailed", "ActivationCompleted"]);
    assert!(matches!(
        history.last().map(|e| &e.kind),
        Some(EventKind::WorkflowFailed { .. })
    ));
    rt_b.shutdown().await;
}

/// A divergence detected later in history fails the run just the same.
#[tokio::test]
async fn changed_activity_input_is_nondeterministic() {
    let store = common::in_memory();
    let client = Client::new(store.clone());
    let acts = ActivityRegistry::builder()
        .register("step", |_ctx, input: String| async move { Ok(input) })
        .register("park", |_ctx, _input: String| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(String::new())
        })
        .build();

    let before = WorkflowRegistry::builder()
        .register("Steps", |ctx: WorkflowContext, _input: String| async move {
            ctx.schedule_activity("step", "one").await.map_err(|e| e.to_string())?;
            ctx.schedule_activity("park", "").await.map_err(|e| e.to_string())?;
            Ok("done".to_string())
        })
        .build();
    let after = WorkflowRegistry::builder()
        .register("Steps", |ctx: WorkflowContext, _input: String| async move {
            ctx.schedule_activity("step", "ONE").await.map_err(|e| e.to_string())?;
            ctx.schedule_activity("park", "").await.map_err(|e| e.to_string())?;
            Ok("done".to_string())
        })
        .build();

    let rt = Runtime::start_with_options(store.clone(), Arc::new(acts.clone()), before, common::fast_options()).await;
    let instance = client.submit("ns", "steps", None, "Steps", "").await.unwrap();
    assert!(common::wait_for_history(&store, &instance, |h| common::has_scheduled(h, "park"), 5_000).await);
    rt.shutdown().await;

    let rt = Runtime::start_with_options(store.clone(), Arc::new(acts), after, common::fast_options()).await;
    let status = client
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(
        matches!(
            status,
            InstanceStatus::Failed {
                details: ErrorDetails::Nondeterminism { .. }
            }
        ),
        "got {status:?}"
    );
    rt.shutdown().await;
}
