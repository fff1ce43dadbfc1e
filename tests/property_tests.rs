//! Property-based tests using proptest to verify replay invariants

use duraflow::providers::in_memory::InMemoryProvider;
use duraflow::runtime::Runtime;
use duraflow::runtime::replay_engine::{ReplayEngine, ReplayOutcome, decisions_by_activation};
use duraflow::{ActivityRegistry, Client, EventKind, InstanceStatus, StatusKind, WorkflowContext, WorkflowRegistry};
use futures::future::join_all;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

mod common;

/// `steps` sequential activities, then `fan_out` parallel ones, then an
/// optional short timer.
fn shape_workflow() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register("shape", |ctx: WorkflowContext, input: String| async move {
            let parts: Vec<u32> = input.split(':').map(|p| p.parse().unwrap_or(0)).collect();
            let (steps, fan_out, timer) = (parts[0], parts[1], parts[2] == 1);
            let mut acc = Vec::new();
            for i in 0..steps {
                acc.push(ctx.schedule_activity("step", format!("s{i}")).await.map_err(|e| e.to_string())?);
            }
            let batch: Vec<_> = (0..fan_out)
                .map(|i| ctx.schedule_activity("step", format!("f{i}")))
                .collect();
            for r in join_all(batch).await {
                acc.push(r.map_err(|e| e.to_string())?);
            }
            if timer {
                ctx.schedule_timer(Duration::from_millis(10)).await;
            }
            Ok(acc.join(","))
        })
        .build()
}

fn step_activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("step", |_ctx, input: String| async move { Ok(format!("ok-{input}")) })
        .build()
}

fn arb_shape() -> impl Strategy<Value = (u32, u32, bool)> {
    (0u32..4, 0u32..4, any::<bool>())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    /// Property: replaying any committed prefix reproduces the decisions
    /// that were appended after it.
    #[test]
    fn prop_replay_reproduces_recorded_decisions((steps, fan_out, timer) in arb_shape()) {
        let (history, status) = tokio::runtime::Runtime::new().unwrap().block_on(async {
            let store: Arc<dyn duraflow::providers::Provider> = Arc::new(InMemoryProvider::new());
            let rt = Runtime::start_with_options(
                store.clone(),
                Arc::new(step_activities()),
                shape_workflow(),
                common::fast_options(),
            )
            .await;
            let client = Client::new(store.clone());
            let input = format!("{steps}:{fan_out}:{}", u8::from(timer));
            let instance = client.submit("prop", "shape", None, "shape", input).await.unwrap();
            let status = client
                .wait_for_completion(&instance, Duration::from_secs(10))
                .await
                .unwrap();
            let history = client.read_history(&instance).await.unwrap();
            rt.shutdown().await;
            (history, status)
        });

        prop_assert!(matches!(status, InstanceStatus::Completed { .. }), "status: {:?}", status);
        common::assert_well_formed(&history);
        prop_assert_eq!(common::count(&history, "ActivityScheduled"), (steps + fan_out) as usize);
        prop_assert_eq!(common::count(&history, "ActivityCompleted"), (steps + fan_out) as usize);

        let workflows = shape_workflow();
        let engine = ReplayEngine::new(&workflows);
        let instance = duraflow::InstanceId::new("prop", "shape", "replay");
        for (marker, recorded) in decisions_by_activation(&history) {
            let prefix = &history[..(marker - 1) as usize];
            match engine.activate(&instance, prefix).unwrap() {
                ReplayOutcome::Decisions(activation) => {
                    prop_assert_eq!(&activation.events[0], &EventKind::ActivationCompleted);
                    prop_assert_eq!(&activation.events[1..], &recorded[..]);
                }
                other => prop_assert!(false, "prefix before {} replayed to {:?}", marker, other),
            }
        }
        prop_assert_eq!(
            engine.activate(&instance, &history).unwrap(),
            ReplayOutcome::AlreadyTerminal(StatusKind::Completed)
        );
    }

    /// Property: the same committed history always replays to the same outcome.
    #[test]
    fn prop_replay_is_pure(steps in 1u32..4) {
        let history = tokio::runtime::Runtime::new().unwrap().block_on(async {
            let store: Arc<dyn duraflow::providers::Provider> = Arc::new(InMemoryProvider::new());
            let rt = Runtime::start_with_options(
                store.clone(),
                Arc::new(step_activities()),
                shape_workflow(),
                common::fast_options(),
            )
            .await;
            let client = Client::new(store.clone());
            let instance = client
                .submit("prop", "pure", None, "shape", format!("{steps}:0:0"))
                .await
                .unwrap();
            client
                .wait_for_completion(&instance, Duration::from_secs(10))
                .await
                .unwrap();
            let history = client.read_history(&instance).await.unwrap();
            rt.shutdown().await;
            history
        });

        // Drop the terminal block so the last activation is live again.
        let cut = history
            .iter()
            .rposition(|e| matches!(e.kind, EventKind::ActivationCompleted))
            .unwrap();
        let prefix = &history[..cut];
        let workflows = shape_workflow();
        let engine = ReplayEngine::new(&workflows);
        let instance = duraflow::InstanceId::new("prop", "pure", "replay");
        let first = engine.activate(&instance, prefix).unwrap();
        let second = engine.activate(&instance, prefix).unwrap();
        prop_assert_eq!(first, second);
    }
}
