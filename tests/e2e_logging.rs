use duraflow::runtime::Runtime;
use duraflow::{ActivityRegistry, Client, InstanceStatus, WorkflowContext, WorkflowRegistry, durable_info};
use std::sync::Arc;
use std::time::Duration;

mod common;

use common::tracing_capture;

fn workflows() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register("label", |ctx: WorkflowContext, order: String| async move {
            durable_info!(ctx, step = "before", "printing label");
            tracing::info!(target: "label::raw", step = "before", "plain log");
            let label = ctx.schedule_activity("print", order).await.map_err(|e| e.to_string())?;
            durable_info!(ctx, step = "after", "label printed");
            Ok(label)
        })
        .build()
}

/// The workflow body runs on both activations; the durable line written
/// before the activity is suppressed when the second activation replays it.
#[tokio::test]
async fn durable_logs_are_not_repeated_on_replay() {
    let (logs, _guard) = tracing_capture::capture();
    let store = common::in_memory();
    let activities = ActivityRegistry::builder()
        .register("print", |_ctx, order: String| async move { Ok(format!("label-{order}")) })
        .build();
    let rt = Runtime::start_with_options(store.clone(), Arc::new(activities), workflows(), common::fast_options()).await;
    let client = Client::new(store.clone());
    let instance = client.submit("ops", "order-7", None, "label", "7").await.unwrap();

    let status = client
        .wait_for_completion(&instance, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Completed { output: "label-7".into() });
    rt.shutdown().await;

    assert_eq!(logs.count("duraflow::workflow", "step", "before"), 1);
    assert_eq!(logs.count("duraflow::workflow", "step", "after"), 1);
    assert_eq!(logs.count("label::raw", "step", "before"), 2);
}
