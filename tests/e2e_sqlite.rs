use duraflow::providers::Provider;
use duraflow::providers::sqlite::SqliteProvider;
use duraflow::runtime::Runtime;
use duraflow::{ActivityRegistry, Client, InstanceStatus, StatusKind, WorkflowContext, WorkflowRegistry};
use std::sync::Arc;
use std::time::Duration;

mod common;

fn activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("reserve", |_ctx, sku: String| async move { Ok(format!("reserved-{sku}")) })
        .register("park", |_ctx, _input: String| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(String::new())
        })
        .build()
}

fn workflows() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register("reserve_then_wait", |ctx: WorkflowContext, sku: String| async move {
            let reservation = ctx.schedule_activity("reserve", sku).await.map_err(|e| e.to_string())?;
            ctx.schedule_activity("park", "").await.map_err(|e| e.to_string())?;
            ctx.schedule_timer(Duration::from_millis(50)).await;
            Ok(reservation)
        })
        .build()
}

/// A run interrupted by a node going away resumes from the file on disk
/// under a freshly opened provider.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_survives_process_restart() {
    let (store, _dir, url) = common::create_sqlite_store_disk().await;
    let client = Client::new(store.clone());

    let rt = Runtime::start_with_options(store.clone(), Arc::new(activities()), workflows(), common::fast_options()).await;
    let instance = client
        .submit("inventory", "sku-9", Some("req-9"), "reserve_then_wait", "9")
        .await
        .unwrap();
    assert!(common::wait_for_history(&store, &instance, |h| common::has_scheduled(h, "park"), 5_000).await);
    rt.shutdown().await;
    let before = store.read(&instance).await.unwrap();
    drop(client);
    drop(store);

    let reopened: Arc<dyn Provider> = Arc::new(SqliteProvider::new(&url, None).await.unwrap());
    let after = reopened.read(&instance).await.unwrap();
    assert!(after.len() >= before.len());
    assert_eq!(&after[..before.len()], &before[..]);

    let client = Client::new(reopened.clone());
    // The idempotency index survived too.
    let again = client
        .submit("inventory", "sku-9", Some("req-9"), "reserve_then_wait", "9")
        .await
        .unwrap();
    assert_eq!(again, instance);

    let rt = Runtime::start_with_options(reopened.clone(), Arc::new(activities()), workflows(), common::fast_options())
        .await;
    let status = client
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Completed { output: "reserved-9".into() });

    let history = client.read_history(&instance).await.unwrap();
    common::assert_well_formed(&history);
    assert_eq!(common::count(&history, "ActivityCompleted"), 2);
    let record = client.describe(&instance).await.unwrap().unwrap();
    assert_eq!(record.status, StatusKind::Completed);
    assert_eq!(record.output.as_deref(), Some("reserved-9"));
    assert_eq!(record.last_seq, history.len() as u64);
    rt.shutdown().await;
}

#[tokio::test]
async fn in_memory_sqlite_runs_the_full_flow() {
    let store = common::sqlite_in_memory().await;
    let rt = Runtime::start_with_options(store.clone(), Arc::new(activities()), workflows(), common::fast_options()).await;
    let client = Client::new(store.clone());
    let instance = client.submit("inventory", "sku-1", None, "reserve_then_wait", "1").await.unwrap();
    let status = client
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Completed { output: "reserved-1".into() });
    assert_eq!(
        client.list_instances(Some(StatusKind::Completed)).await.unwrap().len(),
        1
    );
    rt.shutdown().await;
}
