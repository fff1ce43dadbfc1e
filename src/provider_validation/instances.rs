//! Instance store: run creation, idempotent starts, the status index and
//! retention.

use std::time::Duration;

use super::{ProviderFactory, instance, start_request};
use crate::providers::{StartError, StartOutcome, WORKFLOW_QUEUE};
use crate::{EventKind, InstanceId, StatusKind, now_millis};

pub async fn run_tests<F: ProviderFactory>(factory: &F) {
    test_start_writes_history_and_task(factory).await;
    test_start_is_idempotent(factory).await;
    test_idempotency_window_expires(factory).await;
    test_terminal_append_updates_index(factory).await;
    test_update_status_repairs_index(factory).await;
    test_latest_run(factory).await;
    test_purge_closed_runs(factory).await;
}

async fn complete(provider: &dyn crate::providers::Provider, i: &InstanceId, output: &str) {
    let last = provider.last_seq(i).await.unwrap();
    provider
        .append_events(
            i,
            last,
            vec![
                EventKind::ActivationCompleted,
                EventKind::WorkflowCompleted {
                    output: output.to_string(),
                },
            ],
        )
        .await
        .unwrap();
}

/// Goal: `WorkflowStarted`, the index row and the first workflow task are
/// created together.
pub async fn test_start_writes_history_and_task<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing instances: start");
    let provider = factory.create_provider().await;
    let i = instance("start");

    let outcome = provider.start_instance(start_request(&i)).await.unwrap();
    assert_eq!(outcome, StartOutcome::Created(i.clone()));

    let history = provider.read(&i).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].seq, 1);
    assert!(matches!(history[0].kind, EventKind::WorkflowStarted { .. }));
    assert_eq!(provider.queue_depth(WORKFLOW_QUEUE).await.unwrap(), 1);

    let record = provider.get_instance(&i).await.unwrap().unwrap();
    assert_eq!(record.status, StatusKind::Running);
    assert_eq!(record.workflow_name, "ValidationWorkflow");
    assert_eq!(record.last_seq, 1);
    tracing::info!("✓ Test passed: start verified");
}

pub async fn test_start_is_idempotent<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing instances: idempotent start");
    let provider = factory.create_provider().await;
    let i = instance("idem");

    // Same run id twice.
    provider.start_instance(start_request(&i)).await.unwrap();
    let again = provider.start_instance(start_request(&i)).await.unwrap();
    assert_eq!(again, StartOutcome::Existing(i.clone()));

    // Same key under a different run id.
    let keyed = InstanceId::new("validation", "idem-key", "run-a");
    let mut first = start_request(&keyed);
    first.idempotency_key = Some("k1".to_string());
    first.idempotency_window = Some(Duration::from_secs(60));
    provider.start_instance(first.clone()).await.unwrap();
    let mut second = first.clone();
    second.instance = keyed.with_run("run-b");
    assert_eq!(
        provider.start_instance(second).await.unwrap(),
        StartOutcome::Existing(keyed.clone())
    );

    // No key while a run is open.
    let mut third = start_request(&keyed.with_run("run-c"));
    third.idempotency_key = None;
    match provider.start_instance(third).await {
        Err(StartError::AlreadyRunning(open)) => assert_eq!(open, keyed),
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }
    assert_eq!(provider.read(&keyed.with_run("run-b")).await.unwrap().len(), 0);
    tracing::info!("✓ Test passed: idempotent start verified");
}

pub async fn test_idempotency_window_expires<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing instances: idempotency window");
    let provider = factory.create_provider().await;
    let a = InstanceId::new("validation", "window", "run-a");
    let mut req = start_request(&a);
    req.idempotency_key = Some("k".to_string());
    req.idempotency_window = Some(Duration::from_millis(50));
    provider.start_instance(req.clone()).await.unwrap();
    complete(provider.as_ref(), &a, "done").await;

    tokio::time::sleep(Duration::from_millis(120)).await;
    let mut later = req.clone();
    later.instance = a.with_run("run-b");
    assert_eq!(
        provider.start_instance(later).await.unwrap(),
        StartOutcome::Created(a.with_run("run-b"))
    );
    tracing::info!("✓ Test passed: window expiry verified");
}

pub async fn test_terminal_append_updates_index<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing instances: status index");
    let provider = factory.create_provider().await;
    let done = instance("done");
    let open = instance("open");
    provider.start_instance(start_request(&done)).await.unwrap();
    provider.start_instance(start_request(&open)).await.unwrap();
    complete(provider.as_ref(), &done, "42").await;

    let record = provider.get_instance(&done).await.unwrap().unwrap();
    assert_eq!(record.status, StatusKind::Completed);
    assert_eq!(record.output.as_deref(), Some("42"));
    assert!(record.closed_at_ms.is_some());
    assert_eq!(record.last_seq, 3);

    let completed = provider.list_instances(Some(StatusKind::Completed)).await.unwrap();
    assert_eq!(completed.iter().map(|r| &r.instance).collect::<Vec<_>>(), vec![&done]);
    let running = provider.list_instances(Some(StatusKind::Running)).await.unwrap();
    assert_eq!(running.iter().map(|r| &r.instance).collect::<Vec<_>>(), vec![&open]);
    assert_eq!(provider.list_instances(None).await.unwrap().len(), 2);
    tracing::info!("✓ Test passed: status index verified");
}

pub async fn test_update_status_repairs_index<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing instances: index repair");
    let provider = factory.create_provider().await;
    let i = instance("repair");
    provider.start_instance(start_request(&i)).await.unwrap();

    provider
        .update_status(&i, StatusKind::Failed, Some("boom".to_string()))
        .await
        .unwrap();
    let record = provider.get_instance(&i).await.unwrap().unwrap();
    assert_eq!(record.status, StatusKind::Failed);
    assert!(record.closed_at_ms.is_some());

    let ghost = instance("ghost");
    assert!(provider.update_status(&ghost, StatusKind::Failed, None).await.is_err());
    tracing::info!("✓ Test passed: index repair verified");
}

pub async fn test_latest_run<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing instances: latest run");
    let provider = factory.create_provider().await;
    let first = InstanceId::new("validation", "chain", "run-1");
    provider.start_instance(start_request(&first)).await.unwrap();
    complete(provider.as_ref(), &first, "1").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = first.with_run("run-2");
    provider.start_instance(start_request(&second)).await.unwrap();

    let latest = provider.latest_run("validation", "chain").await.unwrap().unwrap();
    assert_eq!(latest.instance, second);
    assert!(provider.latest_run("validation", "nothing").await.unwrap().is_none());
    tracing::info!("✓ Test passed: latest run verified");
}

pub async fn test_purge_closed_runs<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing instances: purge");
    let provider = factory.create_provider().await;
    let closed = instance("old");
    let open = instance("young");
    provider.start_instance(start_request(&closed)).await.unwrap();
    provider.start_instance(start_request(&open)).await.unwrap();
    complete(provider.as_ref(), &closed, "x").await;

    let purged = provider.purge_closed_before(now_millis() + 1_000).await.unwrap();
    assert_eq!(purged, 1);
    assert!(provider.get_instance(&closed).await.unwrap().is_none());
    assert!(provider.read(&closed).await.unwrap().is_empty());
    assert!(provider.get_instance(&open).await.unwrap().is_some());
    assert_eq!(provider.read(&open).await.unwrap().len(), 1);
    tracing::info!("✓ Test passed: purge verified");
}
