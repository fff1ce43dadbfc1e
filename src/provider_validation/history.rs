//! History store: gapless sequencing and compare-and-append.

use super::{ProviderFactory, create_instance, instance};
use crate::providers::{ACTIVITY_QUEUE, ActivityInvocation, AppendError, NewTask, TaskKind};
use crate::{EventKind, RetryPolicy};

pub async fn run_tests<F: ProviderFactory>(factory: &F) {
    test_append_assigns_gapless_sequence(factory).await;
    test_stale_append_conflicts(factory).await;
    test_concurrent_appends_exactly_one_wins(factory).await;
    test_conflict_enqueues_nothing(factory).await;
    test_append_and_tasks_are_atomic(factory).await;
    test_append_to_unknown_instance(factory).await;
    test_read_events_from_seq(factory).await;
}

fn signal(n: u32) -> EventKind {
    EventKind::SignalReceived {
        name: format!("s{n}"),
        payload: n.to_string(),
    }
}

fn activity_task(instance: &crate::InstanceId, scheduled_seq: u64) -> NewTask {
    NewTask::now(TaskKind::Activity(ActivityInvocation {
        instance: instance.clone(),
        scheduled_seq,
        name: "Validate".to_string(),
        input: String::new(),
        retry: RetryPolicy::new(3),
        attempt: 1,
    }))
}

/// Appends get consecutive sequence numbers and non-decreasing timestamps.
pub async fn test_append_assigns_gapless_sequence<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing history: gapless sequence numbers");
    let provider = factory.create_provider().await;
    let i = instance("gapless");
    create_instance(provider.as_ref(), &i).await;

    let last = provider.append_events(&i, 1, vec![signal(1), signal(2)]).await.unwrap();
    assert_eq!(last, 3);
    let last = provider.append_events(&i, 3, vec![signal(3)]).await.unwrap();
    assert_eq!(last, 4);

    let history = provider.read(&i).await.unwrap();
    let seqs: Vec<u64> = history.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    assert!(history.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
    assert_eq!(provider.last_seq(&i).await.unwrap(), 4);
    tracing::info!("✓ Test passed: gapless sequence verified");
}

/// An append against a stale `expected_last_seq` writes nothing.
pub async fn test_stale_append_conflicts<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing history: stale append conflicts");
    let provider = factory.create_provider().await;
    let i = instance("stale");
    create_instance(provider.as_ref(), &i).await;
    provider.append_events(&i, 1, vec![signal(1)]).await.unwrap();

    match provider.append_events(&i, 1, vec![signal(2)]).await {
        Err(AppendError::Conflict { expected, actual }) => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(provider.read(&i).await.unwrap().len(), 2);
    tracing::info!("✓ Test passed: stale append rejected");
}

/// Racing writers with the same expectation: exactly one succeeds.
pub async fn test_concurrent_appends_exactly_one_wins<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing history: concurrent compare-and-append");
    let provider = factory.create_provider().await;
    let i = instance("race");
    create_instance(provider.as_ref(), &i).await;

    let mut handles = Vec::new();
    for n in 0..8 {
        let p = provider.clone();
        let i = i.clone();
        handles.push(tokio::spawn(async move { p.append_events(&i, 1, vec![signal(n)]).await }));
    }
    let mut won = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(2) => won += 1,
            Err(AppendError::Conflict { .. }) => conflicts += 1,
            other => panic!("unexpected append result {other:?}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(provider.read(&i).await.unwrap().len(), 2);
    tracing::info!("✓ Test passed: exactly one writer won");
}

/// A rejected append does not enqueue its tasks.
pub async fn test_conflict_enqueues_nothing<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing history: conflict enqueues nothing");
    let provider = factory.create_provider().await;
    let i = instance("conflict-tasks");
    create_instance(provider.as_ref(), &i).await;

    let r = provider
        .append_with_tasks(&i, 7, vec![signal(1)], vec![activity_task(&i, 2)])
        .await;
    assert!(matches!(r, Err(AppendError::Conflict { .. })));
    assert_eq!(provider.queue_depth(ACTIVITY_QUEUE).await.unwrap(), 0);
    tracing::info!("✓ Test passed: no tasks on conflict");
}

/// Events and tasks of a successful append become visible together.
pub async fn test_append_and_tasks_are_atomic<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing history: append with tasks");
    let provider = factory.create_provider().await;
    let i = instance("atomic");
    create_instance(provider.as_ref(), &i).await;

    let scheduled = EventKind::ActivityScheduled {
        name: "Validate".to_string(),
        input: String::new(),
        retry: RetryPolicy::new(3),
    };
    let last = provider
        .append_with_tasks(&i, 1, vec![EventKind::ActivationCompleted, scheduled], vec![activity_task(&i, 3)])
        .await
        .unwrap();
    assert_eq!(last, 3);
    assert_eq!(provider.queue_depth(ACTIVITY_QUEUE).await.unwrap(), 1);
    tracing::info!("✓ Test passed: events and tasks committed together");
}

pub async fn test_append_to_unknown_instance<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing history: unknown instance");
    let provider = factory.create_provider().await;
    let ghost = instance("ghost");
    let r = provider.append_events(&ghost, 0, vec![signal(1)]).await;
    assert!(matches!(r, Err(AppendError::NotFound(_))), "got {r:?}");
    assert!(provider.read(&ghost).await.unwrap().is_empty());
    tracing::info!("✓ Test passed: unknown instance rejected");
}

pub async fn test_read_events_from_seq<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing history: partial reads");
    let provider = factory.create_provider().await;
    let i = instance("partial");
    create_instance(provider.as_ref(), &i).await;
    provider
        .append_events(&i, 1, vec![signal(1), signal(2), signal(3)])
        .await
        .unwrap();

    let tail = provider.read_events(&i, 3).await.unwrap();
    assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4]);
    assert_eq!(tail[0].kind, signal(2));
    tracing::info!("✓ Test passed: partial read verified");
}
