//! Task queue: visibility timeouts, delayed visibility, delivery counting,
//! coalescing and dead letters.

use std::time::Duration;

use super::{ProviderFactory, instance};
use crate::providers::{ACTIVITY_QUEUE, ActivityInvocation, NackOptions, NewTask, TaskKind, WORKFLOW_QUEUE};
use crate::{RetryPolicy, now_millis};

pub async fn run_tests<F: ProviderFactory>(factory: &F) {
    test_leased_task_is_invisible_until_expiry(factory).await;
    test_ack_removes_task(factory).await;
    test_delayed_visibility(factory).await;
    test_nack_delivery_counting(factory).await;
    test_extend_lease_keeps_task_hidden(factory).await;
    test_workflow_tasks_coalesce(factory).await;
    test_reschedule_replaces_task(factory).await;
    test_dead_letter_and_requeue(factory).await;
    test_unknown_token_is_rejected(factory).await;
    test_concurrent_dequeues_claim_distinct_tasks(factory).await;
}

fn activity(attempt: u32) -> TaskKind {
    TaskKind::Activity(ActivityInvocation {
        instance: instance("queue"),
        scheduled_seq: 3,
        name: "Validate".to_string(),
        input: "x".to_string(),
        retry: RetryPolicy::new(3),
        attempt,
    })
}

/// Goal: a dequeued task is hidden until its visibility timeout passes, then
/// redelivered under a new token with a higher delivery count.
pub async fn test_leased_task_is_invisible_until_expiry<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing queue: visibility timeout");
    let provider = factory.create_provider().await;
    let timeout = factory.lock_timeout();
    provider.enqueue(NewTask::now(activity(1))).await.unwrap();

    let first = provider.dequeue(ACTIVITY_QUEUE, timeout).await.unwrap().unwrap();
    assert_eq!(first.delivery_count, 1);
    assert!(provider.dequeue(ACTIVITY_QUEUE, timeout).await.unwrap().is_none());

    tokio::time::sleep(timeout + Duration::from_millis(100)).await;
    let second = provider.dequeue(ACTIVITY_QUEUE, timeout).await.unwrap().unwrap();
    assert_eq!(second.delivery_count, 2);
    assert_ne!(second.token, first.token);
    assert_eq!(second.kind, first.kind);

    // The expired holder can no longer settle the task.
    assert!(provider.ack(&first.token).await.is_err());
    provider.ack(&second.token).await.unwrap();
    tracing::info!("✓ Test passed: visibility timeout verified");
}

pub async fn test_ack_removes_task<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing queue: ack");
    let provider = factory.create_provider().await;
    provider.enqueue(NewTask::now(activity(1))).await.unwrap();
    assert_eq!(provider.queue_depth(ACTIVITY_QUEUE).await.unwrap(), 1);

    let task = provider
        .dequeue(ACTIVITY_QUEUE, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    provider.ack(&task.token).await.unwrap();
    assert_eq!(provider.queue_depth(ACTIVITY_QUEUE).await.unwrap(), 0);
    assert!(provider.dequeue(ACTIVITY_QUEUE, Duration::from_secs(30)).await.unwrap().is_none());
    tracing::info!("✓ Test passed: ack verified");
}

pub async fn test_delayed_visibility<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing queue: delayed visibility");
    let provider = factory.create_provider().await;
    provider
        .enqueue(NewTask::at(activity(1), now_millis() + 300))
        .await
        .unwrap();
    assert!(provider.dequeue(ACTIVITY_QUEUE, Duration::from_secs(30)).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(provider.dequeue(ACTIVITY_QUEUE, Duration::from_secs(30)).await.unwrap().is_some());
    tracing::info!("✓ Test passed: delayed visibility verified");
}

/// Goal: `ignore_attempt` gives a delivery back without counting it.
pub async fn test_nack_delivery_counting<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing queue: nack and delivery counting");
    let provider = factory.create_provider().await;
    let visibility = Duration::from_secs(30);
    provider.enqueue(NewTask::now(activity(1))).await.unwrap();

    let t = provider.dequeue(ACTIVITY_QUEUE, visibility).await.unwrap().unwrap();
    provider
        .nack(
            &t.token,
            NackOptions {
                delay: None,
                ignore_attempt: true,
            },
        )
        .await
        .unwrap();
    let t = provider.dequeue(ACTIVITY_QUEUE, visibility).await.unwrap().unwrap();
    assert_eq!(t.delivery_count, 1);

    provider.nack(&t.token, NackOptions::default()).await.unwrap();
    let t = provider.dequeue(ACTIVITY_QUEUE, visibility).await.unwrap().unwrap();
    assert_eq!(t.delivery_count, 2);

    provider
        .nack(
            &t.token,
            NackOptions {
                delay: Some(Duration::from_secs(30)),
                ignore_attempt: false,
            },
        )
        .await
        .unwrap();
    assert!(provider.dequeue(ACTIVITY_QUEUE, visibility).await.unwrap().is_none());
    tracing::info!("✓ Test passed: delivery counting verified");
}

pub async fn test_extend_lease_keeps_task_hidden<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing queue: lock extension");
    let provider = factory.create_provider().await;
    let timeout = factory.lock_timeout();
    provider.enqueue(NewTask::now(activity(1))).await.unwrap();

    let t = provider.dequeue(ACTIVITY_QUEUE, timeout).await.unwrap().unwrap();
    provider.extend_lease(&t.token, Duration::from_secs(30)).await.unwrap();
    tokio::time::sleep(timeout + Duration::from_millis(100)).await;
    assert!(provider.dequeue(ACTIVITY_QUEUE, timeout).await.unwrap().is_none());
    provider.ack(&t.token).await.unwrap();
    tracing::info!("✓ Test passed: lock extension verified");
}

/// Goal: at most one waiting workflow task per instance.
pub async fn test_workflow_tasks_coalesce<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing queue: workflow task coalescing");
    let provider = factory.create_provider().await;
    let a = instance("coalesce-a");
    let b = instance("coalesce-b");
    for _ in 0..3 {
        provider
            .enqueue(NewTask::now(TaskKind::Workflow { instance: a.clone() }))
            .await
            .unwrap();
    }
    provider
        .enqueue(NewTask::now(TaskKind::Workflow { instance: b.clone() }))
        .await
        .unwrap();
    assert_eq!(provider.queue_depth(WORKFLOW_QUEUE).await.unwrap(), 2);

    // A task already handed out does not absorb new work.
    let leased = provider
        .dequeue(WORKFLOW_QUEUE, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    provider.enqueue(NewTask::now(leased.kind.clone())).await.unwrap();
    assert_eq!(provider.queue_depth(WORKFLOW_QUEUE).await.unwrap(), 3);
    tracing::info!("✓ Test passed: coalescing verified");
}

/// Goal: `reschedule` swaps a leased task for its successor atomically.
pub async fn test_reschedule_replaces_task<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing queue: reschedule");
    let provider = factory.create_provider().await;
    provider.enqueue(NewTask::now(activity(1))).await.unwrap();

    let t = provider
        .dequeue(ACTIVITY_QUEUE, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    provider.reschedule(&t.token, NewTask::now(activity(2))).await.unwrap();
    assert_eq!(provider.queue_depth(ACTIVITY_QUEUE).await.unwrap(), 1);

    let next = provider
        .dequeue(ACTIVITY_QUEUE, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.kind, activity(2));
    assert_eq!(next.delivery_count, 1);
    tracing::info!("✓ Test passed: reschedule verified");
}

pub async fn test_dead_letter_and_requeue<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing queue: dead letters");
    let provider = factory.create_provider().await;
    provider.enqueue(NewTask::now(activity(1))).await.unwrap();

    let t = provider
        .dequeue(ACTIVITY_QUEUE, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    provider.dead_letter(&t.token, "too many deliveries").await.unwrap();
    assert_eq!(provider.queue_depth(ACTIVITY_QUEUE).await.unwrap(), 0);

    let parked = provider.list_dead_letters().await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].queue, ACTIVITY_QUEUE);
    assert_eq!(parked[0].reason, "too many deliveries");
    assert_eq!(parked[0].delivery_count, 1);
    assert_eq!(parked[0].kind, activity(1));

    assert!(provider.requeue_dead_letter(parked[0].id).await.unwrap());
    assert!(!provider.requeue_dead_letter(parked[0].id).await.unwrap());
    assert!(provider.list_dead_letters().await.unwrap().is_empty());

    let again = provider
        .dequeue(ACTIVITY_QUEUE, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.delivery_count, 1);
    tracing::info!("✓ Test passed: dead letters verified");
}

pub async fn test_unknown_token_is_rejected<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing queue: unknown lock token");
    let provider = factory.create_provider().await;
    let err = provider.ack("no-such-token").await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(provider.nack("no-such-token", NackOptions::default()).await.is_err());
    assert!(provider.extend_lease("no-such-token", Duration::from_secs(1)).await.is_err());
    tracing::info!("✓ Test passed: unknown token rejected");
}

/// Goal: parallel consumers each claim a different task, and none of them
/// fails while another holds the write lock.
pub async fn test_concurrent_dequeues_claim_distinct_tasks<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing queue: concurrent dequeue");
    let provider = factory.create_provider().await;
    for attempt in 1..=8 {
        provider.enqueue(NewTask::now(activity(attempt))).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let p = provider.clone();
        handles.push(tokio::spawn(async move {
            p.dequeue(ACTIVITY_QUEUE, Duration::from_secs(30)).await
        }));
    }
    let mut attempts = Vec::new();
    let mut tokens = std::collections::HashSet::new();
    for h in handles {
        let task = h
            .await
            .unwrap()
            .expect("dequeue must not fail under contention")
            .expect("a task for every consumer");
        assert_eq!(task.delivery_count, 1);
        assert!(tokens.insert(task.token.clone()));
        match task.kind {
            TaskKind::Activity(inv) => attempts.push(inv.attempt),
            other => panic!("unexpected task {other:?}"),
        }
    }
    attempts.sort_unstable();
    assert_eq!(attempts, (1..=8).collect::<Vec<_>>());
    assert!(provider.dequeue(ACTIVITY_QUEUE, Duration::from_secs(30)).await.unwrap().is_none());
    tracing::info!("✓ Test passed: each consumer claimed its own task");
}
