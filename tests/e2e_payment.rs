use duraflow::runtime::Runtime;
use duraflow::{
    ActivityRegistry, BackoffStrategy, Client, ErrorDetails, EventKind, InstanceStatus, RetryPolicy, WorkflowContext,
    WorkflowRegistry,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

mod common;

fn quick_retry(max: u32) -> RetryPolicy {
    RetryPolicy::new(max).with_backoff(BackoffStrategy::Fixed {
        delay: Duration::from_millis(10),
    })
}

fn payment_workflows(max_attempts: u32) -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register("payment", move |ctx: WorkflowContext, amount: String| async move {
            let receipt = ctx
                .schedule_activity_with_retry("charge", amount, quick_retry(max_attempts))
                .await
                .map_err(|e| e.to_string())?;
            Ok(format!("charged:{receipt}"))
        })
        .build()
}

/// charge(100) fails twice and then succeeds under max_attempts = 3: the
/// workflow completes and history holds exactly one recorded outcome.
#[tokio::test]
async fn charge_succeeds_on_third_attempt_with_single_recorded_outcome() {
    let store = common::in_memory();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let activities = ActivityRegistry::builder()
        .register("charge", move |ctx, amount: String| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(ctx.attempt(), n);
                if n < 3 {
                    return Err(format!("gateway unavailable (attempt {n})"));
                }
                Ok(format!("receipt-{amount}"))
            }
        })
        .build();

    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(activities),
        payment_workflows(3),
        common::fast_options(),
    )
    .await;
    let client = Client::new(store.clone());
    let instance = client
        .submit("billing", "order-42", Some("req-1"), "payment", "100")
        .await
        .unwrap();

    let status = client
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        status,
        InstanceStatus::Completed {
            output: "charged:receipt-100".to_string()
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let history = client.read_history(&instance).await.unwrap();
    common::assert_well_formed(&history);
    assert_eq!(common::count(&history, "ActivityScheduled"), 1);
    assert_eq!(common::count(&history, "ActivityCompleted"), 1);
    assert_eq!(common::count(&history, "ActivityFailed"), 0);
    assert_eq!(common::count(&history, "WorkflowCompleted"), 1);

    let metrics = rt.metrics();
    assert_eq!(metrics.activity_retries, 2);
    assert_eq!(metrics.activities_succeeded, 1);
    rt.shutdown().await;
}

/// A retried start with the same idempotency key does not charge twice.
#[tokio::test]
async fn duplicate_submit_reuses_the_run() {
    let store = common::in_memory();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let activities = ActivityRegistry::builder()
        .register("charge", move |_ctx, amount: String| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("receipt-{amount}"))
            }
        })
        .build();
    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(activities),
        payment_workflows(3),
        common::fast_options(),
    )
    .await;
    let client = Client::new(store.clone());

    let first = client
        .submit("billing", "order-7", Some("req-7"), "payment", "5")
        .await
        .unwrap();
    client
        .wait_for_completion(&first, Duration::from_secs(10))
        .await
        .unwrap();
    let second = client
        .submit("billing", "order-7", Some("req-7"), "payment", "5")
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    rt.shutdown().await;
}

/// Exhausted retries surface to the workflow as one typed failure.
#[tokio::test]
async fn exhausted_retries_record_one_failure() {
    let store = common::in_memory();
    let activities = ActivityRegistry::builder()
        .register("charge", |_ctx, _amount: String| async move { Err("card declined".to_string()) })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("payment", |ctx: WorkflowContext, amount: String| async move {
            match ctx.schedule_activity_with_retry("charge", amount, quick_retry(2)).await {
                Ok(receipt) => Ok(receipt),
                Err(failure) => {
                    assert_eq!(failure.attempts, 2);
                    assert_eq!(failure.activity, "charge");
                    Err(format!("refused: {}", failure.message))
                }
            }
        })
        .build();
    let rt = Runtime::start_with_options(store.clone(), Arc::new(activities), workflows, common::fast_options()).await;
    let client = Client::new(store.clone());
    let instance = client.submit("billing", "order-9", None, "payment", "100").await.unwrap();

    let status = client
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    match status {
        InstanceStatus::Failed {
            details: ErrorDetails::Application { message },
        } => assert!(message.contains("card declined"), "{message}"),
        other => panic!("unexpected status {other:?}"),
    }

    let history = client.read_history(&instance).await.unwrap();
    assert_eq!(common::count(&history, "ActivityCompleted"), 0);
    let failures: Vec<_> = history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::ActivityFailed { attempts, .. } => Some(*attempts),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![2]);
    rt.shutdown().await;
}

/// An attempt that outlives the policy timeout counts as a failed attempt.
#[tokio::test]
async fn attempt_timeout_is_recorded_as_timeout() {
    let store = common::in_memory();
    let activities = ActivityRegistry::builder()
        .register("slow", |_ctx, _input: String| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("timeouts", |ctx: WorkflowContext, _input: String| async move {
            let policy = RetryPolicy::none().with_timeout(Duration::from_millis(50));
            match ctx.schedule_activity_with_retry("slow", "", policy).await {
                Ok(v) => Ok(v),
                Err(failure) => Ok(format!("gave up: {}", failure.message)),
            }
        })
        .build();
    let rt = Runtime::start_with_options(store.clone(), Arc::new(activities), workflows, common::fast_options()).await;
    let client = Client::new(store.clone());
    let instance = client.submit("ops", "slow-1", None, "timeouts", "").await.unwrap();

    let status = client
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(matches!(status, InstanceStatus::Completed { ref output } if output.starts_with("gave up")));
    let history = client.read_history(&instance).await.unwrap();
    assert!(history.iter().any(|e| matches!(
        &e.kind,
        EventKind::ActivityFailed {
            details: ErrorDetails::Timeout { .. },
            attempts: 1,
            ..
        }
    )));
    rt.shutdown().await;
}
