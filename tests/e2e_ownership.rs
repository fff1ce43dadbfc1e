use duraflow::providers::{ACTIVITY_QUEUE, Provider};
use duraflow::runtime::Runtime;
use duraflow::runtime::coordinator::{ActivationOutcome, CoordinatorOptions, WorkflowCoordinator};
use duraflow::{ActivityRegistry, Client, InstanceStatus, RetryPolicy, WorkflowContext, WorkflowRegistry};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

mod common;

fn charge_workflow() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register("payment", |ctx: WorkflowContext, amount: String| async move {
            let receipt = ctx
                .schedule_activity_with_retry("charge", amount, RetryPolicy::new(3))
                .await
                .map_err(|e| e.to_string())?;
            Ok(format!("charged:{receipt}"))
        })
        .build()
}

fn charge_activity() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("charge", |_ctx, amount: String| async move { Ok(format!("receipt-{amount}")) })
        .build()
}

/// Coordinator A stalls past its lease, B takes over and commits; A's late
/// append carries a stale expected sequence and is rejected without a trace.
#[tokio::test]
async fn stale_lease_holder_cannot_append() {
    let store = common::in_memory();
    let client = Client::new(store.clone());
    let instance = client.submit("billing", "order-1", None, "payment", "100").await.unwrap();

    let opts = CoordinatorOptions {
        lease_ttl: Duration::from_millis(100),
        retain_lease: false,
    };
    let a = WorkflowCoordinator::new(store.clone(), charge_workflow(), "coordinator-a", opts.clone());
    let b = WorkflowCoordinator::new(store.clone(), charge_workflow(), "coordinator-b", opts);

    let lease_a = a.acquire(&instance).await.unwrap().expect("A gets the lease");
    let prepared_a = a.prepare(&instance, lease_a).await.unwrap();
    assert_eq!(prepared_a.expected_last_seq(), 1);

    // While A's lease is live, B is locked out.
    assert_eq!(b.activate(&instance).await.unwrap(), ActivationOutcome::LeaseUnavailable);

    // A pauses (GC, partition) past its TTL; B takes over.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let lease_b = b.acquire(&instance).await.unwrap().expect("B gets the expired lease");
    assert!(lease_b.token > prepared_a.lease().token);
    let prepared_b = b.prepare(&instance, lease_b).await.unwrap();
    assert!(matches!(
        b.commit(prepared_b).await.unwrap(),
        ActivationOutcome::Committed { new_last_seq: 4, .. }
    ));

    // A wakes up and tries to append what it computed earlier.
    match a.commit(prepared_a).await.unwrap() {
        ActivationOutcome::Conflict { expected, actual } => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 4);
        }
        other => panic!("stale append must conflict, got {other:?}"),
    }

    let history = store.read(&instance).await.unwrap();
    common::assert_well_formed(&history);
    assert_eq!(history.len(), 4);
    assert_eq!(common::count(&history, "ActivityScheduled"), 1);
    assert_eq!(store.queue_depth(ACTIVITY_QUEUE).await.unwrap(), 1);

    // The run finishes normally under a runtime.
    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(charge_activity()),
        charge_workflow(),
        common::fast_options(),
    )
    .await;
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
    rt.shutdown().await;
}

/// Two peer runtimes share one store; every run completes once.
#[tokio::test]
async fn peers_share_the_work_without_double_writes() {
    let store = common::in_memory();
    let client = Client::new(store.clone());
    let mut opts_a = common::fast_options();
    opts_a.node_id = Some("node-a".to_string());
    let mut opts_b = common::fast_options();
    opts_b.node_id = Some("node-b".to_string());

    let rt_a = Runtime::start_with_options(store.clone(), Arc::new(charge_activity()), charge_workflow(), opts_a).await;
    let rt_b = Runtime::start_with_options(store.clone(), Arc::new(charge_activity()), charge_workflow(), opts_b).await;

    let mut instances = Vec::new();
    for n in 0..12 {
        let id = client
            .submit("billing", &format!("order-{n}"), None, "payment", n.to_string())
            .await
            .unwrap();
        instances.push((n, id));
    }
    for (n, id) in &instances {
        let status = client
            .wait_for_completion(id, Duration::from_secs(15))
            .await
            .unwrap();
        assert_eq!(
            status,
            InstanceStatus::Completed {
                output: format!("charged:receipt-{n}")
            }
        );
        let history = store.read(id).await.unwrap();
        common::assert_well_formed(&history);
        assert_eq!(common::count(&history, "ActivityCompleted"), 1);
        assert_eq!(common::count(&history, "WorkflowCompleted"), 1);
    }

    let committed = rt_a.metrics().activations_committed + rt_b.metrics().activations_committed;
    assert_eq!(committed, 24, "two activations per run");
    rt_a.shutdown().await;
    rt_b.shutdown().await;
}

/// Marks one replay of the workflow body as running until dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn tally_workflow(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register("tally", move |ctx: WorkflowContext, count: String| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let _in_flight = InFlight(active);
                // Hold the activation open long enough for a second worker to collide.
                std::thread::sleep(Duration::from_millis(15));
                let n: usize = count.parse().unwrap_or(0);
                let mut seen = Vec::new();
                for _ in 0..n {
                    seen.push(ctx.wait_for_signal("add").await);
                }
                Ok(seen.join(","))
            }
        })
        .build()
}

/// A burst of signals queues several workflow tasks for one instance while
/// it is being activated; the node's workers must still take turns.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_activation_at_a_time_across_workers_of_a_node() {
    let store = common::in_memory();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let options = duraflow::RuntimeOptions {
        workflow_concurrency: 4,
        ..common::fast_options()
    };
    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(ActivityRegistry::builder().build()),
        tally_workflow(active.clone(), peak.clone()),
        options,
    )
    .await;
    let client = Client::new(store.clone());
    let instance = client.submit("ops", "tally-1", None, "tally", "6").await.unwrap();
    for i in 0..6 {
        client.signal(&instance, "add", i.to_string()).await.unwrap();
    }

    let status = client
        .wait_for_completion(&instance, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Completed { output: "0,1,2,3,4,5".into() });
    assert_eq!(peak.load(Ordering::SeqCst), 1, "activations of one instance overlapped");
    assert_eq!(active.load(Ordering::SeqCst), 0);
    rt.shutdown().await;
}
