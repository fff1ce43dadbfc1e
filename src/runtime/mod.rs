//! In-process runtime: dispatchers that drive workflows, execute activities
//! and fire timers against a shared [`Provider`].
//!
//! Every runtime is a peer. Any number of them may share one provider; the
//! ownership layer spreads instances over the live nodes and the history
//! store's compare-and-append keeps each instance single-writer regardless.
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::logging::{LogFormat, init_logging};
use crate::providers::{ActivityInvocation, Provider, ProviderError};
use crate::{InstanceId, WorkflowContext};

pub mod coordinator;
pub mod delivery;
mod dispatchers;
pub mod limits;
pub mod ownership;
pub mod registry;
pub mod replay_engine;

use coordinator::{CoordinatorError, CoordinatorOptions, WorkflowCoordinator};
use ownership::Membership;
use registry::{ActivityRegistry, WorkflowRegistry};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Stable identity of this node in the membership ring. Generated when `None`.
    pub node_id: Option<String>,
    /// Concurrent workflow activations.
    pub workflow_concurrency: usize,
    /// Concurrent activity executions.
    pub activity_concurrency: usize,
    pub timer_concurrency: usize,
    /// Polling interval when a queue is empty.
    /// Lower values = more responsive, higher CPU usage when idle.
    /// Default: 10ms
    pub dispatcher_idle_sleep: Duration,
    /// How long a dequeued workflow task stays invisible to other consumers.
    pub workflow_visibility_timeout: Duration,
    /// How long a dequeued activity task stays invisible. Renewed while the
    /// activity runs, so this bounds crash detection, not activity duration.
    pub activity_visibility_timeout: Duration,
    /// TTL of the per-instance coordinator lease.
    pub instance_lease_ttl: Duration,
    /// Keep the instance lease between activations instead of releasing it.
    pub retain_instance_lease: bool,
    pub node_heartbeat_interval: Duration,
    /// A node that misses heartbeats for this long leaves the ring.
    pub node_lease_ttl: Duration,
    /// Virtual points per node on the hash ring.
    pub hash_ring_vnodes: u32,
    /// Deliveries after which a task is moved to the dead-letter store.
    pub max_task_attempts: u32,
    /// Delay before retrying a task whose instance is leased elsewhere or
    /// owned by another node.
    pub lease_contention_backoff: Duration,
    /// Delay before retrying work whose handler is not registered here,
    /// giving a rolling deployment time to finish.
    pub unregistered_backoff: Duration,
    /// In-place retries of an operation that failed with a retryable
    /// provider error before the task is given back to the queue.
    pub transient_retry_attempts: u32,
    /// How often activity workers check whether their instance was cancelled.
    pub activity_cancel_poll_interval: Duration,
    /// Closed instances older than this are purged. `None` keeps them forever.
    pub retention: Option<Duration>,
    pub purge_interval: Duration,
    /// Upper bound on waiting for dispatchers to stop in [`Runtime::shutdown`].
    pub shutdown_timeout: Duration,
    /// Format of the subscriber installed at start when none is set yet.
    pub log_format: LogFormat,
    /// Filter for that subscriber. `RUST_LOG` takes precedence.
    pub log_filter: String,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            node_id: None,
            workflow_concurrency: 2,
            activity_concurrency: 4,
            timer_concurrency: 1,
            dispatcher_idle_sleep: Duration::from_millis(10),
            workflow_visibility_timeout: Duration::from_secs(30),
            activity_visibility_timeout: Duration::from_secs(30),
            instance_lease_ttl: Duration::from_secs(30),
            retain_instance_lease: false,
            node_heartbeat_interval: Duration::from_secs(1),
            node_lease_ttl: Duration::from_secs(5),
            hash_ring_vnodes: 64,
            max_task_attempts: 10,
            lease_contention_backoff: Duration::from_millis(50),
            unregistered_backoff: Duration::from_secs(1),
            transient_retry_attempts: 5,
            activity_cancel_poll_interval: Duration::from_millis(250),
            retention: None,
            purge_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            log_format: LogFormat::Compact,
            log_filter: "warn,duraflow=info".to_string(),
        }
    }
}

/// Trait implemented by workflow handlers that can be invoked by the runtime.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: WorkflowContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `WorkflowHandler`.
pub struct FnWorkflow<F, Fut>(pub F)
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F, Fut>
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: WorkflowContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// What an activity knows about the invocation it is serving.
///
/// The engine records at most one outcome per scheduled activity, but the
/// activity itself may physically run more than once (a worker can crash
/// after the side effect and before the result is recorded). Activities with
/// external side effects should pass [`idempotency_key`](Self::idempotency_key)
/// to the systems they call.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance: InstanceId,
    activity_name: String,
    scheduled_seq: u64,
    attempt: u32,
    worker_id: String,
    cancelled: Arc<AtomicBool>,
}

impl ActivityContext {
    pub(crate) fn new(invocation: &ActivityInvocation, worker_id: impl Into<String>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            instance: invocation.instance.clone(),
            activity_name: invocation.name.clone(),
            scheduled_seq: invocation.scheduled_seq,
            attempt: invocation.attempt,
            worker_id: worker_id.into(),
            cancelled,
        }
    }

    /// Context for calling an activity handler outside a runtime, e.g. in tests.
    pub fn detached(instance: InstanceId, activity_name: impl Into<String>) -> Self {
        Self {
            instance,
            activity_name: activity_name.into(),
            scheduled_seq: 0,
            attempt: 1,
            worker_id: "detached".to_string(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// Policy attempt, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Identical for every physical execution of the same scheduled activity.
    pub fn idempotency_key(&self) -> String {
        format!("{}#{}", self.instance, self.scheduled_seq)
    }

    /// Set once the instance was cancelled or closed. Checking is best-effort
    /// and cooperative; the activity decides how to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "duraflow::activity",
            instance = %self.instance,
            activity = %self.activity_name,
            attempt = self.attempt,
            worker_id = %self.worker_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "duraflow::activity",
            instance = %self.instance,
            activity = %self.activity_name,
            attempt = self.attempt,
            worker_id = %self.worker_id,
            "{}",
            message.into()
        );
    }
}

/// Counters maintained by the dispatchers.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    activations_committed: AtomicU64,
    activation_conflicts: AtomicU64,
    lease_contention: AtomicU64,
    workflows_closed: AtomicU64,
    activities_succeeded: AtomicU64,
    activities_failed: AtomicU64,
    activity_retries: AtomicU64,
    infrastructure_errors: AtomicU64,
    timers_fired: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Point-in-time copy of [`RuntimeMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub activations_committed: u64,
    pub activation_conflicts: u64,
    pub lease_contention: u64,
    pub workflows_closed: u64,
    pub activities_succeeded: u64,
    pub activities_failed: u64,
    pub activity_retries: u64,
    pub infrastructure_errors: u64,
    pub timers_fired: u64,
    pub dead_lettered: u64,
}

impl RuntimeMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            activations_committed: self.activations_committed.load(Ordering::Relaxed),
            activation_conflicts: self.activation_conflicts.load(Ordering::Relaxed),
            lease_contention: self.lease_contention.load(Ordering::Relaxed),
            workflows_closed: self.workflows_closed.load(Ordering::Relaxed),
            activities_succeeded: self.activities_succeeded.load(Ordering::Relaxed),
            activities_failed: self.activities_failed.load(Ordering::Relaxed),
            activity_retries: self.activity_retries.load(Ordering::Relaxed),
            infrastructure_errors: self.infrastructure_errors.load(Ordering::Relaxed),
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Errors the runtime may retry in place.
pub(crate) trait Transient: std::fmt::Display {
    fn is_transient(&self) -> bool;
}

impl Transient for ProviderError {
    fn is_transient(&self) -> bool {
        self.is_retryable()
    }
}

impl Transient for CoordinatorError {
    fn is_transient(&self) -> bool {
        self.is_retryable()
    }
}

/// In-process runtime that executes workflows, activities and timers and
/// persists history via a `Provider`.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    // Heartbeat and maintenance loops hold no in-flight work.
    background: Mutex<Vec<JoinHandle<()>>>,
    provider: Arc<dyn Provider>,
    activities: Arc<ActivityRegistry>,
    workflows: WorkflowRegistry,
    coordinator: Arc<WorkflowCoordinator>,
    membership: Arc<Membership>,
    options: RuntimeOptions,
    runtime_id: String,
    shutdown_flag: Arc<AtomicBool>,
    metrics: Arc<RuntimeMetrics>,
}

impl Runtime {
    /// Start a runtime with default options.
    pub async fn start(
        provider: Arc<dyn Provider>,
        activities: Arc<ActivityRegistry>,
        workflows: WorkflowRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(provider, activities, workflows, RuntimeOptions::default()).await
    }

    /// Start a new runtime with custom options.
    pub async fn start_with_options(
        provider: Arc<dyn Provider>,
        activities: Arc<ActivityRegistry>,
        workflows: WorkflowRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        init_logging(options.log_format, &options.log_filter);

        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let node_id = options
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{runtime_id}"));
        let coordinator = Arc::new(WorkflowCoordinator::new(
            provider.clone(),
            workflows.clone(),
            node_id.clone(),
            CoordinatorOptions {
                lease_ttl: options.instance_lease_ttl,
                retain_lease: options.retain_instance_lease,
            },
        ));
        let membership = Arc::new(Membership::new(
            provider.clone(),
            node_id.clone(),
            options.node_lease_ttl,
            options.hash_ring_vnodes,
        ));
        if let Err(e) = membership.heartbeat().await {
            warn!(target: "duraflow::runtime", node = %node_id, error = %e, "initial heartbeat failed");
        }

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            provider,
            activities,
            workflows,
            coordinator,
            membership,
            options,
            runtime_id,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(RuntimeMetrics::default()),
        });

        let dispatchers = vec![
            runtime.clone().start_workflow_dispatcher(),
            runtime.clone().start_activity_dispatcher(),
            runtime.clone().start_timer_dispatcher(),
        ];
        runtime.joins.lock().await.extend(dispatchers);
        let background = vec![runtime.clone().start_heartbeat(), runtime.clone().start_maintenance()];
        runtime.background.lock().await.extend(background);

        info!(
            target: "duraflow::runtime",
            node = %node_id,
            workflows = runtime.workflows.count(),
            activities = runtime.activities.count(),
            "runtime started"
        );
        runtime
    }

    pub fn node_id(&self) -> &str {
        self.membership.node_id()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        self.provider.clone()
    }

    /// Drive one activation of `instance` right now, outside the dispatchers.
    pub async fn activate(&self, instance: &InstanceId) -> Result<coordinator::ActivationOutcome, CoordinatorError> {
        self.coordinator.activate(instance).await
    }

    /// Stop the dispatchers, waiting up to `shutdown_timeout` for in-flight
    /// work, and leave the membership ring.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        for h in self.background.lock().await.drain(..) {
            h.abort();
        }
        let handles: Vec<JoinHandle<()>> = self.joins.lock().await.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drained = tokio::time::timeout(self.options.shutdown_timeout, futures::future::join_all(handles)).await;
        if drained.is_err() {
            warn!(target: "duraflow::runtime", "dispatchers did not stop in time; aborting");
            for a in aborts {
                a.abort();
            }
        }
        self.membership.leave().await;
        debug!(target: "duraflow::runtime", node = %self.node_id(), "runtime stopped");
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Execute an operation, retrying transient failures with exponential backoff.
    async fn execute_with_retry<T, E, F, Fut>(&self, operation_tag: &str, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient,
    {
        let mut attempts: u32 = 0;
        loop {
            match operation().await {
                Err(e) if e.is_transient() && attempts < self.options.transient_retry_attempts => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts.min(16));
                    warn!(
                        target: "duraflow::runtime",
                        attempts,
                        backoff_ms,
                        error = %e,
                        "{} failed; retrying",
                        operation_tag
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                other => return other,
            }
        }
    }

    fn start_heartbeat(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.options.node_heartbeat_interval);
            interval.tick().await;
            while !self.is_shutting_down() {
                interval.tick().await;
                if let Err(e) = self.membership.heartbeat().await {
                    warn!(
                        target: "duraflow::runtime::ownership",
                        node = %self.node_id(),
                        error = %e,
                        "heartbeat failed"
                    );
                }
            }
        })
    }

    fn start_maintenance(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(retention) = self.options.retention else {
                return;
            };
            while !self.is_shutting_down() {
                let cutoff = crate::now_millis().saturating_sub(retention.as_millis() as u64);
                match self.provider.purge_closed_before(cutoff).await {
                    Ok(0) => {}
                    Ok(purged) => info!(target: "duraflow::runtime", purged, "purged closed instances"),
                    Err(e) => warn!(target: "duraflow::runtime", error = %e, "purge failed"),
                }
                tokio::time::sleep(self.options.purge_interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transient_errors_are_retried_in_place() {
        let rt_opts = RuntimeOptions {
            transient_retry_attempts: 3,
            ..Default::default()
        };
        let counter = AtomicU64::new(0);
        let calls = &counter;
        let op = || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(ProviderError::retryable("op", "busy"))
            } else {
                Ok(n)
            }
        };
        let rt = test_runtime(rt_opts).await;
        assert_eq!(rt.execute_with_retry("op", op).await.unwrap(), 2);

        let permanent = || async { Err::<(), _>(ProviderError::permanent("op", "corrupt")) };
        assert!(rt.execute_with_retry("op", permanent).await.is_err());
        rt.shutdown().await;
    }

    #[test]
    fn activity_context_exposes_its_invocation() {
        let inv = ActivityInvocation {
            instance: InstanceId::new("ns", "wf", "r"),
            scheduled_seq: 7,
            name: "charge".into(),
            input: "100".into(),
            retry: crate::RetryPolicy::new(3),
            attempt: 2,
        };
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = ActivityContext::new(&inv, "w-1", flag.clone());
        assert_eq!(ctx.idempotency_key(), inv.idempotency_key());
        assert_eq!(ctx.attempt(), 2);
        assert!(!ctx.is_cancelled());
        flag.store(true, Ordering::Relaxed);
        assert!(ctx.is_cancelled());
    }

    async fn test_runtime(options: RuntimeOptions) -> Arc<Runtime> {
        let provider: Arc<dyn Provider> = Arc::new(crate::providers::in_memory::InMemoryProvider::new());
        Runtime::start_with_options(
            provider,
            Arc::new(ActivityRegistry::builder().build()),
            WorkflowRegistry::builder().build(),
            options,
        )
        .await
    }
}
