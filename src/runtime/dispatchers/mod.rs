//! Dispatcher implementations for Runtime
//!
//! - `workflow`: leases workflow tasks and runs coordinator activations
//! - `worker`: executes activities with retry and exactly-once recording
//! - `timer`: records `TimerFired` once a timer task becomes visible
//!
//! Shared here: poison detection and the renewal tasks that keep a task's
//! visibility (and an instance lease) alive while work is in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use super::{Runtime, RuntimeMetrics};
use crate::providers::{Lease, LeasedTask, Provider};

mod timer;
mod worker;
mod workflow;

/// Calculate how often to renew a lock of the given length.
///
/// - `timeout >= 15s`: renew 5s before it runs out
/// - shorter timeouts: renew at half the timeout
pub(crate) fn calculate_renewal_interval(timeout: Duration) -> Duration {
    if timeout >= Duration::from_secs(15) {
        timeout.saturating_sub(Duration::from_secs(5)).max(Duration::from_secs(1))
    } else {
        (timeout / 2).max(Duration::from_millis(10))
    }
}

/// Keep a dequeued task invisible to other consumers until aborted.
/// Stops by itself once the token is no longer valid.
pub(crate) fn spawn_task_renewal(
    provider: Arc<dyn Provider>,
    token: String,
    visibility: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let every = calculate_renewal_interval(visibility);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = provider.extend_lease(&token, visibility).await {
                tracing::debug!(
                    target: "duraflow::runtime::dispatch",
                    lock_token = %token,
                    error = %e,
                    "task renewal stopped"
                );
                break;
            }
            tracing::trace!(target: "duraflow::runtime::dispatch", lock_token = %token, "task lock renewed");
        }
    })
}

/// Keep an instance lease alive until aborted or lost.
pub(crate) fn spawn_lease_renewal(
    provider: Arc<dyn Provider>,
    lease: Lease,
    ttl: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let every = calculate_renewal_interval(ttl);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        let mut held = lease;
        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match provider.renew_lease(&held, ttl).await {
                Ok(Some(renewed)) => held = renewed,
                Ok(None) => {
                    warn!(
                        target: "duraflow::runtime::dispatch",
                        lease = %held.key,
                        "instance lease lost while activation in flight"
                    );
                    break;
                }
                Err(e) => {
                    tracing::debug!(
                        target: "duraflow::runtime::dispatch",
                        lease = %held.key,
                        error = %e,
                        "lease renewal failed"
                    );
                }
            }
        }
    })
}

impl Runtime {
    async fn idle(&self) {
        tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
    }

    /// Move a task that keeps coming back to the dead-letter store.
    /// Returns `true` if the task was taken out of circulation.
    async fn dead_letter_if_poisoned(&self, task: &LeasedTask, worker_id: &str) -> bool {
        if task.delivery_count <= self.options.max_task_attempts {
            return false;
        }
        let reason = format!(
            "{} task delivered {} times (limit {})",
            task.kind.name(),
            task.delivery_count,
            self.options.max_task_attempts
        );
        warn!(
            target: "duraflow::runtime::dispatch",
            worker_id = %worker_id,
            task = task.kind.name(),
            delivery_count = task.delivery_count,
            "poison task moved to dead letters"
        );
        match self.provider.dead_letter(&task.token, &reason).await {
            Ok(()) => RuntimeMetrics::bump(&self.metrics.dead_lettered),
            Err(e) => warn!(
                target: "duraflow::runtime::dispatch",
                worker_id = %worker_id,
                error = %e,
                "failed to dead-letter task"
            ),
        }
        true
    }

    /// Spawn `count` copies of a worker loop and wait for all of them.
    fn spawn_pool<F, Fut>(self: Arc<Self>, kind: &'static str, count: usize, worker: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut handles = Vec::with_capacity(count);
            for idx in 0..count.max(1) {
                // Unique worker id: {kind}-{index}-{runtime_id}
                let worker_id = format!("{kind}-{idx}-{}", self.runtime_id);
                handles.push((worker_id.clone(), tokio::spawn(worker(self.clone(), worker_id))));
            }
            join_workers(handles).await;
        })
    }
}

/// Wait for every worker of a pool. Returns how many of them panicked.
async fn join_workers(handles: Vec<(String, JoinHandle<()>)>) -> usize {
    let mut panicked = 0;
    for (worker_id, h) in handles {
        match h.await {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                panicked += 1;
                warn!(
                    target: "duraflow::runtime::dispatch",
                    worker_id = %worker_id,
                    error = %e,
                    "dispatcher worker panicked"
                );
            }
            Err(e) => tracing::debug!(
                target: "duraflow::runtime::dispatch",
                worker_id = %worker_id,
                error = %e,
                "dispatcher worker aborted"
            ),
        }
    }
    panicked
}
