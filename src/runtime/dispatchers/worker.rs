//! Worker (activity) dispatcher implementation for Runtime
//!
//! This module contains the worker dispatcher logic that:
//! - Spawns concurrent activity workers
//! - Executes activity invocations under their retry policy
//! - Records exactly one terminal outcome per scheduled activity
//!
//! Retries never touch the workflow: a failed attempt is replaced in the queue
//! by the next attempt (with its backoff as delayed visibility). Only success
//! or the final failure is recorded in history.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::super::delivery::{DeliveryOutcome, already_recorded, record_input};
use super::super::{ActivityContext, Runtime, RuntimeMetrics};
use super::spawn_task_renewal;
use crate::providers::{ACTIVITY_QUEUE, ActivityInvocation, LeasedTask, NackOptions, NewTask, Provider, TaskKind};
use crate::{ErrorDetails, EventKind, InstanceId};

enum Attempt {
    Succeeded(String),
    Failed(String),
    TimedOut(Duration),
}

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers for executing activities
    pub(in crate::runtime) fn start_activity_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let count = self.options.activity_concurrency;
        self.spawn_pool("work", count, |rt, worker_id| async move {
            loop {
                if rt.shutdown_flag.load(Ordering::Relaxed) {
                    break;
                }
                match rt
                    .provider
                    .dequeue(ACTIVITY_QUEUE, rt.options.activity_visibility_timeout)
                    .await
                {
                    Ok(Some(task)) => rt.process_activity_task(task, &worker_id).await,
                    Ok(None) => rt.idle().await,
                    Err(e) => {
                        warn!(target: "duraflow::runtime::worker", worker_id = %worker_id, error = %e, "dequeue failed");
                        RuntimeMetrics::bump(&rt.metrics.infrastructure_errors);
                        rt.idle().await;
                    }
                }
            }
        })
    }

    async fn process_activity_task(self: &Arc<Self>, task: LeasedTask, worker_id: &str) {
        if self.dead_letter_if_poisoned(&task, worker_id).await {
            return;
        }
        let TaskKind::Activity(invocation) = &task.kind else {
            let reason = format!("{} task on the activity queue", task.kind.name());
            if let Err(e) = self.provider.dead_letter(&task.token, &reason).await {
                warn!(target: "duraflow::runtime::worker", error = %e, "failed to dead-letter task");
            }
            return;
        };

        // A redelivery after the outcome was recorded, or work for a closed run.
        match self.provider.read(&invocation.instance).await {
            Ok(history) => {
                let closed = history.is_empty() || history.iter().any(|e| e.kind.is_terminal());
                let completion = EventKind::ActivityCompleted {
                    scheduled_seq: invocation.scheduled_seq,
                    result: String::new(),
                };
                if closed || already_recorded(&history, &completion) {
                    debug!(
                        target: "duraflow::runtime::worker",
                        instance = %invocation.instance,
                        scheduled_seq = invocation.scheduled_seq,
                        closed,
                        "activity no longer needed"
                    );
                    self.ack_or_log(&task.token, worker_id).await;
                    return;
                }
            }
            Err(e) => {
                RuntimeMetrics::bump(&self.metrics.infrastructure_errors);
                self.nack_or_log(&task.token, false, self.options.lease_contention_backoff, worker_id, &e.to_string())
                    .await;
                return;
            }
        }

        let Some(handler) = self.activities.get(&invocation.name) else {
            warn!(
                target: "duraflow::runtime::worker",
                instance = %invocation.instance,
                activity = %invocation.name,
                worker_id = %worker_id,
                delivery_count = task.delivery_count,
                "activity not registered on this node"
            );
            self.nack_or_log(
                &task.token,
                false,
                self.options.unregistered_backoff,
                worker_id,
                "unregistered activity",
            )
            .await;
            return;
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let renewal = spawn_task_renewal(
            self.provider.clone(),
            task.token.clone(),
            self.options.activity_visibility_timeout,
            self.shutdown_flag.clone(),
        );
        let watcher = spawn_cancel_watcher(
            self.provider.clone(),
            invocation.instance.clone(),
            cancelled.clone(),
            self.options.activity_cancel_poll_interval,
        );

        debug!(
            target: "duraflow::runtime::worker",
            instance = %invocation.instance,
            activity = %invocation.name,
            scheduled_seq = invocation.scheduled_seq,
            attempt = invocation.attempt,
            worker_id = %worker_id,
            "Activity started"
        );
        let started = Instant::now();
        let ctx = ActivityContext::new(invocation, worker_id, cancelled);
        let call = handler.invoke(ctx, invocation.input.clone());
        let attempt = match invocation.retry.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(Ok(out)) => Attempt::Succeeded(out),
                Ok(Err(msg)) => Attempt::Failed(msg),
                Err(_) => Attempt::TimedOut(limit),
            },
            None => match call.await {
                Ok(out) => Attempt::Succeeded(out),
                Err(msg) => Attempt::Failed(msg),
            },
        };
        watcher.abort();
        renewal.abort();
        let duration_ms = started.elapsed().as_millis() as u64;

        match attempt {
            Attempt::Succeeded(result) => {
                debug!(
                    target: "duraflow::runtime::worker",
                    instance = %invocation.instance,
                    activity = %invocation.name,
                    attempt = invocation.attempt,
                    worker_id = %worker_id,
                    outcome = "success",
                    duration_ms,
                    "Activity completed"
                );
                let event = EventKind::ActivityCompleted {
                    scheduled_seq: invocation.scheduled_seq,
                    result,
                };
                if self.record_outcome(&task, invocation, event, worker_id).await {
                    RuntimeMetrics::bump(&self.metrics.activities_succeeded);
                }
            }
            Attempt::Failed(message) => {
                let details = ErrorDetails::Application { message };
                self.handle_failed_attempt(&task, invocation, details, duration_ms, worker_id).await;
            }
            Attempt::TimedOut(limit) => {
                let details = ErrorDetails::Timeout {
                    message: format!("attempt exceeded {limit:?}"),
                };
                self.handle_failed_attempt(&task, invocation, details, duration_ms, worker_id).await;
            }
        }
    }

    async fn handle_failed_attempt(
        &self,
        task: &LeasedTask,
        invocation: &ActivityInvocation,
        details: ErrorDetails,
        duration_ms: u64,
        worker_id: &str,
    ) {
        warn!(
            target: "duraflow::runtime::worker",
            instance = %invocation.instance,
            activity = %invocation.name,
            attempt = invocation.attempt,
            max_attempts = invocation.retry.max_attempts,
            worker_id = %worker_id,
            duration_ms,
            error = %details.display_message(),
            "Activity attempt failed"
        );
        if invocation.retry.should_retry(invocation.attempt) {
            self.schedule_retry(task, invocation, worker_id).await;
            return;
        }
        let event = EventKind::ActivityFailed {
            scheduled_seq: invocation.scheduled_seq,
            details,
            attempts: invocation.attempt,
        };
        if self.record_outcome(task, invocation, event, worker_id).await {
            RuntimeMetrics::bump(&self.metrics.activities_failed);
        }
    }

    /// Replace the task with the next attempt, visible after the backoff.
    async fn schedule_retry(&self, task: &LeasedTask, invocation: &ActivityInvocation, worker_id: &str) {
        let delay = invocation.retry.delay_for_attempt(invocation.attempt);
        let next = ActivityInvocation {
            attempt: invocation.attempt + 1,
            ..invocation.clone()
        };
        let visible_at = crate::now_millis() + delay.as_millis() as u64;
        match self
            .provider
            .reschedule(&task.token, NewTask::at(TaskKind::Activity(next), visible_at))
            .await
        {
            Ok(()) => {
                RuntimeMetrics::bump(&self.metrics.activity_retries);
                debug!(
                    target: "duraflow::runtime::worker",
                    instance = %invocation.instance,
                    activity = %invocation.name,
                    next_attempt = invocation.attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "activity retry scheduled"
                );
            }
            Err(e) => {
                // The lock is gone: the same attempt will be delivered again.
                RuntimeMetrics::bump(&self.metrics.infrastructure_errors);
                debug!(
                    target: "duraflow::runtime::worker",
                    worker_id = %worker_id,
                    error = %e,
                    "could not reschedule activity"
                );
            }
        }
    }

    /// Record the terminal outcome and ack. Returns `true` if this call wrote it.
    async fn record_outcome(
        &self,
        task: &LeasedTask,
        invocation: &ActivityInvocation,
        event: EventKind,
        worker_id: &str,
    ) -> bool {
        let recorded = self
            .execute_with_retry("record_activity_outcome", || {
                record_input(self.provider.as_ref(), &invocation.instance, event.clone())
            })
            .await;
        match recorded {
            Ok(outcome) => {
                self.ack_or_log(&task.token, worker_id).await;
                matches!(outcome, DeliveryOutcome::Recorded(_))
            }
            Err(e) => {
                RuntimeMetrics::bump(&self.metrics.infrastructure_errors);
                self.nack_or_log(
                    &task.token,
                    false,
                    self.options.lease_contention_backoff,
                    worker_id,
                    &e.to_string(),
                )
                .await;
                false
            }
        }
    }

    async fn ack_or_log(&self, token: &str, worker_id: &str) {
        if let Err(e) = self.provider.ack(token).await {
            debug!(
                target: "duraflow::runtime::worker",
                worker_id = %worker_id,
                lock_token = %token,
                error = %e,
                "ack failed; task will be redelivered"
            );
        }
    }

    async fn nack_or_log(&self, token: &str, ignore_attempt: bool, delay: Duration, worker_id: &str, why: &str) {
        let opts = NackOptions {
            delay: Some(delay),
            ignore_attempt,
        };
        if let Err(e) = self.provider.nack(token, opts).await {
            debug!(
                target: "duraflow::runtime::worker",
                worker_id = %worker_id,
                lock_token = %token,
                error = %e,
                reason = %why,
                "nack failed"
            );
        }
    }
}

/// Flip `flag` once the instance is cancelled or closed.
fn spawn_cancel_watcher(
    provider: Arc<dyn Provider>,
    instance: InstanceId,
    flag: Arc<AtomicBool>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Ok(history) = provider.read(&instance).await {
                let stop = history
                    .iter()
                    .any(|e| e.kind.is_terminal() || matches!(e.kind, EventKind::CancelRequested { .. }));
                if stop {
                    flag.store(true, Ordering::Relaxed);
                    debug!(target: "duraflow::runtime::worker", instance = %instance, "activity cancellation signalled");
                    return;
                }
            }
            tokio::time::sleep(every).await;
        }
    })
}
