//! Timer dispatcher: timer tasks are enqueued with their fire time as
//! delayed visibility, so a dequeued timer is due. Firing records
//! `TimerFired` and wakes the workflow.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::super::delivery::{DeliveryOutcome, record_input};
use super::super::{Runtime, RuntimeMetrics};
use crate::EventKind;
use crate::providers::{LeasedTask, NackOptions, TIMER_QUEUE, TaskKind};

impl Runtime {
    pub(in crate::runtime) fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let count = self.options.timer_concurrency;
        self.spawn_pool("timer", count, |rt, worker_id| async move {
            loop {
                if rt.shutdown_flag.load(Ordering::Relaxed) {
                    break;
                }
                match rt
                    .provider
                    .dequeue(TIMER_QUEUE, rt.options.workflow_visibility_timeout)
                    .await
                {
                    Ok(Some(task)) => rt.fire_timer(task, &worker_id).await,
                    Ok(None) => rt.idle().await,
                    Err(e) => {
                        warn!(target: "duraflow::runtime::timer", worker_id = %worker_id, error = %e, "dequeue failed");
                        RuntimeMetrics::bump(&rt.metrics.infrastructure_errors);
                        rt.idle().await;
                    }
                }
            }
        })
    }

    async fn fire_timer(&self, task: LeasedTask, worker_id: &str) {
        if self.dead_letter_if_poisoned(&task, worker_id).await {
            return;
        }
        let TaskKind::Timer {
            instance,
            started_seq,
            fire_at_ms,
        } = &task.kind
        else {
            let reason = format!("{} task on the timer queue", task.kind.name());
            if let Err(e) = self.provider.dead_letter(&task.token, &reason).await {
                warn!(target: "duraflow::runtime::timer", error = %e, "failed to dead-letter task");
            }
            return;
        };

        let event = EventKind::TimerFired {
            started_seq: *started_seq,
            fire_at_ms: *fire_at_ms,
        };
        let recorded = self
            .execute_with_retry("fire_timer", || record_input(self.provider.as_ref(), instance, event.clone()))
            .await;
        let settled = match recorded {
            Ok(outcome) => {
                if let DeliveryOutcome::Recorded(seq) = outcome {
                    RuntimeMetrics::bump(&self.metrics.timers_fired);
                    debug!(
                        target: "duraflow::runtime::timer",
                        instance = %instance,
                        started_seq,
                        seq,
                        late_ms = crate::now_millis().saturating_sub(*fire_at_ms),
                        "timer fired"
                    );
                }
                self.provider.ack(&task.token).await
            }
            Err(e) => {
                RuntimeMetrics::bump(&self.metrics.infrastructure_errors);
                warn!(
                    target: "duraflow::runtime::timer",
                    instance = %instance,
                    started_seq,
                    error = %e,
                    "could not record timer"
                );
                self.provider
                    .nack(
                        &task.token,
                        NackOptions {
                            delay: Some(self.options.lease_contention_backoff),
                            ignore_attempt: false,
                        },
                    )
                    .await
            }
        };
        if let Err(e) = settled {
            debug!(target: "duraflow::runtime::timer", lock_token = %task.token, error = %e, "could not settle timer task");
        }
    }
}
