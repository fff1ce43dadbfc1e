//! Workflow dispatcher: leases tasks from the workflow queue and turns them
//! into coordinator activations and follow-up actions.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::super::coordinator::{ActivationOutcome, CoordinatorError};
use super::super::{Runtime, RuntimeMetrics};
use super::{spawn_lease_renewal, spawn_task_renewal};
use crate::InstanceId;
use crate::providers::{LeasedTask, NackOptions, ProviderError, TaskKind, WORKFLOW_QUEUE};
use crate::runtime::replay_engine::WorkflowState;

/// What to do with the task once its work is done.
enum Disposition {
    Ack,
    Retry { ignore_attempt: bool, delay: std::time::Duration },
    DeadLetter(String),
}

impl Runtime {
    pub(in crate::runtime) fn start_workflow_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let count = self.options.workflow_concurrency;
        self.spawn_pool("workflow", count, |rt, worker_id| async move {
            loop {
                if rt.shutdown_flag.load(Ordering::Relaxed) {
                    break;
                }
                match rt
                    .provider
                    .dequeue(WORKFLOW_QUEUE, rt.options.workflow_visibility_timeout)
                    .await
                {
                    Ok(Some(task)) => rt.process_workflow_task(task, &worker_id).await,
                    Ok(None) => rt.idle().await,
                    Err(e) => {
                        warn!(target: "duraflow::runtime::workflow", worker_id = %worker_id, error = %e, "dequeue failed");
                        RuntimeMetrics::bump(&rt.metrics.infrastructure_errors);
                        rt.idle().await;
                    }
                }
            }
        })
    }

    async fn process_workflow_task(self: &Arc<Self>, task: LeasedTask, worker_id: &str) {
        if self.dead_letter_if_poisoned(&task, worker_id).await {
            return;
        }
        let disposition = match &task.kind {
            TaskKind::Workflow { instance } => self.run_activation(instance, &task, worker_id).await,
            TaskKind::StartChild {
                parent,
                name,
                workflow_id,
                input,
            } => {
                let r = self
                    .execute_with_retry("start_child", || {
                        self.coordinator.start_child(parent, name, workflow_id, input)
                    })
                    .await;
                self.follow_up(r, "start_child", worker_id)
            }
            TaskKind::ChildClosed { parent, child, result } => {
                let r = self
                    .execute_with_retry("close_child", || self.coordinator.close_child(parent, child, result))
                    .await;
                self.follow_up(r, "close_child", worker_id)
            }
            TaskKind::ContinueAsNew {
                previous,
                next_run_id,
                name,
                version,
                input,
                parent,
                execution_timeout_ms,
            } => {
                let r = self
                    .execute_with_retry("continue_as_new", || {
                        self.coordinator.continue_as_new(
                            previous,
                            next_run_id,
                            name,
                            version.clone(),
                            input,
                            parent.clone(),
                            *execution_timeout_ms,
                        )
                    })
                    .await;
                self.follow_up(r, "continue_as_new", worker_id)
            }
            other => Disposition::DeadLetter(format!("{} task on the workflow queue", other.name())),
        };
        self.settle(&task, disposition, worker_id).await;
    }

    async fn run_activation(self: &Arc<Self>, instance: &InstanceId, task: &LeasedTask, worker_id: &str) -> Disposition {
        if !self.membership.owns(instance) {
            debug!(
                target: "duraflow::runtime::workflow",
                instance = %instance,
                worker_id = %worker_id,
                "instance owned by another node"
            );
            return Disposition::Retry {
                ignore_attempt: true,
                delay: self.options.lease_contention_backoff,
            };
        }

        let renewal = spawn_task_renewal(
            self.provider.clone(),
            task.token.clone(),
            self.options.workflow_visibility_timeout,
            self.shutdown_flag.clone(),
        );
        let result = self
            .execute_with_retry("activation", || self.activate_with_lease_renewal(instance, worker_id))
            .await;
        renewal.abort();

        match result {
            Ok(ActivationOutcome::LeaseUnavailable) => {
                RuntimeMetrics::bump(&self.metrics.lease_contention);
                Disposition::Retry {
                    ignore_attempt: true,
                    delay: self.options.lease_contention_backoff,
                }
            }
            Ok(ActivationOutcome::Committed { state, .. }) => {
                RuntimeMetrics::bump(&self.metrics.activations_committed);
                if matches!(state, WorkflowState::Terminal(_)) {
                    RuntimeMetrics::bump(&self.metrics.workflows_closed);
                }
                Disposition::Ack
            }
            Ok(ActivationOutcome::Conflict { .. }) => {
                // Whoever appended first enqueued its own follow-up work.
                RuntimeMetrics::bump(&self.metrics.activation_conflicts);
                Disposition::Ack
            }
            Ok(ActivationOutcome::HandlerMissing { .. }) => Disposition::Retry {
                ignore_attempt: false,
                delay: self.options.unregistered_backoff,
            },
            Ok(ActivationOutcome::NoNewEvents | ActivationOutcome::Terminal(_)) => Disposition::Ack,
            Err(CoordinatorError::CorruptHistory { instance, reason }) => {
                error!(
                    target: "duraflow::runtime::workflow",
                    instance = %instance,
                    reason = %reason,
                    "corrupt history"
                );
                Disposition::DeadLetter(format!("corrupt history: {reason}"))
            }
            Err(CoordinatorError::NotFound(instance)) => {
                warn!(target: "duraflow::runtime::workflow", instance = %instance, "workflow task for unknown instance");
                Disposition::Ack
            }
            Err(CoordinatorError::Provider(e)) => {
                RuntimeMetrics::bump(&self.metrics.infrastructure_errors);
                warn!(
                    target: "duraflow::runtime::workflow",
                    instance = %instance,
                    error = %e,
                    "activation failed; task will be retried"
                );
                Disposition::Retry {
                    ignore_attempt: false,
                    delay: self.options.lease_contention_backoff,
                }
            }
        }
    }

    async fn activate_with_lease_renewal(
        &self,
        instance: &InstanceId,
        worker_id: &str,
    ) -> Result<ActivationOutcome, CoordinatorError> {
        let Some(lease) = self.coordinator.acquire_as(instance, worker_id).await? else {
            return Ok(ActivationOutcome::LeaseUnavailable);
        };
        let renewal = spawn_lease_renewal(
            self.provider.clone(),
            lease.clone(),
            self.options.instance_lease_ttl,
            self.shutdown_flag.clone(),
        );
        let result = match self.coordinator.prepare(instance, lease).await {
            Ok(prepared) => self.coordinator.commit(prepared).await,
            Err(e) => Err(e),
        };
        renewal.abort();
        result
    }

    fn follow_up(&self, result: Result<(), ProviderError>, operation: &str, worker_id: &str) -> Disposition {
        match result {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                RuntimeMetrics::bump(&self.metrics.infrastructure_errors);
                warn!(
                    target: "duraflow::runtime::workflow",
                    worker_id = %worker_id,
                    operation,
                    error = %e,
                    "follow-up task failed"
                );
                Disposition::Retry {
                    ignore_attempt: false,
                    delay: self.options.lease_contention_backoff,
                }
            }
        }
    }

    async fn settle(&self, task: &LeasedTask, disposition: Disposition, worker_id: &str) {
        let result = match disposition {
            Disposition::Ack => self.provider.ack(&task.token).await,
            Disposition::Retry { ignore_attempt, delay } => {
                self.provider
                    .nack(
                        &task.token,
                        NackOptions {
                            delay: Some(delay),
                            ignore_attempt,
                        },
                    )
                    .await
            }
            Disposition::DeadLetter(reason) => {
                RuntimeMetrics::bump(&self.metrics.dead_lettered);
                self.provider.dead_letter(&task.token, &reason).await
            }
        };
        if let Err(e) = result {
            // The lock expired and the task is visible again; its next
            // delivery repeats the work, which is idempotent.
            debug!(
                target: "duraflow::runtime::workflow",
                worker_id = %worker_id,
                lock_token = %task.token,
                error = %e,
                "could not settle task"
            );
        }
    }
}
