//! Recording of input events.
//!
//! Activity results, timer firings, child results, signals and cancellation
//! requests reach an instance from many writers, each of which may run more
//! than once for the same logical input. Every write here goes through the
//! history store's compare-and-append with a fresh read, and results that are
//! already present are skipped, so each logical input is recorded at most once.
//! The workflow task that wakes the coordinator is enqueued in the same append.

use tracing::debug;

use super::limits::MAX_DELIVERY_ATTEMPTS;
use crate::providers::{AppendError, NewTask, Provider, ProviderError, TaskKind};
use crate::{Event, EventKind, InstanceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Appended at this sequence number.
    Recorded(u64),
    /// An equivalent input is already in the history.
    Duplicate,
    /// The run has reached a terminal state; inputs are no longer accepted.
    InstanceClosed,
    NotFound,
}

/// Whether `history` already holds the input `event` would record.
///
/// Results are keyed by the decision they answer; a cancellation is recorded
/// once per run. Signals are never duplicates of each other.
pub fn already_recorded(history: &[Event], event: &EventKind) -> bool {
    let answers = |e: &EventKind| -> Option<u64> {
        match e {
            EventKind::ActivityCompleted { scheduled_seq, .. }
            | EventKind::ActivityFailed { scheduled_seq, .. }
            | EventKind::ChildWorkflowCompleted { scheduled_seq, .. }
            | EventKind::ChildWorkflowFailed { scheduled_seq, .. } => Some(*scheduled_seq),
            EventKind::TimerFired { started_seq, .. } => Some(*started_seq),
            _ => None,
        }
    };
    if matches!(event, EventKind::CancelRequested { .. }) {
        return history
            .iter()
            .any(|e| matches!(e.kind, EventKind::CancelRequested { .. }));
    }
    match answers(event) {
        Some(target) => history.iter().any(|e| answers(&e.kind) == Some(target)),
        None => false,
    }
}

/// Append `event` to `instance` exactly once and wake its coordinator.
///
/// # Errors
///
/// Provider errors are returned as is. An instance that keeps moving for
/// [`MAX_DELIVERY_ATTEMPTS`] consecutive attempts yields a retryable error.
pub async fn record_input(
    provider: &dyn Provider,
    instance: &InstanceId,
    event: EventKind,
) -> Result<DeliveryOutcome, ProviderError> {
    debug_assert!(!event.is_decision(), "decisions are appended by coordinators");
    for _ in 0..MAX_DELIVERY_ATTEMPTS {
        let history = provider.read(instance).await?;
        let Some(last) = history.last() else {
            return Ok(DeliveryOutcome::NotFound);
        };
        if history.iter().any(|e| e.kind.is_terminal()) {
            return Ok(DeliveryOutcome::InstanceClosed);
        }
        if already_recorded(&history, &event) {
            debug!(
                target: "duraflow::runtime::delivery",
                instance = %instance,
                event = event.name(),
                "input already recorded"
            );
            return Ok(DeliveryOutcome::Duplicate);
        }
        let wake = NewTask::now(TaskKind::Workflow {
            instance: instance.clone(),
        });
        match provider
            .append_with_tasks(instance, last.seq, vec![event.clone()], vec![wake])
            .await
        {
            Ok(seq) => {
                debug!(
                    target: "duraflow::runtime::delivery",
                    instance = %instance,
                    seq,
                    event = event.name(),
                    "input recorded"
                );
                return Ok(DeliveryOutcome::Recorded(seq));
            }
            Err(AppendError::Conflict { expected, actual }) => {
                debug!(
                    target: "duraflow::runtime::delivery",
                    instance = %instance,
                    expected,
                    actual,
                    "history moved; re-reading"
                );
            }
            Err(AppendError::NotFound(_)) => return Ok(DeliveryOutcome::NotFound),
            Err(AppendError::Provider(e)) => return Err(e),
        }
    }
    Err(ProviderError::retryable(
        "record_input",
        format!("{instance} kept changing for {MAX_DELIVERY_ATTEMPTS} attempts"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorDetails;
    use crate::providers::in_memory::InMemoryProvider;
    use crate::providers::{HistoryStore, InstanceStore, StartRequest, TaskQueue, WORKFLOW_QUEUE};

    fn start(instance: &InstanceId) -> StartRequest {
        StartRequest {
            instance: instance.clone(),
            workflow_name: "w".into(),
            version: None,
            input: String::new(),
            idempotency_key: None,
            idempotency_window: None,
            parent: None,
            execution_timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn second_result_for_the_same_decision_is_dropped() {
        let store = InMemoryProvider::new();
        let id = InstanceId::new("ns", "wf", "r");
        store.start_instance(start(&id)).await.unwrap();

        let done = EventKind::ActivityCompleted {
            scheduled_seq: 4,
            result: "ok".into(),
        };
        assert_eq!(
            record_input(&store, &id, done.clone()).await.unwrap(),
            DeliveryOutcome::Recorded(2)
        );
        let late_failure = EventKind::ActivityFailed {
            scheduled_seq: 4,
            details: ErrorDetails::Application { message: "x".into() },
            attempts: 3,
        };
        assert_eq!(
            record_input(&store, &id, late_failure).await.unwrap(),
            DeliveryOutcome::Duplicate
        );
        assert_eq!(store.read(&id).await.unwrap().len(), 2);
        // start task and the wake-up coalesce into one
        assert_eq!(store.queue_depth(WORKFLOW_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn signals_accumulate_and_closed_runs_reject_inputs() {
        let store = InMemoryProvider::new();
        let id = InstanceId::new("ns", "wf", "r");
        store.start_instance(start(&id)).await.unwrap();
        let signal = EventKind::SignalReceived {
            name: "approve".into(),
            payload: "yes".into(),
        };
        record_input(&store, &id, signal.clone()).await.unwrap();
        assert_eq!(
            record_input(&store, &id, signal.clone()).await.unwrap(),
            DeliveryOutcome::Recorded(3)
        );

        store
            .append_events(
                &id,
                3,
                vec![
                    EventKind::ActivationCompleted,
                    EventKind::WorkflowCompleted { output: "done".into() },
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            record_input(&store, &id, signal).await.unwrap(),
            DeliveryOutcome::InstanceClosed
        );
        let missing = InstanceId::new("ns", "nope", "r");
        assert_eq!(
            record_input(&store, &missing, EventKind::CancelRequested { reason: "x".into() })
                .await
                .unwrap(),
            DeliveryOutcome::NotFound
        );
    }
}
