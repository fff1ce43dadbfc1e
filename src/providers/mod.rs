//! Storage contracts.
//!
//! Four traits split the durable state by concern:
//!
//! - [`HistoryStore`]: per-instance append-only event log with
//!   compare-and-append, the serialization point of the whole system.
//! - [`TaskQueue`]: at-least-once queues with visibility timeouts,
//!   delayed visibility, delivery counting and a dead-letter store.
//! - [`LeaseStore`]: TTL leases with fencing tokens for instance and node
//!   ownership.
//! - [`InstanceStore`]: run creation (with idempotency) and the status
//!   index used for listing. The index is derived data; the history wins.
//!
//! [`Provider`] bundles all four and is what the runtime and client consume.
//!
//! ## Atomicity requirements
//!
//! - `append_with_tasks` appends the events and enqueues the tasks in one
//!   transaction. On `Conflict` nothing is written and nothing is enqueued.
//! - `start_instance` creates the run record, writes `WorkflowStarted` and
//!   enqueues the first workflow task in one transaction.
//! - Workflow tasks are coalesced: enqueueing a workflow task for an instance
//!   that already has one waiting (not leased) keeps a single task.

use crate::{Event, EventKind, InstanceId, ParentLink, StatusKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::{AppendError, ProviderError, StartError};

/// Queue of workflow activation tasks (and the follow-ups coordinators handle).
pub const WORKFLOW_QUEUE: &str = "workflows";
/// Queue of activity invocations.
pub const ACTIVITY_QUEUE: &str = "activities";
/// Queue of pending timers, each visible at its fire time.
pub const TIMER_QUEUE: &str = "timers";

/// One request to execute an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInvocation {
    pub instance: InstanceId,
    /// Sequence number of the `ActivityScheduled` event.
    pub scheduled_seq: u64,
    pub name: String,
    pub input: String,
    pub retry: crate::RetryPolicy,
    /// Policy-level attempt, 1-based. Distinct from queue redeliveries.
    pub attempt: u32,
}

impl ActivityInvocation {
    /// Request id shared by every physical execution of this invocation.
    pub fn idempotency_key(&self) -> String {
        format!("{}#{}", self.instance, self.scheduled_seq)
    }
}

/// Dispatchable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskKind {
    /// Run workflow logic for the instance over its current history.
    Workflow { instance: InstanceId },
    Activity(ActivityInvocation),
    Timer {
        instance: InstanceId,
        started_seq: u64,
        fire_at_ms: u64,
    },
    StartChild {
        parent: ParentLink,
        name: String,
        workflow_id: String,
        input: String,
    },
    ChildClosed {
        parent: ParentLink,
        child: InstanceId,
        result: Result<String, crate::ErrorDetails>,
    },
    ContinueAsNew {
        previous: InstanceId,
        next_run_id: String,
        name: String,
        version: Option<String>,
        input: String,
        parent: Option<ParentLink>,
        execution_timeout_ms: Option<u64>,
    },
}

impl TaskKind {
    pub fn queue(&self) -> &'static str {
        match self {
            TaskKind::Activity(_) => ACTIVITY_QUEUE,
            TaskKind::Timer { .. } => TIMER_QUEUE,
            TaskKind::Workflow { .. }
            | TaskKind::StartChild { .. }
            | TaskKind::ChildClosed { .. }
            | TaskKind::ContinueAsNew { .. } => WORKFLOW_QUEUE,
        }
    }

    /// Instance key under which waiting workflow tasks are coalesced.
    pub fn coalesce_key(&self) -> Option<String> {
        match self {
            TaskKind::Workflow { instance } => Some(instance.to_string()),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Workflow { .. } => "Workflow",
            TaskKind::Activity(_) => "Activity",
            TaskKind::Timer { .. } => "Timer",
            TaskKind::StartChild { .. } => "StartChild",
            TaskKind::ChildClosed { .. } => "ChildClosed",
            TaskKind::ContinueAsNew { .. } => "ContinueAsNew",
        }
    }
}

/// A task to enqueue, visible no earlier than `not_before_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub kind: TaskKind,
    pub not_before_ms: u64,
}

impl NewTask {
    pub fn now(kind: TaskKind) -> Self {
        Self {
            kind,
            not_before_ms: 0,
        }
    }

    pub fn at(kind: TaskKind, not_before_ms: u64) -> Self {
        Self { kind, not_before_ms }
    }
}

/// A task handed to a consumer until `ack`, `nack` or visibility expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedTask {
    pub kind: TaskKind,
    pub token: String,
    /// Number of deliveries including this one.
    pub delivery_count: u32,
}

/// How a consumer gives a task back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NackOptions {
    pub delay: Option<Duration>,
    /// Do not count this delivery toward the poison threshold
    /// (lease contention, foreign ownership).
    pub ignore_attempt: bool,
}

/// A task parked after too many deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: u64,
    pub queue: String,
    pub kind: TaskKind,
    pub delivery_count: u32,
    pub reason: String,
    pub dead_at_ms: u64,
}

/// Time-bounded ownership of a key. `token` increases every time the key
/// changes hands and can be used as a fencing token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub owner: String,
    pub token: u64,
    pub expires_at_ms: u64,
}

/// Row of the status index.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub instance: InstanceId,
    pub workflow_name: String,
    pub status: StatusKind,
    pub output: Option<String>,
    pub idempotency_key: Option<String>,
    pub parent: Option<ParentLink>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub closed_at_ms: Option<u64>,
    /// History length as of the last append.
    pub last_seq: u64,
}

/// Request to create a run.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    /// Identity of the new run; `run_id` is chosen by the caller.
    pub instance: InstanceId,
    pub workflow_name: String,
    pub version: Option<String>,
    pub input: String,
    /// Deduplicates starts of the same workflow id within `idempotency_window`.
    pub idempotency_key: Option<String>,
    /// `None` keeps the key effective forever.
    pub idempotency_window: Option<Duration>,
    pub parent: Option<ParentLink>,
    pub execution_timeout_ms: Option<u64>,
}

impl StartRequest {
    pub(crate) fn started_event(&self) -> EventKind {
        EventKind::WorkflowStarted {
            name: self.workflow_name.clone(),
            version: self.version.clone(),
            input: self.input.clone(),
            parent: self.parent.clone(),
            execution_timeout_ms: self.execution_timeout_ms,
        }
    }

    /// Whether a run created at `created_at_ms` with `key` satisfies this request.
    pub(crate) fn matches_existing(&self, key: Option<&str>, created_at_ms: u64, now_ms: u64) -> bool {
        match (&self.idempotency_key, key) {
            (Some(want), Some(have)) if want == have => match self.idempotency_window {
                Some(window) => now_ms.saturating_sub(created_at_ms) <= window.as_millis() as u64,
                None => true,
            },
            _ => false,
        }
    }
}

/// Result of `start_instance`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Created(InstanceId),
    /// The request matched an existing run (same run id, or same idempotency key
    /// within the window).
    Existing(InstanceId),
}

impl StartOutcome {
    pub fn instance(&self) -> &InstanceId {
        match self {
            StartOutcome::Created(i) | StartOutcome::Existing(i) => i,
        }
    }
}

#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append `events` if the instance's last sequence number equals
    /// `expected_last_seq`, and enqueue `tasks` in the same transaction.
    /// Sequence numbers and timestamps are assigned here. Returns the new last
    /// sequence number.
    async fn append_with_tasks(
        &self,
        instance: &InstanceId,
        expected_last_seq: u64,
        events: Vec<EventKind>,
        tasks: Vec<NewTask>,
    ) -> Result<u64, AppendError>;

    async fn append_events(
        &self,
        instance: &InstanceId,
        expected_last_seq: u64,
        events: Vec<EventKind>,
    ) -> Result<u64, AppendError> {
        self.append_with_tasks(instance, expected_last_seq, events, Vec::new()).await
    }

    /// Events with `seq >= from_seq`, in order, without gaps.
    async fn read_events(&self, instance: &InstanceId, from_seq: u64) -> Result<Vec<Event>, ProviderError>;

    /// Last sequence number, 0 for an instance without history.
    async fn last_seq(&self, instance: &InstanceId) -> Result<u64, ProviderError>;

    async fn read(&self, instance: &InstanceId) -> Result<Vec<Event>, ProviderError> {
        self.read_events(instance, 1).await
    }
}

#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: NewTask) -> Result<(), ProviderError>;

    /// Lease the oldest visible task of `queue` for `visibility`.
    async fn dequeue(&self, queue: &str, visibility: Duration) -> Result<Option<LeasedTask>, ProviderError>;

    /// Remove a leased task. Fails if the lease was lost.
    async fn ack(&self, token: &str) -> Result<(), ProviderError>;

    /// Return a leased task to its queue.
    async fn nack(&self, token: &str, options: NackOptions) -> Result<(), ProviderError>;

    /// Push the visibility deadline of a leased task to now + `visibility`.
    async fn extend_lease(&self, token: &str, visibility: Duration) -> Result<(), ProviderError>;

    /// Atomically replace a leased task with `next` (fresh delivery count).
    async fn reschedule(&self, token: &str, next: NewTask) -> Result<(), ProviderError>;

    /// Move a leased task to the dead-letter store.
    async fn dead_letter(&self, token: &str, reason: &str) -> Result<(), ProviderError>;

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, ProviderError>;

    /// Put a dead letter back on its queue with a fresh delivery count.
    /// Returns `false` if no such dead letter exists.
    async fn requeue_dead_letter(&self, id: u64) -> Result<bool, ProviderError>;

    /// Tasks on `queue`, leased or not.
    async fn queue_depth(&self, queue: &str) -> Result<u64, ProviderError>;
}

#[async_trait::async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take or extend the lease on `key`. Returns `None` while another owner
    /// holds an unexpired lease.
    async fn acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<Option<Lease>, ProviderError>;

    /// Extend a held lease. Returns `None` if it changed hands.
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, ProviderError>;

    async fn release_lease(&self, lease: &Lease) -> Result<(), ProviderError>;

    /// Unexpired leases whose key starts with `prefix`.
    async fn list_leases(&self, prefix: &str) -> Result<Vec<Lease>, ProviderError>;
}

#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    async fn start_instance(&self, request: StartRequest) -> Result<StartOutcome, StartError>;

    async fn get_instance(&self, instance: &InstanceId) -> Result<Option<InstanceRecord>, ProviderError>;

    /// Most recently created run of a workflow id.
    async fn latest_run(&self, namespace: &str, workflow_id: &str) -> Result<Option<InstanceRecord>, ProviderError>;

    async fn update_status(
        &self,
        instance: &InstanceId,
        status: StatusKind,
        output: Option<String>,
    ) -> Result<(), ProviderError>;

    async fn list_instances(&self, status: Option<StatusKind>) -> Result<Vec<InstanceRecord>, ProviderError>;

    /// Delete closed runs (record and history) closed before `cutoff_ms`.
    async fn purge_closed_before(&self, cutoff_ms: u64) -> Result<u64, ProviderError>;
}

/// Everything the runtime needs from storage.
pub trait Provider: HistoryStore + TaskQueue + LeaseStore + InstanceStore {}

impl<T> Provider for T where T: HistoryStore + TaskQueue + LeaseStore + InstanceStore {}

/// Status-index update implied by an appended terminal event.
pub(crate) fn terminal_status(kind: &EventKind) -> Option<(StatusKind, Option<String>)> {
    match kind {
        EventKind::WorkflowCompleted { output } => Some((StatusKind::Completed, Some(output.clone()))),
        EventKind::WorkflowFailed { details } => Some((StatusKind::Failed, Some(details.display_message()))),
        EventKind::WorkflowTimedOut => Some((StatusKind::TimedOut, None)),
        EventKind::WorkflowCancelled { reason } => Some((StatusKind::Cancelled, Some(reason.clone()))),
        EventKind::WorkflowContinuedAsNew { next_run_id, .. } => {
            Some((StatusKind::ContinuedAsNew, Some(next_run_id.clone())))
        }
        _ => None,
    }
}

/// Timestamp for an appended event: wall clock, but never before the previous event.
pub(crate) fn next_timestamp(previous_ms: u64) -> u64 {
    crate::now_millis().max(previous_ms)
}
