//! Duraflow: durable, replay-based workflow orchestration.
//!
//! A workflow is ordinary async Rust that receives a [`WorkflowContext`]. Every
//! decision it takes (schedule an activity, start a timer, start a child
//! workflow, record a random value) becomes an event in an append-only,
//! per-instance history. After any interruption the engine rebuilds the
//! workflow's in-memory state by replaying that history, so work that already
//! happened is never repeated and the workflow resumes exactly where it stopped.
//!
//! The moving parts:
//!
//! - [`providers`]: the storage contracts (history store with
//!   compare-and-append, task queue with visibility timeouts, lease store,
//!   instance index) plus in-memory and SQLite implementations.
//! - [`runtime`]: the replay engine, the workflow coordinator, the activity
//!   worker pool, the timer dispatcher and the ownership layer that shards
//!   instances across nodes.
//! - [`Client`]: start, signal, cancel, query and wait for workflows.
//!
//! ```rust,no_run
//! use duraflow::providers::sqlite::SqliteProvider;
//! use duraflow::runtime::{self, registry::ActivityRegistry};
//! use duraflow::{Client, RetryPolicy, WorkflowContext, WorkflowRegistry};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(SqliteProvider::new("sqlite:./payments.db", None).await?);
//!
//! let activities = ActivityRegistry::builder()
//!     .register("charge", |_ctx, amount: String| async move { Ok(format!("receipt-{amount}")) })
//!     .build();
//!
//! let workflows = WorkflowRegistry::builder()
//!     .register("payment", |ctx: WorkflowContext, amount: String| async move {
//!         let receipt = ctx
//!             .schedule_activity_with_retry("charge", amount, RetryPolicy::new(3))
//!             .await
//!             .map_err(|e| e.to_string())?;
//!         Ok(format!("charged:{receipt}"))
//!     })
//!     .build();
//!
//! let rt = runtime::Runtime::start(provider.clone(), Arc::new(activities), workflows).await;
//! let client = Client::new(provider);
//! let instance = client.submit("billing", "order-42", Some("req-1"), "payment", "100").await?;
//! let status = client.wait_for_completion(&instance, std::time::Duration::from_secs(10)).await?;
//! println!("{status:?}");
//! rt.shutdown().await;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod client;
pub mod context;
pub mod logging;
pub mod provider_validation;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use client::{Client, ClientError, StartWorkflow};
pub use context::{
    ActivityFuture, CancellationFuture, ChildWorkflowFuture, SignalFuture, TimerFuture, WorkflowContext,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runtime::registry::{ActivityRegistry, VersionPolicy, WorkflowRegistry};
pub use runtime::{ActivityContext, Runtime, RuntimeOptions};

// Typed payload helpers shared by the registries, the context and the client.
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Bare strings travel unquoted so typed and untyped callers interoperate
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => serde_json::from_value(Value::String(s.to_string())).map_err(|e| e.to_string()),
            }
        }
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Identity of one run of a workflow.
///
/// `workflow_id` is chosen by the caller and is stable across runs;
/// `run_id` is fresh for every execution that does not continue the same
/// history (a new start, or a continue-as-new).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    pub namespace: String,
    pub workflow_id: String,
    pub run_id: String,
}

impl InstanceId {
    pub fn new(namespace: impl Into<String>, workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }

    /// Stable sharding key: every run of a workflow lands on the same owner.
    pub fn ownership_key(&self) -> String {
        format!("{}/{}", self.namespace, self.workflow_id)
    }

    /// Key of the coordinator lease guarding activations of this run.
    pub fn lease_key(&self) -> String {
        format!("instance/{}/{}/{}", self.namespace, self.workflow_id, self.run_id)
    }

    pub(crate) fn with_run(&self, run_id: impl Into<String>) -> Self {
        Self {
            namespace: self.namespace.clone(),
            workflow_id: self.workflow_id.clone(),
            run_id: run_id.into(),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.workflow_id, self.run_id)
    }
}

/// Link from a child run back to the decision that scheduled it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance: InstanceId,
    pub scheduled_seq: u64,
}

/// One immutable history record. `seq` is gapless per instance and starts at 1;
/// `timestamp_ms` is assigned by the store at append time and never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

/// Payload of a history record.
///
/// Decisions are written only by the coordinator that holds the instance;
/// everything else (start, results, timer firings, signals, cancellation) is
/// an input written by whoever observed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    WorkflowStarted {
        name: String,
        /// Version requested at start; `None` lets the registry policy decide.
        version: Option<String>,
        input: String,
        parent: Option<ParentLink>,
        execution_timeout_ms: Option<u64>,
    },
    /// Opens the decision block of one committed activation.
    ActivationCompleted,
    /// Version of the workflow code this run is bound to.
    VersionPinned { version: String },
    ActivityScheduled {
        name: String,
        input: String,
        retry: crate::retry::RetryPolicy,
    },
    ActivityCompleted { scheduled_seq: u64, result: String },
    ActivityFailed {
        scheduled_seq: u64,
        details: ErrorDetails,
        attempts: u32,
    },
    TimerStarted {
        fire_at_ms: u64,
        /// Set for the timer that bounds the whole run.
        #[serde(default)]
        execution_timeout: bool,
    },
    TimerFired { started_seq: u64, fire_at_ms: u64 },
    SignalReceived { name: String, payload: String },
    CancelRequested { reason: String },
    ChildWorkflowScheduled {
        name: String,
        workflow_id: String,
        input: String,
    },
    ChildWorkflowCompleted { scheduled_seq: u64, result: String },
    ChildWorkflowFailed { scheduled_seq: u64, details: ErrorDetails },
    SideEffectRecorded { value: String },
    VersionGatePassed { gate: String },
    WorkflowCompleted { output: String },
    WorkflowFailed { details: ErrorDetails },
    WorkflowTimedOut,
    WorkflowCancelled { reason: String },
    WorkflowContinuedAsNew { input: String, next_run_id: String },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted { .. } => "WorkflowStarted",
            EventKind::ActivationCompleted => "ActivationCompleted",
            EventKind::VersionPinned { .. } => "VersionPinned",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::TimerStarted { .. } => "TimerStarted",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::SignalReceived { .. } => "SignalReceived",
            EventKind::CancelRequested { .. } => "CancelRequested",
            EventKind::ChildWorkflowScheduled { .. } => "ChildWorkflowScheduled",
            EventKind::ChildWorkflowCompleted { .. } => "ChildWorkflowCompleted",
            EventKind::ChildWorkflowFailed { .. } => "ChildWorkflowFailed",
            EventKind::SideEffectRecorded { .. } => "SideEffectRecorded",
            EventKind::VersionGatePassed { .. } => "VersionGatePassed",
            EventKind::WorkflowCompleted { .. } => "WorkflowCompleted",
            EventKind::WorkflowFailed { .. } => "WorkflowFailed",
            EventKind::WorkflowTimedOut => "WorkflowTimedOut",
            EventKind::WorkflowCancelled { .. } => "WorkflowCancelled",
            EventKind::WorkflowContinuedAsNew { .. } => "WorkflowContinuedAsNew",
        }
    }

    /// True for records only a coordinator may append.
    pub fn is_decision(&self) -> bool {
        matches!(
            self,
            EventKind::ActivationCompleted
                | EventKind::VersionPinned { .. }
                | EventKind::ActivityScheduled { .. }
                | EventKind::TimerStarted { .. }
                | EventKind::ChildWorkflowScheduled { .. }
                | EventKind::SideEffectRecorded { .. }
                | EventKind::VersionGatePassed { .. }
        ) || self.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::WorkflowCompleted { .. }
                | EventKind::WorkflowFailed { .. }
                | EventKind::WorkflowTimedOut
                | EventKind::WorkflowCancelled { .. }
                | EventKind::WorkflowContinuedAsNew { .. }
        )
    }

    /// Short human-readable form used in nondeterminism diagnostics.
    pub fn describe(&self) -> String {
        match self {
            EventKind::ActivityScheduled { name, input, .. } => format!("ActivityScheduled({name}, {input:?})"),
            EventKind::TimerStarted { fire_at_ms, .. } => format!("TimerStarted(fire_at={fire_at_ms})"),
            EventKind::ChildWorkflowScheduled { name, workflow_id, .. } => {
                format!("ChildWorkflowScheduled({name}, {workflow_id})")
            }
            EventKind::VersionGatePassed { gate } => format!("VersionGatePassed({gate})"),
            EventKind::VersionPinned { version } => format!("VersionPinned({version})"),
            other => other.name().to_string(),
        }
    }
}

/// Lifecycle status of a run as recorded in its history.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { details: ErrorDetails },
    TimedOut,
    Cancelled { reason: String },
    ContinuedAsNew { next_run_id: String, input: String },
}

impl InstanceStatus {
    /// Derive the status from a history; the log is the source of truth.
    pub fn from_history(history: &[Event]) -> Self {
        if history.is_empty() {
            return InstanceStatus::NotFound;
        }
        for e in history.iter().rev() {
            match &e.kind {
                EventKind::WorkflowCompleted { output } => return InstanceStatus::Completed { output: output.clone() },
                EventKind::WorkflowFailed { details } => return InstanceStatus::Failed { details: details.clone() },
                EventKind::WorkflowTimedOut => return InstanceStatus::TimedOut,
                EventKind::WorkflowCancelled { reason } => return InstanceStatus::Cancelled { reason: reason.clone() },
                EventKind::WorkflowContinuedAsNew { input, next_run_id } => {
                    return InstanceStatus::ContinuedAsNew {
                        next_run_id: next_run_id.clone(),
                        input: input.clone(),
                    };
                }
                _ => {}
            }
        }
        InstanceStatus::Running
    }

    pub fn kind(&self) -> Option<StatusKind> {
        match self {
            InstanceStatus::NotFound => None,
            InstanceStatus::Running => Some(StatusKind::Running),
            InstanceStatus::Completed { .. } => Some(StatusKind::Completed),
            InstanceStatus::Failed { .. } => Some(StatusKind::Failed),
            InstanceStatus::TimedOut => Some(StatusKind::TimedOut),
            InstanceStatus::Cancelled { .. } => Some(StatusKind::Cancelled),
            InstanceStatus::ContinuedAsNew { .. } => Some(StatusKind::ContinuedAsNew),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_some_and(|k| k.is_terminal())
    }

    /// Output stored alongside the status in the instance index.
    pub(crate) fn index_output(&self) -> Option<String> {
        match self {
            InstanceStatus::Completed { output } => Some(output.clone()),
            InstanceStatus::Failed { details } => Some(details.display_message()),
            InstanceStatus::Cancelled { reason } => Some(reason.clone()),
            InstanceStatus::ContinuedAsNew { next_run_id, .. } => Some(next_run_id.clone()),
            _ => None,
        }
    }
}

/// Compact status stored in the secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKind {
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    ContinuedAsNew,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Running => "Running",
            StatusKind::Completed => "Completed",
            StatusKind::Failed => "Failed",
            StatusKind::TimedOut => "TimedOut",
            StatusKind::Cancelled => "Cancelled",
            StatusKind::ContinuedAsNew => "ContinuedAsNew",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Running" => Some(StatusKind::Running),
            "Completed" => Some(StatusKind::Completed),
            "Failed" => Some(StatusKind::Failed),
            "TimedOut" => Some(StatusKind::TimedOut),
            "Cancelled" => Some(StatusKind::Cancelled),
            "ContinuedAsNew" => Some(StatusKind::ContinuedAsNew),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusKind::Running)
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration problems detected by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigErrorKind {
    UnregisteredWorkflow,
    UnregisteredActivity,
    CorruptHistory,
    Panic,
}

/// Structured failure recorded in history.
///
/// Workflow authors only ever see `Application` failures (their own errors and
/// exhausted activities). The other categories describe why the engine ended a
/// run or parked a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorDetails {
    Application { message: String },
    Nondeterminism { seq: u64, expected: String, actual: String },
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
    Timeout { message: String },
    Poison { attempts: u32, reason: String },
}

impl ErrorDetails {
    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Application { .. } => "application",
            ErrorDetails::Nondeterminism { .. } => "nondeterminism",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Infrastructure { .. } => "infrastructure",
            ErrorDetails::Timeout { .. } => "timeout",
            ErrorDetails::Poison { .. } => "poison",
        }
    }

    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { message } => message.clone(),
            ErrorDetails::Nondeterminism { seq, expected, actual } => {
                format!("nondeterministic: at seq {seq} history has {expected} but workflow produced {actual}")
            }
            ErrorDetails::Configuration { kind, resource, message } => match message {
                Some(m) => format!("{kind:?}: {resource}: {m}"),
                None => format!("{kind:?}: {resource}"),
            },
            ErrorDetails::Infrastructure { operation, message, .. } => format!("infrastructure: {operation}: {message}"),
            ErrorDetails::Timeout { message } => format!("timeout: {message}"),
            ErrorDetails::Poison { attempts, reason } => format!("poison after {attempts} attempts: {reason}"),
        }
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category(), self.display_message())
    }
}

/// Terminal failure of an activity after its retry policy was exhausted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("activity {activity} failed after {attempts} attempt(s): {message}")]
pub struct ActivityFailure {
    pub activity: String,
    pub message: String,
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::_typed_codec::{Codec, Json};

    fn ev(seq: u64, kind: EventKind) -> Event {
        Event {
            seq,
            timestamp_ms: seq,
            kind,
        }
    }

    #[test]
    fn status_is_derived_from_last_terminal_event() {
        let started = EventKind::WorkflowStarted {
            name: "w".into(),
            version: None,
            input: String::new(),
            parent: None,
            execution_timeout_ms: None,
        };
        assert_eq!(InstanceStatus::from_history(&[]), InstanceStatus::NotFound);
        assert_eq!(
            InstanceStatus::from_history(&[ev(1, started.clone())]),
            InstanceStatus::Running
        );
        let done = [
            ev(1, started),
            ev(2, EventKind::ActivationCompleted),
            ev(3, EventKind::WorkflowCompleted { output: "ok".into() }),
        ];
        let status = InstanceStatus::from_history(&done);
        assert_eq!(status, InstanceStatus::Completed { output: "ok".into() });
        assert!(status.is_terminal());
        assert_eq!(status.kind(), Some(StatusKind::Completed));
    }

    #[test]
    fn decisions_and_inputs_are_classified() {
        assert!(EventKind::ActivationCompleted.is_decision());
        assert!(EventKind::WorkflowTimedOut.is_decision());
        assert!(
            !EventKind::SignalReceived {
                name: "s".into(),
                payload: String::new()
            }
            .is_decision()
        );
        assert!(
            !EventKind::TimerFired {
                started_seq: 3,
                fire_at_ms: 0
            }
            .is_decision()
        );
    }

    #[test]
    fn status_kind_round_trips_through_its_index_string() {
        for k in [
            StatusKind::Running,
            StatusKind::Completed,
            StatusKind::Failed,
            StatusKind::TimedOut,
            StatusKind::Cancelled,
            StatusKind::ContinuedAsNew,
        ] {
            assert_eq!(StatusKind::parse(k.as_str()), Some(k));
        }
        assert_eq!(StatusKind::parse("Suspended"), None);
    }

    #[test]
    fn nondeterminism_message_names_both_sides() {
        let d = ErrorDetails::Nondeterminism {
            seq: 4,
            expected: "ActivityScheduled(a, \"x\")".into(),
            actual: "TimerStarted(fire_at=5)".into(),
        };
        let msg = d.display_message();
        assert!(msg.contains("nondeterministic"));
        assert!(msg.contains("seq 4"));
        assert_eq!(d.category(), "nondeterminism");
    }

    #[test]
    fn json_codec_keeps_plain_strings_unquoted() {
        assert_eq!(Json::encode(&"hello").unwrap(), "hello");
        assert_eq!(Json::encode(&serde_json::json!({"amount": 100})).unwrap(), r#"{"amount":100}"#);
        let s: String = Json::decode("hello").unwrap();
        assert_eq!(s, "hello");
        let n: u32 = Json::decode("42").unwrap();
        assert_eq!(n, 42);
    }

    #[test]
    fn ownership_key_ignores_run_id() {
        let a = InstanceId::new("ns", "wf", "r1");
        let b = a.with_run("r2");
        assert_eq!(a.ownership_key(), b.ownership_key());
        assert_ne!(a.lease_key(), b.lease_key());
        assert_eq!(a.to_string(), "ns/wf/r1");
    }
}
