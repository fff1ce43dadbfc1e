//! Deterministic replay.
//!
//! The engine is a fold over the full history on every activation. History is
//! split into committed segments, each one the inputs an earlier activation
//! saw, its `ActivationCompleted` marker and the decisions it recorded:
//!
//! ```text
//! [WorkflowStarted, inputs..] M [decisions..] [inputs..] M [decisions..] ... [tail inputs..]
//! ```
//!
//! Each segment is re-run exactly as it originally ran: its inputs are
//! delivered, the workflow is polled, and every command it emits must equal
//! the next recorded decision. The unprocessed tail is then delivered and the
//! commands the workflow emits become this activation's new decisions.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::task::{ArcWake, waker};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::WorkflowHandler;
use super::limits::MAX_POLLS_PER_SEGMENT;
use super::registry::WorkflowRegistry;
use crate::context::{CtxState, WorkflowContext};
use crate::{ConfigErrorKind, ErrorDetails, Event, EventKind, InstanceId, StatusKind};

/// Operation a suspended workflow is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outstanding {
    Activity { seq: u64, name: String },
    Timer { seq: u64, fire_at_ms: u64 },
    Signal { name: String },
    ChildWorkflow { seq: u64, workflow_id: String },
}

/// Where a workflow stopped: history consumed so far plus what it awaits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    pub consumed_seq: u64,
    pub outstanding: Vec<Outstanding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowState {
    Suspended(Continuation),
    Terminal(StatusKind),
}

/// New decisions produced by one activation, in append order.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub events: Vec<EventKind>,
    pub state: WorkflowState,
    /// Version explicitly requested by `continue_as_new_versioned`.
    pub continue_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    /// The history ends in a decision block; there is nothing to react to.
    NoNewEvents,
    Decisions(Activation),
    /// The pinned version is not registered in this process.
    HandlerMissing { name: String, version: String },
    AlreadyTerminal(StatusKind),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    /// History violates the log invariants; never retried.
    #[error("corrupt history for {instance}: {reason}")]
    CorruptHistory { instance: InstanceId, reason: String },
    #[error("workflow {name}@{version} is not registered")]
    HandlerMissing { name: String, version: String },
    #[error("{0}")]
    Diverged(ErrorDetails),
}

struct Started<'h> {
    name: &'h str,
    version: Option<&'h str>,
    input: &'h str,
    started_ms: u64,
    execution_timeout_ms: Option<u64>,
}

struct Segment<'h> {
    inputs: Vec<&'h Event>,
    marker: &'h Event,
    decisions: Vec<&'h Event>,
}

struct History<'h> {
    events: &'h [Event],
    started: Started<'h>,
    segments: Vec<Segment<'h>>,
    tail: Vec<&'h Event>,
    terminal: Option<&'h Event>,
}

impl<'h> History<'h> {
    fn parse(instance: &InstanceId, events: &'h [Event]) -> Result<Self, ReplayError> {
        let corrupt = |reason: String| ReplayError::CorruptHistory {
            instance: instance.clone(),
            reason,
        };
        let started = match events.first() {
            Some(Event {
                seq: 1,
                timestamp_ms,
                kind:
                    EventKind::WorkflowStarted {
                        name,
                        version,
                        input,
                        execution_timeout_ms,
                        ..
                    },
            }) => Started {
                name,
                version: version.as_deref(),
                input,
                started_ms: *timestamp_ms,
                execution_timeout_ms: *execution_timeout_ms,
            },
            Some(first) => return Err(corrupt(format!("first event is {} at seq {}", first.kind.name(), first.seq))),
            None => return Err(corrupt("empty history".to_string())),
        };
        for (i, e) in events.iter().enumerate() {
            if e.seq != i as u64 + 1 {
                return Err(corrupt(format!("expected seq {} but found {}", i + 1, e.seq)));
            }
        }

        let mut segments = Vec::new();
        let mut inputs = Vec::new();
        let mut terminal = None;
        let mut iter = events.iter().peekable();
        while let Some(e) = iter.next() {
            if e.kind.is_terminal() {
                terminal = Some(e);
                continue;
            }
            if matches!(e.kind, EventKind::ActivationCompleted) {
                let mut decisions = Vec::new();
                while let Some(next) = iter.peek() {
                    if next.kind.is_decision()
                        && !next.kind.is_terminal()
                        && !matches!(next.kind, EventKind::ActivationCompleted)
                    {
                        decisions.push(*next);
                        iter.next();
                    } else {
                        break;
                    }
                }
                segments.push(Segment {
                    inputs: std::mem::take(&mut inputs),
                    marker: e,
                    decisions,
                });
            } else if e.kind.is_decision() {
                return Err(corrupt(format!("{} at seq {} outside a decision block", e.kind.name(), e.seq)));
            } else {
                inputs.push(e);
            }
        }

        Ok(Self {
            events,
            started,
            segments,
            tail: inputs,
            terminal,
        })
    }

    /// Logical time seen by the activation that wrote `marker`.
    fn time_before(&self, marker: &Event) -> u64 {
        // seq n lives at index n - 1; the marker is never seq 1
        self.events
            .get(marker.seq.saturating_sub(2) as usize)
            .map_or(marker.timestamp_ms, |e| e.timestamp_ms)
    }

    fn pinned_version(&self) -> Option<&'h str> {
        self.events.iter().find_map(|e| match &e.kind {
            EventKind::VersionPinned { version } => Some(version.as_str()),
            _ => None,
        })
    }

    fn last(&self) -> &'h Event {
        // parse guarantees at least WorkflowStarted
        &self.events[self.events.len() - 1]
    }
}

struct WakeFlag(AtomicBool);

impl ArcWake for WakeFlag {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.store(true, Ordering::SeqCst);
    }
}

type WorkflowFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

/// One in-memory execution of a workflow over a history.
struct Execution<'a> {
    ctx: WorkflowContext,
    future: WorkflowFuture<'a>,
    flag: Arc<WakeFlag>,
    finished: Option<Result<String, String>>,
}

impl<'a> Execution<'a> {
    fn new(handler: &'a Arc<dyn WorkflowHandler>, ctx: WorkflowContext, input: String) -> Self {
        let future = handler.invoke(ctx.clone(), input);
        Self {
            ctx,
            future,
            flag: Arc::new(WakeFlag(AtomicBool::new(false))),
            finished: None,
        }
    }

    fn deliver(&self, inputs: &[&Event]) {
        let wakers = {
            let mut st = self.ctx.lock();
            for e in inputs {
                st.deliver(&e.kind);
            }
            st.take_wakers()
        };
        for w in wakers {
            w.wake();
        }
    }

    /// Poll until the workflow finishes or stops making progress.
    fn drive(&mut self) -> Result<(), String> {
        if self.finished.is_some() {
            return Ok(());
        }
        let waker = waker(self.flag.clone());
        let mut cx = Context::from_waker(&waker);
        for _ in 0..MAX_POLLS_PER_SEGMENT {
            self.flag.0.store(false, Ordering::SeqCst);
            let polled = catch_unwind(AssertUnwindSafe(|| self.future.as_mut().poll(&mut cx)));
            match polled {
                Err(payload) => return Err(panic_message(payload.as_ref())),
                Ok(Poll::Ready(result)) => {
                    self.finished = Some(result);
                    return Ok(());
                }
                Ok(Poll::Pending) => {}
            }
            if self.ctx.lock().divergence.is_some() || !self.flag.0.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "workflow panicked".to_string()
    }
}

/// Close the run: the activation's marker followed by `WorkflowFailed`, and
/// none of the commands the workflow emitted.
fn failed(details: ErrorDetails) -> ReplayOutcome {
    ReplayOutcome::Decisions(Activation {
        events: vec![EventKind::ActivationCompleted, EventKind::WorkflowFailed { details }],
        state: WorkflowState::Terminal(StatusKind::Failed),
        continue_version: None,
    })
}

fn terminal_kind(kind: &EventKind) -> StatusKind {
    match kind {
        EventKind::WorkflowCompleted { .. } => StatusKind::Completed,
        EventKind::WorkflowTimedOut => StatusKind::TimedOut,
        EventKind::WorkflowCancelled { .. } => StatusKind::Cancelled,
        EventKind::WorkflowContinuedAsNew { .. } => StatusKind::ContinuedAsNew,
        _ => StatusKind::Failed,
    }
}

pub struct ReplayEngine<'r> {
    workflows: &'r WorkflowRegistry,
}

impl<'r> ReplayEngine<'r> {
    pub fn new(workflows: &'r WorkflowRegistry) -> Self {
        Self { workflows }
    }

    /// Run one activation over `history` and return the decisions to append.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::CorruptHistory`] when the log breaks its invariants.
    pub fn activate(&self, instance: &InstanceId, history: &[Event]) -> Result<ReplayOutcome, ReplayError> {
        let hist = History::parse(instance, history)?;
        if let Some(t) = hist.terminal {
            return Ok(ReplayOutcome::AlreadyTerminal(terminal_kind(&t.kind)));
        }
        if hist.tail.is_empty() {
            return Ok(ReplayOutcome::NoNewEvents);
        }

        let name = hist.started.name;
        let first_activation = hist.segments.is_empty();
        let (version, handler) = match self.resolve(&hist) {
            Resolved::Found(v, h) => (v, h),
            Resolved::Missing(version) if !first_activation => {
                return Ok(ReplayOutcome::HandlerMissing {
                    name: name.to_string(),
                    version,
                });
            }
            Resolved::Missing(version) => {
                return Ok(failed(ErrorDetails::Configuration {
                    kind: ConfigErrorKind::UnregisteredWorkflow,
                    resource: name.to_string(),
                    message: Some(format!("version {version} is not registered")),
                }));
            }
        };

        debug!(
            target: "duraflow::runtime::replay",
            instance = %instance,
            workflow = %name,
            version = %version,
            segments = hist.segments.len(),
            tail = hist.tail.len(),
            "activation replay"
        );

        let ctx = WorkflowContext::new(CtxState::new(instance.clone(), name.to_string(), version.to_string()));
        let mut exec = Execution::new(&handler, ctx.clone(), hist.started.input.to_string());

        if let Err(outcome) = self.replay_segments(&hist, &mut exec, &version, false) {
            return Ok(outcome);
        }

        let last = hist.last();
        ctx.lock().begin_live(last.timestamp_ms, last.seq + 2);
        exec.deliver(&hist.tail);
        if first_activation {
            self.preamble(&hist, &ctx, &version);
        }
        if let Err(message) = exec.drive() {
            return Ok(failed(panicked(name, message)));
        }

        let mut st = ctx.lock();
        let mut events = vec![EventKind::ActivationCompleted];
        events.extend(st.take_emitted());
        let mut continue_version = None;
        let terminal = if let Some((input, version)) = st.continue_as_new.take() {
            continue_version = version;
            Some(EventKind::WorkflowContinuedAsNew {
                input,
                next_run_id: uuid::Uuid::new_v4().to_string(),
            })
        } else if let Some(result) = exec.finished.clone() {
            Some(match result {
                Ok(output) => EventKind::WorkflowCompleted { output },
                Err(message) => EventKind::WorkflowFailed {
                    details: ErrorDetails::Application { message },
                },
            })
        } else if st.execution_timed_out {
            Some(EventKind::WorkflowTimedOut)
        } else if st.cancel_delivered_now && !st.cancel_observed {
            Some(EventKind::WorkflowCancelled {
                reason: st.cancel_reason().unwrap_or_default().to_string(),
            })
        } else {
            None
        };

        let state = match &terminal {
            Some(kind) => WorkflowState::Terminal(terminal_kind(kind)),
            None => WorkflowState::Suspended(st.continuation(last.seq + events.len() as u64)),
        };
        events.extend(terminal);
        Ok(ReplayOutcome::Decisions(Activation {
            events,
            state,
            continue_version,
        }))
    }

    /// Replay every committed segment and return the published query value.
    /// Decisions not yet committed (the tail) are not reflected.
    ///
    /// # Errors
    ///
    /// Fails on corrupt history, a missing handler, or divergence.
    pub fn query(&self, instance: &InstanceId, history: &[Event], name: &str) -> Result<Option<String>, ReplayError> {
        let hist = History::parse(instance, history)?;
        let (version, handler) = match self.resolve(&hist) {
            Resolved::Found(v, h) => (v, h),
            Resolved::Missing(version) => {
                return Err(ReplayError::HandlerMissing {
                    name: hist.started.name.to_string(),
                    version,
                });
            }
        };
        let ctx = WorkflowContext::new(CtxState::new(
            instance.clone(),
            hist.started.name.to_string(),
            version.to_string(),
        ));
        let mut exec = Execution::new(&handler, ctx.clone(), hist.started.input.to_string());
        if let Err(outcome) = self.replay_segments(&hist, &mut exec, &version, true) {
            return Err(match outcome {
                ReplayOutcome::Decisions(Activation { mut events, .. }) => match events.pop() {
                    Some(EventKind::WorkflowFailed { details }) => ReplayError::Diverged(details),
                    _ => ReplayError::CorruptHistory {
                        instance: instance.clone(),
                        reason: "replay stopped".to_string(),
                    },
                },
                _ => ReplayError::CorruptHistory {
                    instance: instance.clone(),
                    reason: "replay stopped".to_string(),
                },
            });
        }
        let value = ctx.lock().query_state.get(name).cloned();
        Ok(value)
    }

    fn resolve(&self, hist: &History<'_>) -> Resolved {
        let name = hist.started.name;
        let wanted = hist.pinned_version().or(hist.started.version);
        match wanted {
            Some(v) => match Version::parse(v) {
                Ok(parsed) => match self.workflows.resolve_exact(name, &parsed) {
                    Some(h) => Resolved::Found(parsed, h),
                    None => Resolved::Missing(v.to_string()),
                },
                Err(_) => Resolved::Missing(v.to_string()),
            },
            None => match self.workflows.resolve_handler(name) {
                Some((v, h)) => Resolved::Found(v, h),
                None => Resolved::Missing("latest".to_string()),
            },
        }
    }

    /// Decisions the engine itself takes before the first poll of a run.
    fn preamble(&self, hist: &History<'_>, ctx: &WorkflowContext, version: &Version) {
        let mut st = ctx.lock();
        st.record(EventKind::VersionPinned {
            version: version.to_string(),
        });
        if let Some(timeout_ms) = hist.started.execution_timeout_ms {
            let (seq, _) = st.record(EventKind::TimerStarted {
                fire_at_ms: hist.started.started_ms + timeout_ms,
                execution_timeout: true,
            });
            st.mark_execution_timer(seq);
        }
    }

    /// Re-run committed segments. On divergence returns the outcome that ends the run.
    fn replay_segments(
        &self,
        hist: &History<'_>,
        exec: &mut Execution<'_>,
        version: &Version,
        read_only: bool,
    ) -> Result<(), ReplayOutcome> {
        let name = hist.started.name;
        for (k, seg) in hist.segments.iter().enumerate() {
            exec.ctx
                .lock()
                .begin_replay(hist.time_before(seg.marker), seg.marker.seq, &seg.decisions);
            exec.deliver(&seg.inputs);
            if k == 0 {
                self.preamble(hist, &exec.ctx, version);
            }
            if let Err(message) = exec.drive() {
                return Err(failed(panicked(name, message)));
            }

            let mut st = exec.ctx.lock();
            if let Some(details) = st.divergence.take() {
                return Err(failed(details));
            }
            if let Some((seq, expected)) = st.leftover() {
                return Err(failed(ErrorDetails::Nondeterminism {
                    seq,
                    expected,
                    actual: "no further decision".to_string(),
                }));
            }
            if read_only {
                continue;
            }
            // A run that ended here originally would already be terminal.
            let ended = if st.continue_as_new.is_some() {
                Some("WorkflowContinuedAsNew")
            } else if exec.finished.is_some() {
                Some("WorkflowCompleted")
            } else if st.execution_timed_out {
                Some("WorkflowTimedOut")
            } else if st.cancel_delivered_now && !st.cancel_observed {
                Some("WorkflowCancelled")
            } else {
                None
            };
            if let Some(actual) = ended {
                let seq = st.segment_end_seq();
                let expected = hist
                    .events
                    .get(seq as usize - 1)
                    .map_or_else(|| "end of history".to_string(), |e| e.kind.describe());
                return Err(failed(ErrorDetails::Nondeterminism {
                    seq,
                    expected,
                    actual: actual.to_string(),
                }));
            }
        }
        Ok(())
    }
}

enum Resolved {
    Found(Version, Arc<dyn WorkflowHandler>),
    Missing(String),
}

fn panicked(name: &str, message: String) -> ErrorDetails {
    ErrorDetails::Configuration {
        kind: ConfigErrorKind::Panic,
        resource: name.to_string(),
        message: Some(message),
    }
}

/// Decisions recorded per activation marker, for diagnostics and tests.
pub fn decisions_by_activation(history: &[Event]) -> HashMap<u64, Vec<EventKind>> {
    let mut out: HashMap<u64, Vec<EventKind>> = HashMap::new();
    let mut current = None;
    for e in history {
        match &e.kind {
            EventKind::ActivationCompleted => {
                current = Some(e.seq);
                out.entry(e.seq).or_default();
            }
            k if k.is_decision() => {
                if let Some(marker) = current {
                    out.entry(marker).or_default().push(k.clone());
                }
            }
            _ => current = None,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetryPolicy;

    fn ev(seq: u64, kind: EventKind) -> Event {
        Event {
            seq,
            timestamp_ms: 1_000 + seq,
            kind,
        }
    }

    fn started(name: &str) -> EventKind {
        EventKind::WorkflowStarted {
            name: name.into(),
            version: None,
            input: "100".into(),
            parent: None,
            execution_timeout_ms: None,
        }
    }

    fn charge_registry() -> WorkflowRegistry {
        WorkflowRegistry::builder()
            .register("pay", |ctx: WorkflowContext, amount: String| async move {
                let receipt = ctx
                    .schedule_activity_with_retry("charge", amount, RetryPolicy::new(3))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(format!("paid:{receipt}"))
            })
            .build()
    }

    fn id() -> InstanceId {
        InstanceId::new("ns", "wf", "r1")
    }

    fn apply(history: &mut Vec<Event>, events: Vec<EventKind>) {
        for kind in events {
            let seq = history.len() as u64 + 1;
            history.push(ev(seq, kind));
        }
    }

    #[test]
    fn first_activation_pins_version_and_schedules() {
        let reg = charge_registry();
        let engine = ReplayEngine::new(&reg);
        let history = vec![ev(1, started("pay"))];
        let ReplayOutcome::Decisions(act) = engine.activate(&id(), &history).unwrap() else {
            panic!("expected decisions");
        };
        assert_eq!(act.events[0], EventKind::ActivationCompleted);
        assert_eq!(
            act.events[1],
            EventKind::VersionPinned {
                version: "1.0.0".into()
            }
        );
        assert!(matches!(&act.events[2], EventKind::ActivityScheduled { name, .. } if name == "charge"));
        match act.state {
            WorkflowState::Suspended(c) => {
                assert_eq!(c.consumed_seq, 4);
                assert_eq!(
                    c.outstanding,
                    vec![Outstanding::Activity {
                        seq: 4,
                        name: "charge".into()
                    }]
                );
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn completion_replays_and_finishes() {
        let reg = charge_registry();
        let engine = ReplayEngine::new(&reg);
        let mut history = vec![ev(1, started("pay"))];
        let ReplayOutcome::Decisions(act) = engine.activate(&id(), &history).unwrap() else {
            panic!()
        };
        apply(&mut history, act.events);
        assert_eq!(engine.activate(&id(), &history).unwrap(), ReplayOutcome::NoNewEvents);

        apply(
            &mut history,
            vec![EventKind::ActivityCompleted {
                scheduled_seq: 4,
                result: "r-1".into(),
            }],
        );
        let ReplayOutcome::Decisions(act) = engine.activate(&id(), &history).unwrap() else {
            panic!()
        };
        assert_eq!(
            act.events,
            vec![
                EventKind::ActivationCompleted,
                EventKind::WorkflowCompleted {
                    output: "paid:r-1".into()
                }
            ]
        );
        apply(&mut history, act.events);
        assert_eq!(
            engine.activate(&id(), &history).unwrap(),
            ReplayOutcome::AlreadyTerminal(StatusKind::Completed)
        );
    }

    #[test]
    fn changed_code_fails_with_nondeterminism() {
        let reg = charge_registry();
        let mut history = vec![ev(1, started("pay"))];
        let ReplayOutcome::Decisions(act) = ReplayEngine::new(&reg).activate(&id(), &history).unwrap() else {
            panic!()
        };
        apply(&mut history, act.events);
        apply(&mut history, vec![EventKind::SignalReceived { name: "x".into(), payload: String::new() }]);

        let changed = WorkflowRegistry::builder()
            .register("pay", |ctx: WorkflowContext, amount: String| async move {
                ctx.schedule_timer(std::time::Duration::from_secs(1)).await;
                ctx.schedule_activity("charge", amount).await.map_err(|e| e.to_string())
            })
            .build();
        let ReplayOutcome::Decisions(act) = ReplayEngine::new(&changed).activate(&id(), &history).unwrap() else {
            panic!()
        };
        assert_eq!(act.state, WorkflowState::Terminal(StatusKind::Failed));
        assert_eq!(act.events.len(), 2);
        assert_eq!(act.events[0], EventKind::ActivationCompleted);
        match &act.events[1] {
            EventKind::WorkflowFailed {
                details: ErrorDetails::Nondeterminism { seq, expected, actual },
            } => {
                assert_eq!(*seq, 4);
                assert!(expected.contains("charge"));
                assert!(actual.contains("TimerStarted"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn gap_in_sequence_is_corrupt() {
        let reg = charge_registry();
        let history = vec![ev(1, started("pay")), ev(3, EventKind::ActivationCompleted)];
        assert!(matches!(
            ReplayEngine::new(&reg).activate(&id(), &history),
            Err(ReplayError::CorruptHistory { .. })
        ));
    }

    #[test]
    fn unregistered_workflow_fails_first_activation() {
        let reg = charge_registry();
        let history = vec![ev(1, started("missing"))];
        let ReplayOutcome::Decisions(act) = ReplayEngine::new(&reg).activate(&id(), &history).unwrap() else {
            panic!()
        };
        assert_eq!(act.events[0], EventKind::ActivationCompleted);
        assert!(matches!(
            &act.events[1],
            EventKind::WorkflowFailed {
                details: ErrorDetails::Configuration {
                    kind: ConfigErrorKind::UnregisteredWorkflow,
                    ..
                }
            }
        ));
    }

    #[test]
    fn decisions_group_under_their_marker() {
        let history = vec![
            ev(1, started("pay")),
            ev(2, EventKind::ActivationCompleted),
            ev(3, EventKind::VersionPinned { version: "1.0.0".into() }),
            ev(4, EventKind::SideEffectRecorded { value: "1".into() }),
            ev(5, EventKind::SignalReceived { name: "s".into(), payload: String::new() }),
        ];
        let grouped = decisions_by_activation(&history);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[&2].len(), 2);
    }
}
