//! The handle workflow code receives, and the futures it awaits.
//!
//! Every method that takes a decision records a command with the engine at
//! call time. While the engine replays a recorded segment each command is
//! matched against the decision history holds at that position; once replay
//! reaches the unprocessed tail commands become new decisions. Results come
//! only from delivered history events, never from the outside world, so the
//! same history always drives the same code path.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::_typed_codec::{Codec, Json};
use crate::runtime::replay_engine::{Continuation, Outstanding};
use crate::{ActivityFailure, ErrorDetails, Event, EventKind, InstanceId, RetryPolicy};

/// Sequence handed to futures created after replay diverged; nothing resolves it.
const DIVERGED: u64 = u64::MAX;

/// Whether a recorded decision and a freshly emitted command are the same decision.
///
/// Activities match on name and input, children on name and workflow id,
/// timers and side effects on kind alone (the recorded fire time and value win).
pub(crate) fn decision_matches(recorded: &EventKind, emitted: &EventKind) -> bool {
    match (recorded, emitted) {
        (
            EventKind::ActivityScheduled { name: a, input: ai, .. },
            EventKind::ActivityScheduled { name: b, input: bi, .. },
        ) => a == b && ai == bi,
        (
            EventKind::TimerStarted { execution_timeout: a, .. },
            EventKind::TimerStarted { execution_timeout: b, .. },
        ) => a == b,
        (
            EventKind::ChildWorkflowScheduled { name: a, workflow_id: wa, .. },
            EventKind::ChildWorkflowScheduled { name: b, workflow_id: wb, .. },
        ) => a == b && wa == wb,
        (EventKind::SideEffectRecorded { .. }, EventKind::SideEffectRecorded { .. }) => true,
        (EventKind::VersionPinned { .. }, EventKind::VersionPinned { .. }) => true,
        (EventKind::VersionGatePassed { gate: a }, EventKind::VersionGatePassed { gate: b }) => a == b,
        _ => false,
    }
}

/// Per-activation workflow state shared by the context and its futures.
pub(crate) struct CtxState {
    instance: InstanceId,
    workflow_name: String,
    version: String,
    now_ms: u64,
    replaying: bool,

    // Decisions of the segment being replayed, in order.
    recorded: VecDeque<(u64, EventKind)>,
    // Seq the next decision would occupy in the segment being replayed.
    segment_end_seq: u64,
    next_live_seq: u64,
    emitted: Vec<EventKind>,
    pub(crate) divergence: Option<ErrorDetails>,

    activity_names: HashMap<u64, String>,
    activity_results: HashMap<u64, Result<String, ActivityFailure>>,
    fired_timers: HashSet<u64>,
    child_results: HashMap<u64, Result<String, String>>,
    signals: HashMap<String, Vec<String>>,
    signal_waits: BTreeMap<String, usize>,
    outstanding: BTreeMap<u64, Outstanding>,

    cancel_reason: Option<String>,
    pub(crate) cancel_delivered_now: bool,
    pub(crate) cancel_observed: bool,
    execution_timer: Option<u64>,
    pub(crate) execution_timed_out: bool,

    gates: HashMap<String, bool>,
    pub(crate) query_state: BTreeMap<String, String>,
    pub(crate) continue_as_new: Option<(String, Option<String>)>,
    wakers: Vec<Waker>,
}

impl CtxState {
    pub(crate) fn new(instance: InstanceId, workflow_name: String, version: String) -> Self {
        Self {
            instance,
            workflow_name,
            version,
            now_ms: 0,
            replaying: true,
            recorded: VecDeque::new(),
            segment_end_seq: 0,
            next_live_seq: 0,
            emitted: Vec::new(),
            divergence: None,
            activity_names: HashMap::new(),
            activity_results: HashMap::new(),
            fired_timers: HashSet::new(),
            child_results: HashMap::new(),
            signals: HashMap::new(),
            signal_waits: BTreeMap::new(),
            outstanding: BTreeMap::new(),
            cancel_reason: None,
            cancel_delivered_now: false,
            cancel_observed: false,
            execution_timer: None,
            execution_timed_out: false,
            gates: HashMap::new(),
            query_state: BTreeMap::new(),
            continue_as_new: None,
            wakers: Vec::new(),
        }
    }

    /// Enter a recorded segment whose decisions start right after `marker_seq`.
    pub(crate) fn begin_replay(&mut self, now_ms: u64, marker_seq: u64, decisions: &[&Event]) {
        self.replaying = true;
        self.now_ms = now_ms;
        self.recorded = decisions.iter().map(|e| (e.seq, e.kind.clone())).collect();
        self.segment_end_seq = marker_seq + decisions.len() as u64 + 1;
        self.cancel_delivered_now = false;
    }

    /// Enter live mode; new decisions take sequence numbers from `next_seq`.
    pub(crate) fn begin_live(&mut self, now_ms: u64, next_seq: u64) {
        self.replaying = false;
        self.now_ms = now_ms;
        self.recorded.clear();
        self.next_live_seq = next_seq;
        self.cancel_delivered_now = false;
    }

    /// Feed one input event to the workflow's pending operations.
    pub(crate) fn deliver(&mut self, kind: &EventKind) {
        match kind {
            EventKind::ActivityCompleted { scheduled_seq, result } => {
                self.outstanding.remove(scheduled_seq);
                self.activity_results
                    .entry(*scheduled_seq)
                    .or_insert_with(|| Ok(result.clone()));
            }
            EventKind::ActivityFailed {
                scheduled_seq,
                details,
                attempts,
            } => {
                self.outstanding.remove(scheduled_seq);
                let activity = self
                    .activity_names
                    .get(scheduled_seq)
                    .cloned()
                    .unwrap_or_else(|| format!("activity@{scheduled_seq}"));
                self.activity_results.entry(*scheduled_seq).or_insert_with(|| {
                    Err(ActivityFailure {
                        activity,
                        message: details.display_message(),
                        attempts: *attempts,
                    })
                });
            }
            EventKind::TimerFired { started_seq, .. } => {
                self.outstanding.remove(started_seq);
                self.fired_timers.insert(*started_seq);
                if self.execution_timer == Some(*started_seq) {
                    self.execution_timed_out = true;
                }
            }
            EventKind::SignalReceived { name, payload } => {
                self.signals.entry(name.clone()).or_default().push(payload.clone());
            }
            EventKind::CancelRequested { reason } => {
                if self.cancel_reason.is_none() {
                    self.cancel_reason = Some(reason.clone());
                    self.cancel_delivered_now = true;
                }
            }
            EventKind::ChildWorkflowCompleted { scheduled_seq, result } => {
                self.outstanding.remove(scheduled_seq);
                self.child_results
                    .entry(*scheduled_seq)
                    .or_insert_with(|| Ok(result.clone()));
            }
            EventKind::ChildWorkflowFailed { scheduled_seq, details } => {
                self.outstanding.remove(scheduled_seq);
                self.child_results
                    .entry(*scheduled_seq)
                    .or_insert_with(|| Err(details.display_message()));
            }
            _ => {}
        }
    }

    /// Record a command, returning its sequence number and the authoritative
    /// decision (the recorded one during replay).
    pub(crate) fn record(&mut self, command: EventKind) -> (u64, EventKind) {
        if self.divergence.is_some() {
            return (DIVERGED, command);
        }
        if !self.replaying {
            let seq = self.next_live_seq;
            self.next_live_seq += 1;
            self.emitted.push(command.clone());
            return (seq, command);
        }
        match self.recorded.pop_front() {
            Some((seq, recorded)) if decision_matches(&recorded, &command) => (seq, recorded),
            Some((seq, recorded)) => {
                self.diverge(seq, recorded.describe(), command.describe());
                (DIVERGED, command)
            }
            None => {
                let seq = self.segment_end_seq;
                self.diverge(seq, "no further decision".to_string(), command.describe());
                (DIVERGED, command)
            }
        }
    }

    pub(crate) fn diverge(&mut self, seq: u64, expected: String, actual: String) {
        if self.divergence.is_none() {
            self.divergence = Some(ErrorDetails::Nondeterminism { seq, expected, actual });
        }
    }

    /// Recorded decisions the workflow did not reproduce in this segment.
    pub(crate) fn leftover(&self) -> Option<(u64, String)> {
        self.recorded.front().map(|(seq, kind)| (*seq, kind.describe()))
    }

    pub(crate) fn segment_end_seq(&self) -> u64 {
        self.segment_end_seq
    }

    pub(crate) fn take_emitted(&mut self) -> Vec<EventKind> {
        std::mem::take(&mut self.emitted)
    }

    pub(crate) fn take_wakers(&mut self) -> Vec<Waker> {
        std::mem::take(&mut self.wakers)
    }

    pub(crate) fn mark_execution_timer(&mut self, seq: u64) {
        if seq != DIVERGED {
            self.execution_timer = Some(seq);
        }
    }

    pub(crate) fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    fn park(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|w| w.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }

    fn track(&mut self, seq: u64, op: Outstanding) {
        if seq != DIVERGED {
            self.outstanding.insert(seq, op);
        }
    }

    /// Suspension point after all of history up to `consumed_seq` was applied.
    pub(crate) fn continuation(&self, consumed_seq: u64) -> Continuation {
        let mut outstanding: Vec<Outstanding> = self.outstanding.values().cloned().collect();
        for (name, waits) in &self.signal_waits {
            let delivered = self.signals.get(name).map_or(0, Vec::len);
            if *waits > delivered {
                outstanding.push(Outstanding::Signal { name: name.clone() });
            }
        }
        Continuation {
            consumed_seq,
            outstanding,
        }
    }
}

/// Deterministic handle to the running workflow.
///
/// Cheap to clone; every clone refers to the same activation.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<Mutex<CtxState>>,
}

impl WorkflowContext {
    pub(crate) fn new(state: CtxState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn instance(&self) -> InstanceId {
        self.lock().instance.clone()
    }

    pub fn workflow_name(&self) -> String {
        self.lock().workflow_name.clone()
    }

    /// Version of the workflow code this run is pinned to.
    pub fn version(&self) -> String {
        self.lock().version.clone()
    }

    /// True while the engine re-executes decisions already in history.
    pub fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    /// Logical time: the persisted timestamp of the last event the current
    /// activation observed. Never the wall clock.
    pub fn now_ms(&self) -> u64 {
        self.lock().now_ms
    }

    pub fn utc_now(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.now_ms())
    }

    /// Schedule an activity with a single attempt.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> ActivityFuture {
        self.schedule_activity_with_retry(name, input, RetryPolicy::none())
    }

    /// Schedule an activity; retries happen in the worker pool, and the future
    /// resolves once with the single recorded outcome.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        retry: RetryPolicy,
    ) -> ActivityFuture {
        let name = name.into();
        let mut st = self.lock();
        let (seq, _) = st.record(EventKind::ActivityScheduled {
            name: name.clone(),
            input: input.into(),
            retry,
        });
        st.track(seq, Outstanding::Activity { seq, name: name.clone() });
        if seq != DIVERGED {
            st.activity_names.insert(seq, name);
        }
        drop(st);
        ActivityFuture { ctx: self.clone(), seq }
    }

    pub fn schedule_activity_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
        retry: RetryPolicy,
    ) -> BoxFuture<'static, Result<Out, ActivityFailure>>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let name = name.into();
        let pending = Json::encode(input).map(|s| self.schedule_activity_with_retry(name.clone(), s, retry));
        Box::pin(async move {
            let raw = match pending {
                Ok(fut) => fut.await?,
                Err(message) => {
                    return Err(ActivityFailure {
                        activity: name,
                        message,
                        attempts: 0,
                    });
                }
            };
            Json::decode::<Out>(&raw).map_err(|message| ActivityFailure {
                activity: name,
                message,
                attempts: 0,
            })
        })
    }

    /// Durable timer relative to logical time.
    pub fn schedule_timer(&self, delay: Duration) -> TimerFuture {
        let mut st = self.lock();
        let fire_at_ms = st.now_ms + delay.as_millis() as u64;
        let (seq, recorded) = st.record(EventKind::TimerStarted {
            fire_at_ms,
            execution_timeout: false,
        });
        let fire_at_ms = match recorded {
            EventKind::TimerStarted { fire_at_ms, .. } => fire_at_ms,
            _ => fire_at_ms,
        };
        st.track(seq, Outstanding::Timer { seq, fire_at_ms });
        drop(st);
        TimerFuture { ctx: self.clone(), seq }
    }

    /// Wait for the next signal named `name` not yet claimed by an earlier wait.
    pub fn wait_for_signal(&self, name: impl Into<String>) -> SignalFuture {
        let name = name.into();
        let mut st = self.lock();
        let slot = st.signal_waits.entry(name.clone()).or_insert(0);
        let index = *slot;
        *slot += 1;
        drop(st);
        SignalFuture {
            ctx: self.clone(),
            name,
            index,
        }
    }

    /// Start a child workflow in the same namespace under `workflow_id`.
    pub fn start_child_workflow(
        &self,
        name: impl Into<String>,
        workflow_id: impl Into<String>,
        input: impl Into<String>,
    ) -> ChildWorkflowFuture {
        let workflow_id = workflow_id.into();
        let mut st = self.lock();
        let (seq, _) = st.record(EventKind::ChildWorkflowScheduled {
            name: name.into(),
            workflow_id: workflow_id.clone(),
            input: input.into(),
        });
        st.track(seq, Outstanding::ChildWorkflow { seq, workflow_id });
        drop(st);
        ChildWorkflowFuture { ctx: self.clone(), seq }
    }

    pub fn start_child_workflow_typed<In, Out>(
        &self,
        name: impl Into<String>,
        workflow_id: impl Into<String>,
        input: &In,
    ) -> BoxFuture<'static, Result<Out, String>>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let pending = Json::encode(input).map(|s| self.start_child_workflow(name, workflow_id, s));
        Box::pin(async move {
            let raw = pending?.await?;
            Json::decode::<Out>(&raw)
        })
    }

    /// Record a value on first execution and return the recorded value on replay.
    fn side_effect(&self, produce: impl FnOnce() -> String) -> String {
        let mut st = self.lock();
        if st.replaying && st.divergence.is_none() {
            let placeholder = EventKind::SideEffectRecorded { value: String::new() };
            if let (_, EventKind::SideEffectRecorded { value }) = st.record(placeholder)
                && st.divergence.is_none()
            {
                return value;
            }
            return produce();
        }
        let value = produce();
        st.record(EventKind::SideEffectRecorded { value: value.clone() });
        value
    }

    /// Deterministic random number, recorded in history on first use.
    pub fn random_u64(&self) -> u64 {
        let raw = self.side_effect(|| rand::random::<u64>().to_string());
        raw.parse().unwrap_or_default()
    }

    /// Deterministic GUID, recorded in history on first use.
    pub fn new_guid(&self) -> String {
        self.side_effect(|| uuid::Uuid::new_v4().to_string())
    }

    /// Has this run passed version gate `gate`?
    ///
    /// New runs record passing the gate and get `true`. A run whose history
    /// reached this point without recording the gate gets `false` for the rest
    /// of its life, so it keeps following the code path it started on.
    pub fn version_gate(&self, gate: &str) -> bool {
        let mut st = self.lock();
        if let Some(&answer) = st.gates.get(gate) {
            return answer;
        }
        let answer = if st.divergence.is_some() {
            false
        } else if st.replaying {
            match st.recorded.front() {
                Some((_, EventKind::VersionGatePassed { gate: g })) if g == gate => {
                    st.recorded.pop_front();
                    true
                }
                _ => false,
            }
        } else {
            st.record(EventKind::VersionGatePassed { gate: gate.to_string() });
            true
        };
        st.gates.insert(gate.to_string(), answer);
        answer
    }

    /// Cancellation check location. Observing a request here keeps the run
    /// alive so the workflow can compensate.
    pub fn is_cancellation_requested(&self) -> bool {
        let mut st = self.lock();
        if st.cancel_reason.is_some() {
            st.cancel_observed = true;
            true
        } else {
            false
        }
    }

    /// Resolves with the reason once cancellation is requested.
    pub fn cancelled(&self) -> CancellationFuture {
        CancellationFuture { ctx: self.clone() }
    }

    /// Publish a value readable through `Client::query`.
    pub fn set_query_state(&self, name: impl Into<String>, value: impl Into<String>) {
        self.lock().query_state.insert(name.into(), value.into());
    }

    /// End this run and start a fresh one of the same workflow id with `input`.
    /// The new run resolves its version through the registry policy.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        self.lock().continue_as_new = Some((input.into(), None));
    }

    pub fn continue_as_new_versioned(&self, input: impl Into<String>, version: impl Into<String>) {
        self.lock().continue_as_new = Some((input.into(), Some(version.into())));
    }

    /// # Errors
    ///
    /// Returns an error if `input` cannot be encoded.
    pub fn continue_as_new_typed<T: Serialize>(&self, input: &T) -> Result<(), String> {
        let encoded = Json::encode(input)?;
        self.continue_as_new(encoded);
        Ok(())
    }
}

/// Result of a scheduled activity.
pub struct ActivityFuture {
    ctx: WorkflowContext,
    seq: u64,
}

impl Future for ActivityFuture {
    type Output = Result<String, ActivityFailure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut st = self.ctx.lock();
        match st.activity_results.get(&self.seq) {
            Some(result) => Poll::Ready(result.clone()),
            None => {
                st.park(cx.waker());
                Poll::Pending
            }
        }
    }
}

pub struct TimerFuture {
    ctx: WorkflowContext,
    seq: u64,
}

impl Future for TimerFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut st = self.ctx.lock();
        if st.fired_timers.contains(&self.seq) {
            Poll::Ready(())
        } else {
            st.park(cx.waker());
            Poll::Pending
        }
    }
}

pub struct SignalFuture {
    ctx: WorkflowContext,
    name: String,
    index: usize,
}

impl Future for SignalFuture {
    type Output = String;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<String> {
        let mut st = self.ctx.lock();
        match st.signals.get(&self.name).and_then(|payloads| payloads.get(self.index)) {
            Some(payload) => Poll::Ready(payload.clone()),
            None => {
                st.park(cx.waker());
                Poll::Pending
            }
        }
    }
}

pub struct ChildWorkflowFuture {
    ctx: WorkflowContext,
    seq: u64,
}

impl Future for ChildWorkflowFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut st = self.ctx.lock();
        match st.child_results.get(&self.seq) {
            Some(result) => Poll::Ready(result.clone()),
            None => {
                st.park(cx.waker());
                Poll::Pending
            }
        }
    }
}

pub struct CancellationFuture {
    ctx: WorkflowContext,
}

impl Future for CancellationFuture {
    type Output = String;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<String> {
        let mut st = self.ctx.lock();
        match st.cancel_reason.clone() {
            Some(reason) => {
                st.cancel_observed = true;
                Poll::Ready(reason)
            }
            None => {
                st.park(cx.waker());
                Poll::Pending
            }
        }
    }
}
