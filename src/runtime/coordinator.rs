//! Workflow coordinator: one activation of one instance.
//!
//! An activation is
//!
//! 1. take the instance lease,
//! 2. read the full history,
//! 3. replay it through the engine,
//! 4. compare-and-append the new decisions, enqueueing the tasks they imply
//!    in the same store transaction,
//! 5. release the lease (unless the runtime retains leases).
//!
//! If step 4 reports `Conflict` another coordinator appended first. The
//! activation is abandoned without side effects: nothing was written and no
//! task was enqueued, so a losing coordinator can never dispatch work twice.
//! Re-running an activation from scratch is always safe for the same reason.
//!
//! The coordinator also handles the follow-up tasks decisions create on the
//! workflow queue: starting child workflows, reporting a child's result to
//! its parent, and starting the next run after continue-as-new.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::delivery::{DeliveryOutcome, record_input};
use super::registry::WorkflowRegistry;
use super::replay_engine::{ReplayEngine, ReplayError, ReplayOutcome, WorkflowState};
use crate::providers::{
    ActivityInvocation, AppendError, Lease, NewTask, Provider, ProviderError, StartError, StartOutcome, StartRequest,
    TaskKind,
};
use crate::{ErrorDetails, Event, EventKind, InstanceId, InstanceStatus, ParentLink, StatusKind};

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// TTL of the instance lease taken for each activation.
    pub lease_ttl: Duration,
    /// Keep the lease after a commit so this coordinator stays the preferred
    /// driver of the instance until the TTL runs out.
    pub retain_lease: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            retain_lease: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActivationOutcome {
    /// Another coordinator holds the instance lease.
    LeaseUnavailable,
    NoNewEvents,
    Committed { new_last_seq: u64, state: WorkflowState },
    /// The append lost the race; nothing was written.
    Conflict { expected: u64, actual: u64 },
    /// The history was already closed. The status index has been repaired.
    Terminal(StatusKind),
    /// The pinned workflow version is not registered on this node.
    HandlerMissing { name: String, version: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("corrupt history for {instance}: {reason}")]
    CorruptHistory { instance: InstanceId, reason: String },
    #[error("instance not found: {0}")]
    NotFound(InstanceId),
}

impl CoordinatorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::Provider(e) if e.is_retryable())
    }
}

/// Workflow facts a commit needs to turn decisions into tasks.
#[derive(Debug, Clone)]
struct StartInfo {
    name: String,
    parent: Option<ParentLink>,
    execution_timeout_ms: Option<u64>,
}

impl StartInfo {
    fn from_history(history: &[Event]) -> Option<Self> {
        match history.first().map(|e| &e.kind) {
            Some(EventKind::WorkflowStarted {
                name,
                parent,
                execution_timeout_ms,
                ..
            }) => Some(Self {
                name: name.clone(),
                parent: parent.clone(),
                execution_timeout_ms: *execution_timeout_ms,
            }),
            _ => None,
        }
    }
}

/// Result of replay, held together with the lease it was computed under.
#[derive(Debug)]
pub struct PreparedActivation {
    instance: InstanceId,
    lease: Lease,
    expected_last_seq: u64,
    history: Vec<Event>,
    outcome: ReplayOutcome,
}

impl PreparedActivation {
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn expected_last_seq(&self) -> u64 {
        self.expected_last_seq
    }

    pub fn outcome(&self) -> &ReplayOutcome {
        &self.outcome
    }
}

pub struct WorkflowCoordinator {
    provider: Arc<dyn Provider>,
    workflows: WorkflowRegistry,
    owner: String,
    options: CoordinatorOptions,
}

impl WorkflowCoordinator {
    pub fn new(
        provider: Arc<dyn Provider>,
        workflows: WorkflowRegistry,
        owner: impl Into<String>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            provider,
            workflows,
            owner: owner.into(),
            options,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Run one complete activation.
    pub async fn activate(&self, instance: &InstanceId) -> Result<ActivationOutcome, CoordinatorError> {
        let Some(lease) = self.acquire(instance).await? else {
            return Ok(ActivationOutcome::LeaseUnavailable);
        };
        let prepared = self.prepare(instance, lease).await?;
        self.commit(prepared).await
    }

    /// Step 1: the instance lease, or `None` while another coordinator holds it.
    pub async fn acquire(&self, instance: &InstanceId) -> Result<Option<Lease>, ProviderError> {
        self.acquire_for(instance, &self.owner).await
    }

    /// Step 1 on behalf of one worker of this node. Workers of the same node
    /// hold the instance lease under distinct names, so they exclude each
    /// other exactly like coordinators on different nodes.
    pub async fn acquire_as(&self, instance: &InstanceId, worker_id: &str) -> Result<Option<Lease>, ProviderError> {
        let holder = format!("{}/{worker_id}", self.owner);
        self.acquire_for(instance, &holder).await
    }

    async fn acquire_for(&self, instance: &InstanceId, holder: &str) -> Result<Option<Lease>, ProviderError> {
        let lease = self
            .provider
            .acquire_lease(&instance.lease_key(), holder, self.options.lease_ttl)
            .await?;
        if lease.is_none() {
            debug!(
                target: "duraflow::runtime::coordinator",
                instance = %instance,
                owner = %holder,
                "instance lease held elsewhere"
            );
        }
        Ok(lease)
    }

    /// Steps 2 and 3: read and replay. The lease is released on failure.
    pub async fn prepare(&self, instance: &InstanceId, lease: Lease) -> Result<PreparedActivation, CoordinatorError> {
        let history = match self.provider.read(instance).await {
            Ok(h) => h,
            Err(e) => {
                self.release(&lease).await;
                return Err(e.into());
            }
        };
        let Some(last) = history.last() else {
            self.release(&lease).await;
            return Err(CoordinatorError::NotFound(instance.clone()));
        };
        let expected_last_seq = last.seq;

        let outcome = match ReplayEngine::new(&self.workflows).activate(instance, &history) {
            Ok(outcome) => outcome,
            Err(ReplayError::CorruptHistory { instance, reason }) => {
                self.release(&lease).await;
                return Err(CoordinatorError::CorruptHistory { instance, reason });
            }
            Err(other) => {
                self.release(&lease).await;
                return Err(CoordinatorError::CorruptHistory {
                    instance: instance.clone(),
                    reason: other.to_string(),
                });
            }
        };
        Ok(PreparedActivation {
            instance: instance.clone(),
            lease,
            expected_last_seq,
            history,
            outcome,
        })
    }

    /// Steps 4 and 5: append the decisions and enqueue their tasks atomically.
    pub async fn commit(&self, prepared: PreparedActivation) -> Result<ActivationOutcome, CoordinatorError> {
        let PreparedActivation {
            instance,
            lease,
            expected_last_seq,
            history,
            outcome,
        } = prepared;

        let result = match outcome {
            ReplayOutcome::NoNewEvents => Ok(ActivationOutcome::NoNewEvents),
            ReplayOutcome::HandlerMissing { name, version } => {
                warn!(
                    target: "duraflow::runtime::coordinator",
                    instance = %instance,
                    workflow = %name,
                    version = %version,
                    "pinned workflow version is not registered here"
                );
                Ok(ActivationOutcome::HandlerMissing { name, version })
            }
            ReplayOutcome::AlreadyTerminal(kind) => self.repair_index(&instance, &history, kind).await,
            ReplayOutcome::Decisions(activation) => {
                let start = StartInfo::from_history(&history);
                let tasks = decision_tasks(
                    &instance,
                    expected_last_seq,
                    &activation.events,
                    start.as_ref(),
                    activation.continue_version.clone(),
                );
                let decisions = activation.events.len();
                match self
                    .provider
                    .append_with_tasks(&instance, expected_last_seq, activation.events, tasks)
                    .await
                {
                    Ok(new_last_seq) => {
                        match &activation.state {
                            WorkflowState::Terminal(status) => info!(
                                target: "duraflow::runtime::coordinator",
                                instance = %instance,
                                status = %status,
                                new_last_seq,
                                "workflow closed"
                            ),
                            WorkflowState::Suspended(cont) => debug!(
                                target: "duraflow::runtime::coordinator",
                                instance = %instance,
                                decisions,
                                new_last_seq,
                                outstanding = cont.outstanding.len(),
                                "activation committed"
                            ),
                        }
                        Ok(ActivationOutcome::Committed {
                            new_last_seq,
                            state: activation.state,
                        })
                    }
                    Err(AppendError::Conflict { expected, actual }) => {
                        info!(
                            target: "duraflow::runtime::coordinator",
                            instance = %instance,
                            expected,
                            actual,
                            "lost the append race; abandoning activation"
                        );
                        Ok(ActivationOutcome::Conflict { expected, actual })
                    }
                    Err(AppendError::NotFound(id)) => Err(CoordinatorError::NotFound(id)),
                    Err(AppendError::Provider(e)) => Err(CoordinatorError::Provider(e)),
                }
            }
        };

        if !self.options.retain_lease || result.is_err() {
            self.release(&lease).await;
        }
        result
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.provider.release_lease(lease).await {
            debug!(
                target: "duraflow::runtime::coordinator",
                lease = %lease.key,
                error = %e,
                "failed to release instance lease"
            );
        }
    }

    async fn repair_index(
        &self,
        instance: &InstanceId,
        history: &[Event],
        kind: StatusKind,
    ) -> Result<ActivationOutcome, CoordinatorError> {
        let indexed = self.provider.get_instance(instance).await?;
        if indexed.as_ref().is_some_and(|r| r.status != kind) {
            let output = InstanceStatus::from_history(history).index_output();
            self.provider.update_status(instance, kind, output).await?;
            info!(
                target: "duraflow::runtime::coordinator",
                instance = %instance,
                status = %kind,
                "status index repaired from history"
            );
        }
        Ok(ActivationOutcome::Terminal(kind))
    }

    /// Start the child a `ChildWorkflowScheduled` decision asked for.
    ///
    /// The child's run id is derived from the parent link, so repeated
    /// deliveries of the task find the run already created.
    pub async fn start_child(
        &self,
        parent: &ParentLink,
        name: &str,
        workflow_id: &str,
        input: &str,
    ) -> Result<(), ProviderError> {
        let link = format!("{}#{}", parent.instance, parent.scheduled_seq);
        let hash = blake3::hash(link.as_bytes()).to_hex();
        let child = InstanceId::new(
            parent.instance.namespace.clone(),
            workflow_id,
            format!("child-{}", &hash.as_str()[..16]),
        );
        let request = StartRequest {
            instance: child.clone(),
            workflow_name: name.to_string(),
            version: None,
            input: input.to_string(),
            idempotency_key: Some(link),
            idempotency_window: None,
            parent: Some(parent.clone()),
            execution_timeout_ms: None,
        };
        match self.provider.start_instance(request).await {
            Ok(StartOutcome::Created(id)) => {
                info!(
                    target: "duraflow::runtime::coordinator",
                    parent = %parent.instance,
                    child = %id,
                    workflow = %name,
                    "child workflow started"
                );
                Ok(())
            }
            Ok(StartOutcome::Existing(_)) => Ok(()),
            Err(StartError::AlreadyRunning(other)) => {
                warn!(
                    target: "duraflow::runtime::coordinator",
                    parent = %parent.instance,
                    running = %other,
                    "child workflow id is taken by a running workflow"
                );
                let failed = EventKind::ChildWorkflowFailed {
                    scheduled_seq: parent.scheduled_seq,
                    details: ErrorDetails::Application {
                        message: format!("workflow {workflow_id} is already running as {other}"),
                    },
                };
                record_input(self.provider.as_ref(), &parent.instance, failed).await?;
                Ok(())
            }
            Err(StartError::Provider(e)) => Err(e),
        }
    }

    /// Record a closed child's result in its parent.
    pub async fn close_child(
        &self,
        parent: &ParentLink,
        child: &InstanceId,
        result: &Result<String, ErrorDetails>,
    ) -> Result<(), ProviderError> {
        let event = match result {
            Ok(output) => EventKind::ChildWorkflowCompleted {
                scheduled_seq: parent.scheduled_seq,
                result: output.clone(),
            },
            Err(details) => EventKind::ChildWorkflowFailed {
                scheduled_seq: parent.scheduled_seq,
                details: details.clone(),
            },
        };
        let outcome = record_input(self.provider.as_ref(), &parent.instance, event).await?;
        if matches!(outcome, DeliveryOutcome::InstanceClosed | DeliveryOutcome::NotFound) {
            debug!(
                target: "duraflow::runtime::coordinator",
                parent = %parent.instance,
                child = %child,
                outcome = ?outcome,
                "child result not recorded"
            );
        }
        Ok(())
    }

    /// Start the run that follows `previous` after continue-as-new.
    #[allow(clippy::too_many_arguments)]
    pub async fn continue_as_new(
        &self,
        previous: &InstanceId,
        next_run_id: &str,
        name: &str,
        version: Option<String>,
        input: &str,
        parent: Option<ParentLink>,
        execution_timeout_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let next = previous.with_run(next_run_id);
        let request = StartRequest {
            instance: next.clone(),
            workflow_name: name.to_string(),
            version,
            input: input.to_string(),
            idempotency_key: None,
            idempotency_window: None,
            parent,
            execution_timeout_ms,
        };
        match self.provider.start_instance(request).await {
            Ok(StartOutcome::Created(_)) => {
                info!(
                    target: "duraflow::runtime::coordinator",
                    previous = %previous,
                    next = %next,
                    "continued as new"
                );
                Ok(())
            }
            Ok(StartOutcome::Existing(_)) => Ok(()),
            Err(StartError::AlreadyRunning(other)) => {
                warn!(
                    target: "duraflow::runtime::coordinator",
                    previous = %previous,
                    running = %other,
                    "another run started before the continuation; dropping it"
                );
                Ok(())
            }
            Err(StartError::Provider(e)) => Err(e),
        }
    }
}

/// Tasks implied by a batch of decisions that will occupy sequence numbers
/// `last_seq + 1 ..`.
fn decision_tasks(
    instance: &InstanceId,
    last_seq: u64,
    events: &[EventKind],
    start: Option<&StartInfo>,
    continue_version: Option<String>,
) -> Vec<NewTask> {
    let parent = start.and_then(|s| s.parent.clone());
    let mut tasks = Vec::new();
    for (i, kind) in events.iter().enumerate() {
        let seq = last_seq + 1 + i as u64;
        match kind {
            EventKind::ActivityScheduled { name, input, retry } => {
                tasks.push(NewTask::now(TaskKind::Activity(ActivityInvocation {
                    instance: instance.clone(),
                    scheduled_seq: seq,
                    name: name.clone(),
                    input: input.clone(),
                    retry: retry.clone(),
                    attempt: 1,
                })));
            }
            EventKind::TimerStarted { fire_at_ms, .. } => tasks.push(NewTask::at(
                TaskKind::Timer {
                    instance: instance.clone(),
                    started_seq: seq,
                    fire_at_ms: *fire_at_ms,
                },
                *fire_at_ms,
            )),
            EventKind::ChildWorkflowScheduled {
                name,
                workflow_id,
                input,
            } => tasks.push(NewTask::now(TaskKind::StartChild {
                parent: ParentLink {
                    instance: instance.clone(),
                    scheduled_seq: seq,
                },
                name: name.clone(),
                workflow_id: workflow_id.clone(),
                input: input.clone(),
            })),
            EventKind::WorkflowContinuedAsNew { input, next_run_id } => {
                if let Some(start) = start {
                    tasks.push(NewTask::now(TaskKind::ContinueAsNew {
                        previous: instance.clone(),
                        next_run_id: next_run_id.clone(),
                        name: start.name.clone(),
                        version: continue_version.clone(),
                        input: input.clone(),
                        parent: start.parent.clone(),
                        execution_timeout_ms: start.execution_timeout_ms,
                    }));
                }
            }
            terminal if terminal.is_terminal() => {
                if let (Some(parent), Some(result)) = (parent.clone(), child_result(terminal)) {
                    tasks.push(NewTask::now(TaskKind::ChildClosed {
                        parent,
                        child: instance.clone(),
                        result,
                    }));
                }
            }
            _ => {}
        }
    }
    tasks
}

/// What a parent sees when its child closes.
fn child_result(terminal: &EventKind) -> Option<Result<String, ErrorDetails>> {
    match terminal {
        EventKind::WorkflowCompleted { output } => Some(Ok(output.clone())),
        EventKind::WorkflowFailed { details } => Some(Err(details.clone())),
        EventKind::WorkflowTimedOut => Some(Err(ErrorDetails::Timeout {
            message: "child workflow timed out".to_string(),
        })),
        EventKind::WorkflowCancelled { reason } => Some(Err(ErrorDetails::Application {
            message: format!("child workflow cancelled: {reason}"),
        })),
        _ => None,
    }
}
