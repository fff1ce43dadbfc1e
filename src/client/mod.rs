//! External interface: start, signal, cancel, query and wait for workflows.
//!
//! The client talks to the runtime exclusively through the shared
//! [`Provider`]. Starts go through the instance store (which writes
//! `WorkflowStarted` and the first workflow task atomically); signals and
//! cancellation are recorded as history inputs; queries replay history in
//! process and never append.

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info};

use crate::_typed_codec::{Codec, Json};
use crate::providers::{DeadLetter, InstanceRecord, Provider, ProviderError, StartError, StartOutcome, StartRequest};
use crate::runtime::delivery::{DeliveryOutcome, record_input};
use crate::runtime::registry::WorkflowRegistry;
use crate::runtime::replay_engine::{ReplayEngine, ReplayError};
use crate::{Event, EventKind, InstanceId, InstanceStatus, StatusKind};

const DEFAULT_IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
const POLL_INITIAL: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A run of this workflow id is open and the request carried no matching
    /// idempotency key.
    #[error("workflow already running: {0}")]
    AlreadyRunning(InstanceId),
    #[error("instance not found: {0}")]
    NotFound(InstanceId),
    #[error("instance {0} is closed")]
    InstanceClosed(InstanceId),
    #[error("timed out waiting for {0}")]
    Timeout(InstanceId),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("query failed: {0}")]
    Query(#[from] ReplayError),
    #[error("codec: {0}")]
    Codec(String),
}

impl From<StartError> for ClientError {
    fn from(e: StartError) -> Self {
        match e {
            StartError::AlreadyRunning(existing) => ClientError::AlreadyRunning(existing),
            StartError::Provider(p) => ClientError::Provider(p),
        }
    }
}

/// Parameters of a new run.
///
/// ```rust
/// use duraflow::StartWorkflow;
/// use std::time::Duration;
///
/// let req = StartWorkflow::new("billing", "order-42", "payment")
///     .input("100")
///     .idempotency_key("req-1")
///     .execution_timeout(Duration::from_secs(3600));
/// assert_eq!(req.workflow_id(), "order-42");
/// ```
#[derive(Debug, Clone)]
pub struct StartWorkflow {
    namespace: String,
    workflow_id: String,
    name: String,
    input: String,
    idempotency_key: Option<String>,
    version: Option<String>,
    execution_timeout: Option<Duration>,
}

impl StartWorkflow {
    pub fn new(namespace: impl Into<String>, workflow_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            workflow_id: workflow_id.into(),
            name: name.into(),
            input: String::new(),
            idempotency_key: None,
            version: None,
            execution_timeout: None,
        }
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Pin the run to an exact registered version instead of the registry policy.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// End the run `TimedOut` if it is still open after `timeout`.
    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }
}

/// Control-plane client bound to a provider.
pub struct Client {
    provider: Arc<dyn Provider>,
    idempotency_window: Duration,
    workflows: Option<WorkflowRegistry>,
}

impl Client {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            idempotency_window: DEFAULT_IDEMPOTENCY_WINDOW,
            workflows: None,
        }
    }

    /// How long a start with the same idempotency key returns the original run.
    pub fn with_idempotency_window(mut self, window: Duration) -> Self {
        self.idempotency_window = window;
        self
    }

    /// Workflow code used to answer queries. Must match what the runtime runs.
    pub fn with_workflows(mut self, workflows: WorkflowRegistry) -> Self {
        self.workflows = Some(workflows);
        self
    }

    /// Start a run. A repeated request with the same idempotency key inside
    /// the window returns the existing run instead of starting another.
    pub async fn start_workflow(&self, request: StartWorkflow) -> Result<InstanceId, ClientError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let instance = InstanceId::new(request.namespace, request.workflow_id, run_id);
        let outcome = self
            .provider
            .start_instance(StartRequest {
                instance,
                workflow_name: request.name,
                version: request.version,
                input: request.input,
                idempotency_key: request.idempotency_key,
                idempotency_window: Some(self.idempotency_window),
                parent: None,
                execution_timeout_ms: request.execution_timeout.map(|d| d.as_millis() as u64),
            })
            .await?;
        match &outcome {
            StartOutcome::Created(i) => info!(target: "duraflow::client", instance = %i, "workflow started"),
            StartOutcome::Existing(i) => {
                debug!(target: "duraflow::client", instance = %i, "start deduplicated to existing run")
            }
        }
        Ok(outcome.instance().clone())
    }

    /// Start `name` as `namespace/workflow_id` with a raw string input.
    pub async fn submit(
        &self,
        namespace: &str,
        workflow_id: &str,
        idempotency_key: Option<&str>,
        name: &str,
        input: impl Into<String>,
    ) -> Result<InstanceId, ClientError> {
        let mut request = StartWorkflow::new(namespace, workflow_id, name).input(input);
        if let Some(key) = idempotency_key {
            request = request.idempotency_key(key);
        }
        self.start_workflow(request).await
    }

    /// Start with typed input (serialized to JSON).
    pub async fn submit_typed<In: Serialize>(
        &self,
        namespace: &str,
        workflow_id: &str,
        idempotency_key: Option<&str>,
        name: &str,
        input: &In,
    ) -> Result<InstanceId, ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Codec)?;
        self.submit(namespace, workflow_id, idempotency_key, name, payload).await
    }

    /// Deliver a signal to the run's next activation.
    pub async fn signal(
        &self,
        instance: &InstanceId,
        name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), ClientError> {
        let event = EventKind::SignalReceived {
            name: name.into(),
            payload: payload.into(),
        };
        self.deliver(instance, event).await
    }

    /// Request cancellation. Repeated requests are recorded once.
    pub async fn cancel(&self, instance: &InstanceId, reason: impl Into<String>) -> Result<(), ClientError> {
        let event = EventKind::CancelRequested { reason: reason.into() };
        self.deliver(instance, event).await
    }

    async fn deliver(&self, instance: &InstanceId, event: EventKind) -> Result<(), ClientError> {
        let kind = event.name();
        match record_input(self.provider.as_ref(), instance, event).await? {
            DeliveryOutcome::Recorded(seq) => {
                debug!(target: "duraflow::client", instance = %instance, seq, event = kind, "input recorded");
                Ok(())
            }
            DeliveryOutcome::Duplicate => Ok(()),
            DeliveryOutcome::InstanceClosed => Err(ClientError::InstanceClosed(instance.clone())),
            DeliveryOutcome::NotFound => Err(ClientError::NotFound(instance.clone())),
        }
    }

    /// Read-only query answered by replaying the run's history. Nothing is
    /// appended and no task is enqueued. `Ok(None)` if the workflow never
    /// published `name`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Query`] if the client has no workflow registry (see
    /// [`with_workflows`](Self::with_workflows)), the handler is missing or
    /// replay diverges.
    pub async fn query(&self, instance: &InstanceId, name: &str) -> Result<Option<String>, ClientError> {
        let history = self.read_history(instance).await?;
        if history.is_empty() {
            return Err(ClientError::NotFound(instance.clone()));
        }
        let Some(workflows) = &self.workflows else {
            let (workflow, version) = started_name(&history);
            return Err(ClientError::Query(ReplayError::HandlerMissing {
                name: workflow,
                version,
            }));
        };
        Ok(ReplayEngine::new(workflows).query(instance, &history, name)?)
    }

    pub async fn query_typed<Out: DeserializeOwned>(
        &self,
        instance: &InstanceId,
        name: &str,
    ) -> Result<Option<Out>, ClientError> {
        match self.query(instance, name).await? {
            Some(raw) => Json::decode(&raw).map(Some).map_err(ClientError::Codec),
            None => Ok(None),
        }
    }

    /// Status derived from the run's own history.
    pub async fn get_status(&self, instance: &InstanceId) -> Result<InstanceStatus, ClientError> {
        let history = self.read_history(instance).await?;
        Ok(InstanceStatus::from_history(&history))
    }

    /// Poll until the workflow reaches a final status or `timeout` elapses.
    /// Continue-as-new is followed to the newest run; the returned status is
    /// never `ContinuedAsNew`.
    pub async fn wait_for_completion(
        &self,
        instance: &InstanceId,
        timeout: Duration,
    ) -> Result<InstanceStatus, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut current = instance.clone();
        let mut delay = POLL_INITIAL;
        loop {
            match self.get_status(&current).await? {
                InstanceStatus::NotFound => return Err(ClientError::NotFound(current)),
                InstanceStatus::ContinuedAsNew { next_run_id, .. } => {
                    debug!(target: "duraflow::client", from = %current, next_run_id = %next_run_id, "following continue-as-new");
                    current = current.with_run(next_run_id);
                    delay = POLL_INITIAL;
                    continue;
                }
                InstanceStatus::Running => {}
                closed => return Ok(closed),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout(current));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX);
        }
    }

    /// Wait and decode the output. Non-successful endings come back as
    /// `Err(message)` inside `Ok`.
    pub async fn wait_for_completion_typed<Out: DeserializeOwned>(
        &self,
        instance: &InstanceId,
        timeout: Duration,
    ) -> Result<Result<Out, String>, ClientError> {
        match self.wait_for_completion(instance, timeout).await? {
            InstanceStatus::Completed { output } => Ok(Ok(Json::decode(&output).map_err(ClientError::Codec)?)),
            InstanceStatus::Failed { details } => Ok(Err(details.display_message())),
            InstanceStatus::TimedOut => Ok(Err("timed out".to_string())),
            InstanceStatus::Cancelled { reason } => Ok(Err(format!("cancelled: {reason}"))),
            InstanceStatus::NotFound | InstanceStatus::Running | InstanceStatus::ContinuedAsNew { .. } => {
                Err(ClientError::Timeout(instance.clone()))
            }
        }
    }

    pub async fn read_history(&self, instance: &InstanceId) -> Result<Vec<Event>, ClientError> {
        Ok(self.provider.read(instance).await?)
    }

    /// Index row of a run. May lag the history briefly.
    pub async fn describe(&self, instance: &InstanceId) -> Result<Option<InstanceRecord>, ClientError> {
        Ok(self.provider.get_instance(instance).await?)
    }

    /// Most recent run of a workflow id.
    pub async fn latest_instance(&self, namespace: &str, workflow_id: &str) -> Result<Option<InstanceId>, ClientError> {
        Ok(self
            .provider
            .latest_run(namespace, workflow_id)
            .await?
            .map(|r| r.instance))
    }

    /// List runs from the status index, optionally filtered by status.
    pub async fn list_instances(&self, status: Option<StatusKind>) -> Result<Vec<InstanceRecord>, ClientError> {
        Ok(self.provider.list_instances(status).await?)
    }

    /// Recompute a run's index entry from its history.
    pub async fn rebuild_status(&self, instance: &InstanceId) -> Result<InstanceStatus, ClientError> {
        let status = self.get_status(instance).await?;
        let Some(kind) = status.kind() else {
            return Err(ClientError::NotFound(instance.clone()));
        };
        self.provider
            .update_status(instance, kind, status.index_output())
            .await?;
        Ok(status)
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, ClientError> {
        Ok(self.provider.list_dead_letters().await?)
    }

    /// Put a dead-lettered task back on its queue with a fresh delivery count.
    /// Returns `false` if no such entry exists.
    pub async fn requeue_dead_letter(&self, id: u64) -> Result<bool, ClientError> {
        let requeued = self.provider.requeue_dead_letter(id).await?;
        if requeued {
            info!(target: "duraflow::client", id, "dead letter requeued");
        }
        Ok(requeued)
    }
}

fn started_name(history: &[Event]) -> (String, String) {
    match history.first().map(|e| &e.kind) {
        Some(EventKind::WorkflowStarted { name, version, .. }) => {
            (name.clone(), version.clone().unwrap_or_else(|| "*".to_string()))
        }
        _ => (String::new(), String::new()),
    }
}
