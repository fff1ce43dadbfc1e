//! In-process provider for tests and single-process embedding.
//!
//! All state sits behind one async mutex, which makes every operation
//! trivially atomic. Nothing survives the process.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{
    AppendError, DeadLetter, HistoryStore, InstanceRecord, InstanceStore, Lease, LeaseStore, LeasedTask, NackOptions,
    NewTask, ProviderError, StartError, StartOutcome, StartRequest, TaskKind, TaskQueue, next_timestamp,
    terminal_status,
};
use crate::{Event, EventKind, InstanceId, StatusKind, now_millis};

struct QueuedTask {
    queue: &'static str,
    kind: TaskKind,
    visible_at_ms: u64,
    lock_token: Option<String>,
    locked_until_ms: u64,
    delivery_count: u32,
}

impl QueuedTask {
    fn is_available(&self, now_ms: u64) -> bool {
        self.visible_at_ms <= now_ms && (self.lock_token.is_none() || self.locked_until_ms <= now_ms)
    }
}

#[derive(Default)]
struct State {
    histories: HashMap<InstanceId, Vec<Event>>,
    instances: HashMap<InstanceId, InstanceRecord>,
    tasks: BTreeMap<u64, QueuedTask>,
    next_task_id: u64,
    dead_letters: BTreeMap<u64, DeadLetter>,
    next_dead_letter_id: u64,
    leases: HashMap<String, Lease>,
}

impl State {
    fn push_task(&mut self, task: NewTask) {
        let now = now_millis();
        if let Some(key) = task.kind.coalesce_key() {
            let waiting = self.tasks.values_mut().find(|t| {
                t.lock_token.is_none() && t.kind.coalesce_key().as_deref() == Some(key.as_str())
            });
            if let Some(existing) = waiting {
                existing.visible_at_ms = existing.visible_at_ms.min(task.not_before_ms);
                return;
            }
        }
        self.next_task_id += 1;
        self.tasks.insert(
            self.next_task_id,
            QueuedTask {
                queue: task.kind.queue(),
                kind: task.kind,
                visible_at_ms: task.not_before_ms,
                lock_token: None,
                locked_until_ms: now,
                delivery_count: 0,
            },
        );
    }

    fn task_id_by_token(&self, token: &str, operation: &str) -> Result<u64, ProviderError> {
        self.tasks
            .iter()
            .find(|(_, t)| t.lock_token.as_deref() == Some(token))
            .map(|(id, _)| *id)
            .ok_or_else(|| ProviderError::permanent(operation, format!("unknown lock token {token}")))
    }
}

/// Provider that keeps everything in memory.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryProvider {
    async fn append_with_tasks(
        &self,
        instance: &InstanceId,
        expected_last_seq: u64,
        events: Vec<EventKind>,
        tasks: Vec<NewTask>,
    ) -> Result<u64, AppendError> {
        let mut st = self.state.lock().await;
        let history = st
            .histories
            .get_mut(instance)
            .ok_or_else(|| AppendError::NotFound(instance.clone()))?;
        let actual = history.last().map(|e| e.seq).unwrap_or(0);
        if actual != expected_last_seq {
            return Err(AppendError::Conflict {
                expected: expected_last_seq,
                actual,
            });
        }
        let mut last_ts = history.last().map(|e| e.timestamp_ms).unwrap_or(0);
        let mut seq = actual;
        let mut closed = None;
        for kind in events {
            seq += 1;
            last_ts = next_timestamp(last_ts);
            if let Some(status) = terminal_status(&kind) {
                closed = Some(status);
            }
            history.push(Event {
                seq,
                timestamp_ms: last_ts,
                kind,
            });
        }
        if let Some(record) = st.instances.get_mut(instance) {
            record.last_seq = seq;
            record.updated_at_ms = last_ts;
            if let Some((status, output)) = closed {
                record.status = status;
                record.output = output;
                record.closed_at_ms = Some(last_ts);
            }
        }
        for task in tasks {
            st.push_task(task);
        }
        Ok(seq)
    }

    async fn read_events(&self, instance: &InstanceId, from_seq: u64) -> Result<Vec<Event>, ProviderError> {
        let st = self.state.lock().await;
        Ok(st
            .histories
            .get(instance)
            .map(|h| h.iter().filter(|e| e.seq >= from_seq).cloned().collect())
            .unwrap_or_default())
    }

    async fn last_seq(&self, instance: &InstanceId) -> Result<u64, ProviderError> {
        let st = self.state.lock().await;
        Ok(st
            .histories
            .get(instance)
            .and_then(|h| h.last())
            .map(|e| e.seq)
            .unwrap_or(0))
    }
}

#[async_trait::async_trait]
impl TaskQueue for InMemoryProvider {
    async fn enqueue(&self, task: NewTask) -> Result<(), ProviderError> {
        self.state.lock().await.push_task(task);
        Ok(())
    }

    async fn dequeue(&self, queue: &str, visibility: Duration) -> Result<Option<LeasedTask>, ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_millis();
        let Some(task) = st
            .tasks
            .values_mut()
            .find(|t| t.queue == queue && t.is_available(now))
        else {
            return Ok(None);
        };
        let token = uuid::Uuid::new_v4().to_string();
        task.lock_token = Some(token.clone());
        task.locked_until_ms = now + visibility.as_millis() as u64;
        task.delivery_count += 1;
        Ok(Some(LeasedTask {
            kind: task.kind.clone(),
            token,
            delivery_count: task.delivery_count,
        }))
    }

    async fn ack(&self, token: &str) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let id = st.task_id_by_token(token, "ack")?;
        st.tasks.remove(&id);
        Ok(())
    }

    async fn nack(&self, token: &str, options: NackOptions) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let id = st.task_id_by_token(token, "nack")?;
        let now = now_millis();
        if let Some(task) = st.tasks.get_mut(&id) {
            task.lock_token = None;
            task.locked_until_ms = now;
            task.visible_at_ms = now + options.delay.map(|d| d.as_millis() as u64).unwrap_or(0);
            if options.ignore_attempt {
                task.delivery_count = task.delivery_count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn extend_lease(&self, token: &str, visibility: Duration) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let id = st.task_id_by_token(token, "extend_lease")?;
        if let Some(task) = st.tasks.get_mut(&id) {
            task.locked_until_ms = now_millis() + visibility.as_millis() as u64;
        }
        Ok(())
    }

    async fn reschedule(&self, token: &str, next: NewTask) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let id = st.task_id_by_token(token, "reschedule")?;
        st.tasks.remove(&id);
        st.push_task(next);
        Ok(())
    }

    async fn dead_letter(&self, token: &str, reason: &str) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let id = st.task_id_by_token(token, "dead_letter")?;
        let Some(task) = st.tasks.remove(&id) else {
            return Ok(());
        };
        st.next_dead_letter_id += 1;
        let dl_id = st.next_dead_letter_id;
        st.dead_letters.insert(
            dl_id,
            DeadLetter {
                id: dl_id,
                queue: task.queue.to_string(),
                kind: task.kind,
                delivery_count: task.delivery_count,
                reason: reason.to_string(),
                dead_at_ms: now_millis(),
            },
        );
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, ProviderError> {
        Ok(self.state.lock().await.dead_letters.values().cloned().collect())
    }

    async fn requeue_dead_letter(&self, id: u64) -> Result<bool, ProviderError> {
        let mut st = self.state.lock().await;
        match st.dead_letters.remove(&id) {
            Some(dl) => {
                st.push_task(NewTask::now(dl.kind));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, ProviderError> {
        let st = self.state.lock().await;
        Ok(st.tasks.values().filter(|t| t.queue == queue).count() as u64)
    }
}

#[async_trait::async_trait]
impl LeaseStore for InMemoryProvider {
    async fn acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<Option<Lease>, ProviderError> {
        let mut st = self.state.lock().await;
        let now = now_millis();
        let expires_at_ms = now + ttl.as_millis() as u64;
        let token = match st.leases.get(key) {
            None => 1,
            Some(held) if held.owner == owner => held.token,
            Some(held) if held.expires_at_ms <= now => held.token + 1,
            Some(_) => return Ok(None),
        };
        let lease = Lease {
            key: key.to_string(),
            owner: owner.to_string(),
            token,
            expires_at_ms,
        };
        st.leases.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, ProviderError> {
        let mut st = self.state.lock().await;
        match st.leases.get_mut(&lease.key) {
            Some(held) if held.owner == lease.owner && held.token == lease.token => {
                held.expires_at_ms = now_millis() + ttl.as_millis() as u64;
                Ok(Some(held.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        if st
            .leases
            .get(&lease.key)
            .is_some_and(|held| held.owner == lease.owner && held.token == lease.token)
        {
            // Keep the token so the next holder still gets a larger one.
            if let Some(held) = st.leases.get_mut(&lease.key) {
                held.expires_at_ms = 0;
                held.owner = String::new();
            }
        }
        Ok(())
    }

    async fn list_leases(&self, prefix: &str) -> Result<Vec<Lease>, ProviderError> {
        let st = self.state.lock().await;
        let now = now_millis();
        let mut leases: Vec<Lease> = st
            .leases
            .values()
            .filter(|l| l.key.starts_with(prefix) && l.expires_at_ms > now)
            .cloned()
            .collect();
        leases.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(leases)
    }
}

#[async_trait::async_trait]
impl InstanceStore for InMemoryProvider {
    async fn start_instance(&self, request: StartRequest) -> Result<StartOutcome, StartError> {
        let mut st = self.state.lock().await;
        let now = now_millis();
        if st.instances.contains_key(&request.instance) {
            return Ok(StartOutcome::Existing(request.instance));
        }
        let same_workflow = |r: &&InstanceRecord| {
            r.instance.namespace == request.instance.namespace && r.instance.workflow_id == request.instance.workflow_id
        };
        if let Some(existing) = st
            .instances
            .values()
            .filter(same_workflow)
            .find(|r| request.matches_existing(r.idempotency_key.as_deref(), r.created_at_ms, now))
        {
            return Ok(StartOutcome::Existing(existing.instance.clone()));
        }
        if let Some(open) = st
            .instances
            .values()
            .filter(same_workflow)
            .find(|r| r.status == StatusKind::Running)
        {
            return Err(StartError::AlreadyRunning(open.instance.clone()));
        }

        st.histories.insert(
            request.instance.clone(),
            vec![Event {
                seq: 1,
                timestamp_ms: now,
                kind: request.started_event(),
            }],
        );
        st.instances.insert(
            request.instance.clone(),
            InstanceRecord {
                instance: request.instance.clone(),
                workflow_name: request.workflow_name.clone(),
                status: StatusKind::Running,
                output: None,
                idempotency_key: request.idempotency_key.clone(),
                parent: request.parent.clone(),
                created_at_ms: now,
                updated_at_ms: now,
                closed_at_ms: None,
                last_seq: 1,
            },
        );
        st.push_task(NewTask::now(TaskKind::Workflow {
            instance: request.instance.clone(),
        }));
        Ok(StartOutcome::Created(request.instance))
    }

    async fn get_instance(&self, instance: &InstanceId) -> Result<Option<InstanceRecord>, ProviderError> {
        Ok(self.state.lock().await.instances.get(instance).cloned())
    }

    async fn latest_run(&self, namespace: &str, workflow_id: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        let st = self.state.lock().await;
        Ok(st
            .instances
            .values()
            .filter(|r| r.instance.namespace == namespace && r.instance.workflow_id == workflow_id)
            .max_by_key(|r| (r.created_at_ms, r.closed_at_ms.is_none()))
            .cloned())
    }

    async fn update_status(
        &self,
        instance: &InstanceId,
        status: StatusKind,
        output: Option<String>,
    ) -> Result<(), ProviderError> {
        let mut st = self.state.lock().await;
        let record = st
            .instances
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("update_status", format!("instance not found: {instance}")))?;
        let now = now_millis();
        record.status = status;
        record.output = output;
        record.updated_at_ms = now;
        record.closed_at_ms = if status.is_terminal() {
            Some(record.closed_at_ms.unwrap_or(now))
        } else {
            None
        };
        Ok(())
    }

    async fn list_instances(&self, status: Option<StatusKind>) -> Result<Vec<InstanceRecord>, ProviderError> {
        let st = self.state.lock().await;
        let mut out: Vec<InstanceRecord> = st
            .instances
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.created_at_ms, &a.instance).cmp(&(b.created_at_ms, &b.instance)));
        Ok(out)
    }

    async fn purge_closed_before(&self, cutoff_ms: u64) -> Result<u64, ProviderError> {
        let mut st = self.state.lock().await;
        let doomed: Vec<InstanceId> = st
            .instances
            .values()
            .filter(|r| r.status.is_terminal() && r.closed_at_ms.is_some_and(|c| c < cutoff_ms))
            .map(|r| r.instance.clone())
            .collect();
        for id in &doomed {
            st.instances.remove(id);
            st.histories.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{TIMER_QUEUE, WORKFLOW_QUEUE};

    fn start_request(run: &str) -> StartRequest {
        StartRequest {
            instance: InstanceId::new("ns", "wf", run),
            workflow_name: "w".into(),
            version: None,
            input: "in".into(),
            idempotency_key: None,
            idempotency_window: None,
            parent: None,
            execution_timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn waiting_workflow_tasks_are_coalesced() {
        let p = InMemoryProvider::new();
        let id = InstanceId::new("ns", "wf", "r1");
        p.start_instance(start_request("r1")).await.unwrap();
        for _ in 0..3 {
            p.enqueue(NewTask::now(TaskKind::Workflow { instance: id.clone() }))
                .await
                .unwrap();
        }
        assert_eq!(p.queue_depth(WORKFLOW_QUEUE).await.unwrap(), 1);

        // A leased task is not merged with new arrivals.
        let leased = p.dequeue(WORKFLOW_QUEUE, Duration::from_secs(30)).await.unwrap().unwrap();
        p.enqueue(NewTask::now(TaskKind::Workflow { instance: id.clone() }))
            .await
            .unwrap();
        assert_eq!(p.queue_depth(WORKFLOW_QUEUE).await.unwrap(), 2);
        p.ack(&leased.token).await.unwrap();
        assert_eq!(p.queue_depth(WORKFLOW_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delayed_tasks_stay_invisible() {
        let p = InMemoryProvider::new();
        let id = InstanceId::new("ns", "wf", "r1");
        p.enqueue(NewTask::at(
            TaskKind::Timer {
                instance: id,
                started_seq: 2,
                fire_at_ms: now_millis() + 60_000,
            },
            now_millis() + 60_000,
        ))
        .await
        .unwrap();
        assert!(p.dequeue(TIMER_QUEUE, Duration::from_secs(1)).await.unwrap().is_none());
        assert_eq!(p.queue_depth(TIMER_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn terminal_append_closes_the_index_row() {
        let p = InMemoryProvider::new();
        let id = InstanceId::new("ns", "wf", "r1");
        p.start_instance(start_request("r1")).await.unwrap();
        p.append_events(
            &id,
            1,
            vec![
                EventKind::ActivationCompleted,
                EventKind::WorkflowCompleted { output: "done".into() },
            ],
        )
        .await
        .unwrap();
        let rec = p.get_instance(&id).await.unwrap().unwrap();
        assert_eq!(rec.status, StatusKind::Completed);
        assert_eq!(rec.output.as_deref(), Some("done"));
        assert_eq!(rec.last_seq, 3);
        assert!(rec.closed_at_ms.is_some());
    }
}
