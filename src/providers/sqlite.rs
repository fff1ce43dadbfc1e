use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::{
    AppendError, DeadLetter, HistoryStore, InstanceRecord, InstanceStore, Lease, LeaseStore, LeasedTask, NackOptions,
    NewTask, ProviderError, StartError, StartOutcome, StartRequest, TaskKind, TaskQueue, next_timestamp,
    terminal_status,
};
use crate::{Event, EventKind, InstanceId, ParentLink, StatusKind, now_millis};

/// Configuration options for [`SqliteProvider`].
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Pool size for file databases. In-memory databases always use one connection.
    pub max_connections: u32,
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_secs(60),
        }
    }
}

/// SQLite-backed provider with full transactional support.
///
/// Compare-and-append is enforced twice: the transaction checks the last
/// sequence number, and the `(instance, seq)` primary key rejects a second
/// writer that raced past the check.
pub struct SqliteProvider {
    pool: SqlitePool,
}

impl SqliteProvider {
    /// Open (creating if missing) the database at `database_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema initialization fails.
    pub async fn new(database_url: &str, options: Option<SqliteOptions>) -> Result<Self, sqlx::Error> {
        let options = options.unwrap_or_default();
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let connect = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(options.busy_timeout);

        let mut pool_options = SqlitePoolOptions::new().after_connect(move |conn, _meta| {
            Box::pin(async move {
                if is_memory {
                    sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                } else {
                    sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                }
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                Ok(())
            })
        });
        pool_options = if is_memory {
            // A private in-memory database lives as long as its only connection.
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(options.max_connections)
        };

        let pool = pool_options.connect_with(connect).await?;
        Self::create_schema(&pool).await?;
        debug!(target: "duraflow::providers::sqlite", url = %database_url, "sqlite provider ready");
        Ok(Self { pool })
    }

    /// Private in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:", None).await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                namespace TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                status TEXT NOT NULL,
                output TEXT,
                idempotency_key TEXT,
                parent TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                closed_at INTEGER,
                last_seq INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (namespace, workflow_id, run_id)
            )
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_instances_workflow ON instances(namespace, workflow_id, created_at)")
            .execute(pool)
            .await?;
        // At most one open run per workflow id.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_one_running ON instances(namespace, workflow_id) WHERE status = 'Running'",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                namespace TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                PRIMARY KEY (namespace, workflow_id, run_id, seq)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                coalesce_key TEXT,
                task TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT,
                locked_until INTEGER,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_available ON tasks(queue, visible_at, id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_lock ON tasks(lock_token)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_coalesce ON tasks(coalesce_key)")
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                task TEXT NOT NULL,
                delivery_count INTEGER NOT NULL,
                reason TEXT NOT NULL,
                dead_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                lease_key TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                token INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Convert sqlx error to ProviderError with the right retry classification
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();
        if error_msg.contains("locked") || error_msg.contains("SQLITE_BUSY") || error_msg.contains("busy") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }
        if Self::is_unique_violation(&error_msg) {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }
        if error_msg.contains("connection") || error_msg.contains("timeout") || error_msg.contains("timed out") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }
        ProviderError::retryable(operation, error_msg)
    }

    fn is_unique_violation(msg: &str) -> bool {
        msg.contains("UNIQUE constraint") || msg.contains("PRIMARY KEY")
    }

    fn encode<T: serde::Serialize>(operation: &str, value: &T) -> Result<String, ProviderError> {
        serde_json::to_string(value)
            .map_err(|e| ProviderError::permanent(operation, format!("Serialization error: {e}")))
    }

    fn decode<T: serde::de::DeserializeOwned>(operation: &str, raw: &str) -> Result<T, ProviderError> {
        serde_json::from_str(raw).map_err(|e| ProviderError::permanent(operation, format!("Deserialization error: {e}")))
    }

    fn column<'r, T>(row: &'r SqliteRow, name: &str, operation: &str) -> Result<T, ProviderError>
    where
        T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
    {
        row.try_get(name)
            .map_err(|e| ProviderError::permanent(operation, format!("Failed to get {name}: {e}")))
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'_, Sqlite>, ProviderError> {
        self.pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))
    }

    async fn commit(tx: Transaction<'_, Sqlite>, operation: &str) -> Result<(), ProviderError> {
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(operation, e))
    }

    async fn push_task_in_tx(tx: &mut Transaction<'_, Sqlite>, task: &NewTask) -> Result<(), ProviderError> {
        let payload = Self::encode("enqueue", &task.kind)?;
        let coalesce_key = task.kind.coalesce_key();
        if let Some(key) = &coalesce_key {
            let merged = sqlx::query(
                r#"
                UPDATE tasks SET visible_at = MIN(visible_at, ?1)
                WHERE id = (SELECT id FROM tasks WHERE coalesce_key = ?2 AND lock_token IS NULL LIMIT 1)
                "#,
            )
            .bind(task.not_before_ms as i64)
            .bind(key)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("enqueue", e))?;
            if merged.rows_affected() > 0 {
                return Ok(());
            }
        }
        sqlx::query(
            "INSERT INTO tasks (queue, coalesce_key, task, visible_at, delivery_count, created_at) VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(task.kind.queue())
        .bind(coalesce_key)
        .bind(payload)
        .bind(task.not_before_ms as i64)
        .bind(now_millis() as i64)
        .execute(&mut **tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("enqueue", e))?;
        Ok(())
    }

    fn row_to_record(row: &SqliteRow) -> Result<InstanceRecord, ProviderError> {
        const OP: &str = "read_instance";
        let status_str: String = Self::column(row, "status", OP)?;
        let status = StatusKind::parse(&status_str)
            .ok_or_else(|| ProviderError::permanent(OP, format!("unknown status {status_str}")))?;
        let parent: Option<String> = Self::column(row, "parent", OP)?;
        let parent: Option<ParentLink> = parent.map(|p| Self::decode(OP, &p)).transpose()?;
        let closed_at: Option<i64> = Self::column(row, "closed_at", OP)?;
        Ok(InstanceRecord {
            instance: InstanceId::new(
                Self::column::<String>(row, "namespace", OP)?,
                Self::column::<String>(row, "workflow_id", OP)?,
                Self::column::<String>(row, "run_id", OP)?,
            ),
            workflow_name: Self::column(row, "workflow_name", OP)?,
            status,
            output: Self::column(row, "output", OP)?,
            idempotency_key: Self::column(row, "idempotency_key", OP)?,
            parent,
            created_at_ms: Self::column::<i64>(row, "created_at", OP)? as u64,
            updated_at_ms: Self::column::<i64>(row, "updated_at", OP)? as u64,
            closed_at_ms: closed_at.map(|c| c as u64),
            last_seq: Self::column::<i64>(row, "last_seq", OP)? as u64,
        })
    }

    fn row_to_lease(row: &SqliteRow) -> Result<Lease, ProviderError> {
        const OP: &str = "read_lease";
        Ok(Lease {
            key: Self::column(row, "lease_key", OP)?,
            owner: Self::column(row, "owner", OP)?,
            token: Self::column::<i64>(row, "token", OP)? as u64,
            expires_at_ms: Self::column::<i64>(row, "expires_at", OP)? as u64,
        })
    }

    const INSTANCE_COLUMNS: &'static str = "namespace, workflow_id, run_id, workflow_name, status, output, idempotency_key, parent, created_at, updated_at, closed_at, last_seq";
}

#[async_trait::async_trait]
impl HistoryStore for SqliteProvider {
    async fn append_with_tasks(
        &self,
        instance: &InstanceId,
        expected_last_seq: u64,
        events: Vec<EventKind>,
        tasks: Vec<NewTask>,
    ) -> Result<u64, AppendError> {
        const OP: &str = "append_with_tasks";
        let mut tx = self.begin(OP).await?;

        // Write first so the transaction holds the write lock before it reads
        // the tail; racing appenders then queue on the busy timeout.
        let touched = sqlx::query(
            "UPDATE instances SET updated_at = updated_at WHERE namespace = ? AND workflow_id = ? AND run_id = ?",
        )
        .bind(&instance.namespace)
        .bind(&instance.workflow_id)
        .bind(&instance.run_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        if touched.rows_affected() == 0 {
            return Err(AppendError::NotFound(instance.clone()));
        }

        let last = sqlx::query(
            "SELECT seq, timestamp_ms FROM history WHERE namespace = ? AND workflow_id = ? AND run_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(&instance.namespace)
        .bind(&instance.workflow_id)
        .bind(&instance.run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let (actual, mut last_ts) = match last {
            Some(row) => (
                Self::column::<i64>(&row, "seq", OP)? as u64,
                Self::column::<i64>(&row, "timestamp_ms", OP)? as u64,
            ),
            None => (0, 0),
        };
        if actual != expected_last_seq {
            return Err(AppendError::Conflict {
                expected: expected_last_seq,
                actual,
            });
        }

        let mut seq = actual;
        let mut closed = None;
        for kind in &events {
            seq += 1;
            last_ts = next_timestamp(last_ts);
            if let Some(status) = terminal_status(kind) {
                closed = Some(status);
            }
            let inserted = sqlx::query(
                "INSERT INTO history (namespace, workflow_id, run_id, seq, timestamp_ms, event_type, event_data) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&instance.namespace)
            .bind(&instance.workflow_id)
            .bind(&instance.run_id)
            .bind(seq as i64)
            .bind(last_ts as i64)
            .bind(kind.name())
            .bind(Self::encode(OP, kind)?)
            .execute(&mut *tx)
            .await;
            if let Err(e) = inserted {
                let msg = e.to_string();
                if Self::is_unique_violation(&msg) {
                    drop(tx);
                    let actual = self.last_seq(instance).await.unwrap_or(expected_last_seq + 1);
                    return Err(AppendError::Conflict {
                        expected: expected_last_seq,
                        actual,
                    });
                }
                return Err(Self::sqlx_to_provider_error(OP, e).into());
            }
        }

        match closed {
            Some((status, output)) => {
                sqlx::query(
                    "UPDATE instances SET last_seq = ?, updated_at = ?, status = ?, output = ?, closed_at = ? WHERE namespace = ? AND workflow_id = ? AND run_id = ?",
                )
                .bind(seq as i64)
                .bind(last_ts as i64)
                .bind(status.as_str())
                .bind(output)
                .bind(last_ts as i64)
                .bind(&instance.namespace)
                .bind(&instance.workflow_id)
                .bind(&instance.run_id)
                .execute(&mut *tx)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE instances SET last_seq = ?, updated_at = ? WHERE namespace = ? AND workflow_id = ? AND run_id = ?",
                )
                .bind(seq as i64)
                .bind(last_ts as i64)
                .bind(&instance.namespace)
                .bind(&instance.workflow_id)
                .bind(&instance.run_id)
                .execute(&mut *tx)
                .await
            }
        }
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        for task in &tasks {
            Self::push_task_in_tx(&mut tx, task).await?;
        }
        Self::commit(tx, OP).await?;
        Ok(seq)
    }

    async fn read_events(&self, instance: &InstanceId, from_seq: u64) -> Result<Vec<Event>, ProviderError> {
        const OP: &str = "read_events";
        let rows = sqlx::query(
            "SELECT seq, timestamp_ms, event_data FROM history WHERE namespace = ? AND workflow_id = ? AND run_id = ? AND seq >= ? ORDER BY seq",
        )
        .bind(&instance.namespace)
        .bind(&instance.workflow_id)
        .bind(&instance.run_id)
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        rows.iter()
            .map(|row| {
                let data: String = Self::column(row, "event_data", OP)?;
                Ok(Event {
                    seq: Self::column::<i64>(row, "seq", OP)? as u64,
                    timestamp_ms: Self::column::<i64>(row, "timestamp_ms", OP)? as u64,
                    kind: Self::decode(OP, &data)?,
                })
            })
            .collect()
    }

    async fn last_seq(&self, instance: &InstanceId) -> Result<u64, ProviderError> {
        let seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) FROM history WHERE namespace = ? AND workflow_id = ? AND run_id = ?",
        )
        .bind(&instance.namespace)
        .bind(&instance.workflow_id)
        .bind(&instance.run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("last_seq", e))?;
        Ok(seq as u64)
    }
}

#[async_trait::async_trait]
impl TaskQueue for SqliteProvider {
    async fn enqueue(&self, task: NewTask) -> Result<(), ProviderError> {
        let mut tx = self.begin("enqueue").await?;
        Self::push_task_in_tx(&mut tx, &task).await?;
        Self::commit(tx, "enqueue").await
    }

    async fn dequeue(&self, queue: &str, visibility: Duration) -> Result<Option<LeasedTask>, ProviderError> {
        const OP: &str = "dequeue";
        let now_ms = now_millis() as i64;
        let token = uuid::Uuid::new_v4().to_string();

        // One statement: the claim takes the write lock before anything is
        // read, so concurrent consumers queue on the busy timeout.
        let claimed = sqlx::query(
            r#"
            UPDATE tasks
            SET lock_token = ?1, locked_until = ?2, delivery_count = delivery_count + 1
            WHERE id = (
                SELECT id FROM tasks
                WHERE queue = ?3 AND visible_at <= ?4
                  AND (lock_token IS NULL OR locked_until <= ?4)
                ORDER BY id
                LIMIT 1
            )
            RETURNING task, delivery_count
            "#,
        )
        .bind(&token)
        .bind(now_ms + visibility.as_millis() as i64)
        .bind(queue)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let Some(row) = claimed else {
            return Ok(None);
        };

        let raw: String = Self::column(&row, "task", OP)?;
        let delivery_count: i64 = Self::column(&row, "delivery_count", OP)?;
        let kind: TaskKind = Self::decode(OP, &raw)?;
        Ok(Some(LeasedTask {
            kind,
            token,
            delivery_count: delivery_count as u32,
        }))
    }

    async fn ack(&self, token: &str) -> Result<(), ProviderError> {
        let result = sqlx::query("DELETE FROM tasks WHERE lock_token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack", e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent("ack", format!("unknown lock token {token}")));
        }
        Ok(())
    }

    async fn nack(&self, token: &str, options: NackOptions) -> Result<(), ProviderError> {
        let visible_at = now_millis() + options.delay.map(|d| d.as_millis() as u64).unwrap_or(0);
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET lock_token = NULL, locked_until = NULL, visible_at = ?1,
                delivery_count = CASE WHEN ?2 THEN MAX(delivery_count - 1, 0) ELSE delivery_count END
            WHERE lock_token = ?3
            "#,
        )
        .bind(visible_at as i64)
        .bind(options.ignore_attempt)
        .bind(token)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("nack", e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent("nack", format!("unknown lock token {token}")));
        }
        Ok(())
    }

    async fn extend_lease(&self, token: &str, visibility: Duration) -> Result<(), ProviderError> {
        let result = sqlx::query("UPDATE tasks SET locked_until = ? WHERE lock_token = ?")
            .bind((now_millis() + visibility.as_millis() as u64) as i64)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("extend_lease", e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "extend_lease",
                format!("unknown lock token {token}"),
            ));
        }
        Ok(())
    }

    async fn reschedule(&self, token: &str, next: NewTask) -> Result<(), ProviderError> {
        const OP: &str = "reschedule";
        let mut tx = self.begin(OP).await?;
        let removed = sqlx::query("DELETE FROM tasks WHERE lock_token = ?")
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        if removed.rows_affected() == 0 {
            return Err(ProviderError::permanent(OP, format!("unknown lock token {token}")));
        }
        Self::push_task_in_tx(&mut tx, &next).await?;
        Self::commit(tx, OP).await
    }

    async fn dead_letter(&self, token: &str, reason: &str) -> Result<(), ProviderError> {
        const OP: &str = "dead_letter";
        let mut tx = self.begin(OP).await?;
        let row = sqlx::query("SELECT id, queue, task, delivery_count FROM tasks WHERE lock_token = ?")
            .bind(token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
            .ok_or_else(|| ProviderError::permanent(OP, format!("unknown lock token {token}")))?;
        let id: i64 = Self::column(&row, "id", OP)?;
        sqlx::query("INSERT INTO dead_letters (queue, task, delivery_count, reason, dead_at) VALUES (?, ?, ?, ?, ?)")
            .bind(Self::column::<String>(&row, "queue", OP)?)
            .bind(Self::column::<String>(&row, "task", OP)?)
            .bind(Self::column::<i64>(&row, "delivery_count", OP)?)
            .bind(reason)
            .bind(now_millis() as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Self::commit(tx, OP).await
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, ProviderError> {
        const OP: &str = "list_dead_letters";
        let rows = sqlx::query("SELECT id, queue, task, delivery_count, reason, dead_at FROM dead_letters ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        rows.iter()
            .map(|row| {
                let raw: String = Self::column(row, "task", OP)?;
                Ok(DeadLetter {
                    id: Self::column::<i64>(row, "id", OP)? as u64,
                    queue: Self::column(row, "queue", OP)?,
                    kind: Self::decode(OP, &raw)?,
                    delivery_count: Self::column::<i64>(row, "delivery_count", OP)? as u32,
                    reason: Self::column(row, "reason", OP)?,
                    dead_at_ms: Self::column::<i64>(row, "dead_at", OP)? as u64,
                })
            })
            .collect()
    }

    async fn requeue_dead_letter(&self, id: u64) -> Result<bool, ProviderError> {
        const OP: &str = "requeue_dead_letter";
        let mut tx = self.begin(OP).await?;
        let raw: Option<String> = sqlx::query_scalar("SELECT task FROM dead_letters WHERE id = ?")
            .bind(id as i64)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let Some(raw) = raw else {
            return Ok(false);
        };
        let kind: TaskKind = Self::decode(OP, &raw)?;
        sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Self::push_task_in_tx(&mut tx, &NewTask::now(kind)).await?;
        Self::commit(tx, OP).await?;
        Ok(true)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, ProviderError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("queue_depth", e))?;
        Ok(count as u64)
    }
}

#[async_trait::async_trait]
impl LeaseStore for SqliteProvider {
    async fn acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<Option<Lease>, ProviderError> {
        const OP: &str = "acquire_lease";
        let now = now_millis();
        let expires_at_ms = now + ttl.as_millis() as u64;
        // Upsert in place: the holder keeps its token, a takeover of an
        // expired or released row bumps it, a live foreign lease is untouched.
        let token: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO leases (lease_key, owner, token, expires_at) VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(lease_key) DO UPDATE SET
                token = CASE WHEN leases.owner = excluded.owner THEN leases.token ELSE leases.token + 1 END,
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE leases.owner = excluded.owner OR leases.expires_at <= ?4
            RETURNING token
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(expires_at_ms as i64)
        .bind(now as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        Ok(token.map(|token| Lease {
            key: key.to_string(),
            owner: owner.to_string(),
            token: token as u64,
            expires_at_ms,
        }))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, ProviderError> {
        let expires_at_ms = now_millis() + ttl.as_millis() as u64;
        let result = sqlx::query("UPDATE leases SET expires_at = ? WHERE lease_key = ? AND owner = ? AND token = ?")
            .bind(expires_at_ms as i64)
            .bind(&lease.key)
            .bind(&lease.owner)
            .bind(lease.token as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("renew_lease", e))?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(Lease {
            expires_at_ms,
            ..lease.clone()
        }))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), ProviderError> {
        // The row stays so the next holder still gets a larger token.
        sqlx::query("UPDATE leases SET owner = '', expires_at = 0 WHERE lease_key = ? AND owner = ? AND token = ?")
            .bind(&lease.key)
            .bind(&lease.owner)
            .bind(lease.token as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("release_lease", e))?;
        Ok(())
    }

    async fn list_leases(&self, prefix: &str) -> Result<Vec<Lease>, ProviderError> {
        let rows = sqlx::query(
            "SELECT lease_key, owner, token, expires_at FROM leases WHERE substr(lease_key, 1, length(?1)) = ?1 AND expires_at > ?2 ORDER BY lease_key",
        )
        .bind(prefix)
        .bind(now_millis() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("list_leases", e))?;
        rows.iter().map(Self::row_to_lease).collect()
    }
}

#[async_trait::async_trait]
impl InstanceStore for SqliteProvider {
    async fn start_instance(&self, request: StartRequest) -> Result<StartOutcome, StartError> {
        const OP: &str = "start_instance";
        let mut tx = self.begin(OP).await?;
        let now = now_millis();

        let runs = sqlx::query(&format!(
            "SELECT {} FROM instances WHERE namespace = ? AND workflow_id = ? ORDER BY created_at",
            Self::INSTANCE_COLUMNS
        ))
        .bind(&request.instance.namespace)
        .bind(&request.instance.workflow_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let runs = runs.iter().map(Self::row_to_record).collect::<Result<Vec<_>, _>>()?;

        if runs.iter().any(|r| r.instance == request.instance) {
            return Ok(StartOutcome::Existing(request.instance));
        }
        if let Some(existing) = runs
            .iter()
            .find(|r| request.matches_existing(r.idempotency_key.as_deref(), r.created_at_ms, now))
        {
            return Ok(StartOutcome::Existing(existing.instance.clone()));
        }
        if let Some(open) = runs.iter().find(|r| r.status == StatusKind::Running) {
            return Err(StartError::AlreadyRunning(open.instance.clone()));
        }

        let parent = request
            .parent
            .as_ref()
            .map(|p| Self::encode(OP, p))
            .transpose()?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO instances (namespace, workflow_id, run_id, workflow_name, status, output, idempotency_key, parent, created_at, updated_at, closed_at, last_seq)
            VALUES (?, ?, ?, ?, 'Running', NULL, ?, ?, ?, ?, NULL, 1)
            "#,
        )
        .bind(&request.instance.namespace)
        .bind(&request.instance.workflow_id)
        .bind(&request.instance.run_id)
        .bind(&request.workflow_name)
        .bind(&request.idempotency_key)
        .bind(parent)
        .bind(now as i64)
        .bind(now as i64)
        .execute(&mut *tx)
        .await;
        if let Err(e) = inserted {
            if Self::is_unique_violation(&e.to_string()) {
                // Lost a race with a concurrent start of the same workflow id.
                drop(tx);
                let latest = self
                    .latest_run(&request.instance.namespace, &request.instance.workflow_id)
                    .await?;
                return Err(match latest {
                    Some(r) => StartError::AlreadyRunning(r.instance),
                    None => ProviderError::retryable(OP, "concurrent start").into(),
                });
            }
            return Err(Self::sqlx_to_provider_error(OP, e).into());
        }

        let started = request.started_event();
        sqlx::query(
            "INSERT INTO history (namespace, workflow_id, run_id, seq, timestamp_ms, event_type, event_data) VALUES (?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(&request.instance.namespace)
        .bind(&request.instance.workflow_id)
        .bind(&request.instance.run_id)
        .bind(now as i64)
        .bind(started.name())
        .bind(Self::encode(OP, &started)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        Self::push_task_in_tx(
            &mut tx,
            &NewTask::now(TaskKind::Workflow {
                instance: request.instance.clone(),
            }),
        )
        .await?;
        Self::commit(tx, OP).await?;
        Ok(StartOutcome::Created(request.instance))
    }

    async fn get_instance(&self, instance: &InstanceId) -> Result<Option<InstanceRecord>, ProviderError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM instances WHERE namespace = ? AND workflow_id = ? AND run_id = ?",
            Self::INSTANCE_COLUMNS
        ))
        .bind(&instance.namespace)
        .bind(&instance.workflow_id)
        .bind(&instance.run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("get_instance", e))?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn latest_run(&self, namespace: &str, workflow_id: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM instances WHERE namespace = ? AND workflow_id = ? ORDER BY created_at DESC, closed_at IS NULL DESC, rowid DESC LIMIT 1",
            Self::INSTANCE_COLUMNS
        ))
        .bind(namespace)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("latest_run", e))?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn update_status(
        &self,
        instance: &InstanceId,
        status: StatusKind,
        output: Option<String>,
    ) -> Result<(), ProviderError> {
        let now = now_millis() as i64;
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET status = ?1, output = ?2, updated_at = ?3,
                closed_at = CASE WHEN ?4 THEN COALESCE(closed_at, ?3) ELSE NULL END
            WHERE namespace = ?5 AND workflow_id = ?6 AND run_id = ?7
            "#,
        )
        .bind(status.as_str())
        .bind(output)
        .bind(now)
        .bind(status.is_terminal())
        .bind(&instance.namespace)
        .bind(&instance.workflow_id)
        .bind(&instance.run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("update_status", e))?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::permanent(
                "update_status",
                format!("instance not found: {instance}"),
            ));
        }
        Ok(())
    }

    async fn list_instances(&self, status: Option<StatusKind>) -> Result<Vec<InstanceRecord>, ProviderError> {
        let rows = match status {
            Some(s) => {
                sqlx::query(&format!(
                    "SELECT {} FROM instances WHERE status = ? ORDER BY created_at, namespace, workflow_id, run_id",
                    Self::INSTANCE_COLUMNS
                ))
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM instances ORDER BY created_at, namespace, workflow_id, run_id",
                    Self::INSTANCE_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| Self::sqlx_to_provider_error("list_instances", e))?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn purge_closed_before(&self, cutoff_ms: u64) -> Result<u64, ProviderError> {
        const OP: &str = "purge_closed_before";
        let mut tx = self.begin(OP).await?;
        sqlx::query(
            r#"
            DELETE FROM history WHERE EXISTS (
                SELECT 1 FROM instances i
                WHERE i.namespace = history.namespace AND i.workflow_id = history.workflow_id AND i.run_id = history.run_id
                  AND i.status != 'Running' AND i.closed_at IS NOT NULL AND i.closed_at < ?1
            )
            "#,
        )
        .bind(cutoff_ms as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let purged = sqlx::query(
            "DELETE FROM instances WHERE status != 'Running' AND closed_at IS NOT NULL AND closed_at < ?",
        )
        .bind(cutoff_ms as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Self::commit(tx, OP).await?;
        Ok(purged.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ACTIVITY_QUEUE, WORKFLOW_QUEUE};

    fn start_request(run: &str, key: Option<&str>) -> StartRequest {
        StartRequest {
            instance: InstanceId::new("ns", "wf", run),
            workflow_name: "w".into(),
            version: None,
            input: "in".into(),
            idempotency_key: key.map(String::from),
            idempotency_window: Some(Duration::from_secs(60)),
            parent: None,
            execution_timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn schema_is_idempotent_and_history_round_trips() {
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", td.path().join("t.db").display());
        let p = SqliteProvider::new(&url, None).await.unwrap();
        let id = InstanceId::new("ns", "wf", "r1");
        p.start_instance(start_request("r1", None)).await.unwrap();
        p.append_events(&id, 1, vec![EventKind::ActivationCompleted]).await.unwrap();
        drop(p);

        // Reopen: schema creation must tolerate existing tables.
        let p = SqliteProvider::new(&url, None).await.unwrap();
        let history = p.read(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].kind, EventKind::ActivationCompleted);
        assert!(history[1].timestamp_ms >= history[0].timestamp_ms);
    }

    #[tokio::test]
    async fn dequeue_skips_leased_tasks_until_they_expire() {
        let p = SqliteProvider::new_in_memory().await.unwrap();
        p.start_instance(start_request("r1", None)).await.unwrap();
        let first = p
            .dequeue(WORKFLOW_QUEUE, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.delivery_count, 1);
        assert!(p.dequeue(WORKFLOW_QUEUE, Duration::from_secs(1)).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(80)).await;
        let again = p
            .dequeue(WORKFLOW_QUEUE, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.delivery_count, 2);
        // The first token no longer owns the task.
        assert!(p.ack(&first.token).await.is_err());
        p.ack(&again.token).await.unwrap();
        assert_eq!(p.queue_depth(WORKFLOW_QUEUE).await.unwrap(), 0);
        assert_eq!(p.queue_depth(ACTIVITY_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn second_open_run_is_rejected_and_keys_deduplicate() {
        let p = SqliteProvider::new_in_memory().await.unwrap();
        let created = p.start_instance(start_request("r1", Some("k1"))).await.unwrap();
        assert!(matches!(created, StartOutcome::Created(_)));

        let dup = p.start_instance(start_request("r2", Some("k1"))).await.unwrap();
        assert_eq!(dup, StartOutcome::Existing(InstanceId::new("ns", "wf", "r1")));

        let err = p.start_instance(start_request("r3", Some("k2"))).await.unwrap_err();
        assert!(matches!(err, StartError::AlreadyRunning(i) if i.run_id == "r1"));
    }
}
