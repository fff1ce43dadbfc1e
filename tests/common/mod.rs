#![allow(dead_code)]

pub mod tracing_capture;

use duraflow::providers::Provider;
use duraflow::providers::in_memory::InMemoryProvider;
use duraflow::providers::sqlite::SqliteProvider;
use duraflow::{Event, EventKind, InstanceId, RuntimeOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Options tuned for tests: short polls and backoffs.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep: Duration::from_millis(5),
        lease_contention_backoff: Duration::from_millis(10),
        unregistered_backoff: Duration::from_millis(50),
        node_heartbeat_interval: Duration::from_millis(100),
        activity_cancel_poll_interval: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn in_memory() -> Arc<dyn Provider> {
    Arc::new(InMemoryProvider::new())
}

pub async fn sqlite_in_memory() -> Arc<dyn Provider> {
    Arc::new(SqliteProvider::new_in_memory().await.unwrap())
}

pub async fn create_sqlite_store_disk() -> (Arc<dyn Provider>, TempDir, String) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("test.db");
    let db_url = format!("sqlite:{}", db_path.display());
    let store = Arc::new(SqliteProvider::new(&db_url, None).await.unwrap()) as Arc<dyn Provider>;
    (store, td, db_url)
}

/// Poll the history until `predicate` holds or `timeout_ms` passes.
pub async fn wait_for_history<F>(store: &Arc<dyn Provider>, instance: &InstanceId, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    wait_for_history_event(
        store,
        instance,
        |hist| if predicate(hist) { Some(()) } else { None },
        timeout_ms,
    )
    .await
    .is_some()
}

pub async fn wait_for_history_event<T, F>(
    store: &Arc<dyn Provider>,
    instance: &InstanceId,
    selector: F,
    timeout_ms: u64,
) -> Option<T>
where
    F: Fn(&[Event]) -> Option<T>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if let Some(found) = selector(&hist) {
            return Some(found);
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn count(history: &[Event], name: &str) -> usize {
    history.iter().filter(|e| e.kind.name() == name).count()
}

pub fn has_scheduled(history: &[Event], activity: &str) -> bool {
    history
        .iter()
        .any(|e| matches!(&e.kind, EventKind::ActivityScheduled { name, .. } if name == activity))
}

/// Sequence numbers start at 1 with no gaps; timestamps never decrease.
pub fn assert_well_formed(history: &[Event]) {
    for (idx, e) in history.iter().enumerate() {
        assert_eq!(e.seq, idx as u64 + 1, "gap in history: {history:#?}");
    }
    assert!(
        history.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms),
        "timestamps went backwards"
    );
}
