//! Runs the shared provider validation suite against every bundled provider.

use duraflow::provider_validation::{self, ProviderFactory};
use duraflow::providers::Provider;
use duraflow::providers::in_memory::InMemoryProvider;
use duraflow::providers::sqlite::SqliteProvider;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct InMemoryFactory;

#[async_trait::async_trait]
impl ProviderFactory for InMemoryFactory {
    async fn create_provider(&self) -> Arc<dyn Provider> {
        Arc::new(InMemoryProvider::new())
    }
}

struct SqliteMemoryFactory;

#[async_trait::async_trait]
impl ProviderFactory for SqliteMemoryFactory {
    async fn create_provider(&self) -> Arc<dyn Provider> {
        Arc::new(SqliteProvider::new_in_memory().await.unwrap())
    }
}

/// File-backed databases, one temp directory per provider.
#[derive(Default)]
struct SqliteFileFactory {
    dirs: Mutex<Vec<TempDir>>,
}

#[async_trait::async_trait]
impl ProviderFactory for SqliteFileFactory {
    async fn create_provider(&self) -> Arc<dyn Provider> {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("validation.db").display());
        self.dirs.lock().unwrap().push(dir);
        Arc::new(SqliteProvider::new(&url, None).await.unwrap())
    }
}

#[tokio::test]
async fn in_memory_provider_conforms() {
    provider_validation::run_all(&InMemoryFactory).await;
}

#[tokio::test]
async fn sqlite_memory_provider_conforms() {
    provider_validation::run_all(&SqliteMemoryFactory).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_file_provider_conforms() {
    provider_validation::run_all(&SqliteFileFactory::default()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_memory_compare_and_append_under_parallel_writers() {
    provider_validation::history::test_concurrent_appends_exactly_one_wins(&InMemoryFactory).await;
}
