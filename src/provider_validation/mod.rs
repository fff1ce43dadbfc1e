//! Provider validation suite
//!
//! Reusable checks that any [`Provider`] implementation must pass. Each
//! group exposes a `run_tests` entry point plus the individual test functions
//! for finer-grained debugging. Failures panic, so call them from a test.
//!
//! ```rust,ignore
//! use duraflow::provider_validation::{self, ProviderFactory};
//! use duraflow::providers::Provider;
//! use std::sync::Arc;
//!
//! struct MyProviderFactory;
//!
//! #[async_trait::async_trait]
//! impl ProviderFactory for MyProviderFactory {
//!     async fn create_provider(&self) -> Arc<dyn Provider> {
//!         Arc::new(MyProvider::connect().await.unwrap())
//!     }
//! }
//!
//! #[tokio::test]
//! async fn my_provider_conforms() {
//!     provider_validation::run_all(&MyProviderFactory).await;
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::providers::{Provider, StartRequest};
use crate::InstanceId;

pub mod history;
pub mod instances;
pub mod leases;
pub mod queue_semantics;

/// Creates fresh, isolated providers for the validation tests.
#[async_trait::async_trait]
pub trait ProviderFactory: Send + Sync {
    /// Each call must return a provider with no state shared with earlier calls.
    async fn create_provider(&self) -> Arc<dyn Provider>;

    /// Visibility timeout used where a test waits for a lock to expire.
    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(200)
    }
}

/// Run every validation group.
pub async fn run_all<F: ProviderFactory>(factory: &F) {
    history::run_tests(factory).await;
    queue_semantics::run_tests(factory).await;
    leases::run_tests(factory).await;
    instances::run_tests(factory).await;
}

pub(crate) fn instance(workflow_id: &str) -> InstanceId {
    InstanceId::new("validation", workflow_id, "run-1")
}

pub(crate) fn start_request(instance: &InstanceId) -> StartRequest {
    StartRequest {
        instance: instance.clone(),
        workflow_name: "ValidationWorkflow".to_string(),
        version: None,
        input: "{}".to_string(),
        idempotency_key: None,
        idempotency_window: None,
        parent: None,
        execution_timeout_ms: None,
    }
}

/// Start `instance` and drain the workflow task its start enqueued.
pub(crate) async fn create_instance(provider: &dyn Provider, instance: &InstanceId) {
    provider
        .start_instance(start_request(instance))
        .await
        .unwrap_or_else(|e| panic!("start_instance failed: {e}"));
    let task = provider
        .dequeue(crate::providers::WORKFLOW_QUEUE, Duration::from_secs(30))
        .await
        .unwrap_or_else(|e| panic!("dequeue failed: {e}"))
        .unwrap_or_else(|| panic!("start did not enqueue a workflow task"));
    provider
        .ack(&task.token)
        .await
        .unwrap_or_else(|e| panic!("ack failed: {e}"));
}
