//! Charge a card through a flaky gateway and show the durable history.
//!
//! ```text
//! charge-cli [AMOUNT] [DB_PATH]
//! ```
//!
//! Running it twice against the same database with the same amount finds the
//! earlier run through its idempotency key instead of charging again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use duraflow::logging::{LogFormat, init_logging};
use duraflow::providers::Provider;
use duraflow::providers::sqlite::SqliteProvider;
use duraflow::{
    ActivityContext, ActivityRegistry, BackoffStrategy, Client, InstanceStatus, RetryPolicy, Runtime, RuntimeOptions,
    WorkflowContext, WorkflowRegistry, durable_info,
};

const FAILURES_BEFORE_SUCCESS: u32 = 2;

async fn payment(ctx: WorkflowContext, amount: String) -> Result<String, String> {
    durable_info!(ctx, amount = %amount, "charging customer");
    let policy = RetryPolicy::new(3).with_backoff(BackoffStrategy::Fixed {
        delay: Duration::from_millis(200),
    });
    let receipt = ctx
        .schedule_activity_with_retry("charge", amount, policy)
        .await
        .map_err(|e| e.to_string())?;
    durable_info!(ctx, receipt = %receipt, "payment captured");
    Ok(receipt)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(LogFormat::Compact, "info,duraflow=info");

    let mut args = std::env::args().skip(1);
    let amount = args.next().unwrap_or_else(|| "100".to_string());
    let db_path = args.next().unwrap_or_else(|| "./duraflow-data.db".to_string());

    let store: Arc<dyn Provider> = Arc::new(
        SqliteProvider::new(&format!("sqlite:{db_path}"), None)
            .await
            .with_context(|| format!("opening {db_path}"))?,
    );

    let calls = Arc::new(AtomicU32::new(0));
    let gateway_calls = calls.clone();
    let activities = ActivityRegistry::builder()
        .register("charge", move |ctx: ActivityContext, amount: String| {
            let calls = gateway_calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= FAILURES_BEFORE_SUCCESS {
                    ctx.trace_warn(format!("gateway timeout on attempt {}", ctx.attempt()));
                    return Err("gateway timeout".to_string());
                }
                Ok(format!("receipt-{amount}-{}", ctx.idempotency_key()))
            }
        })
        .build();
    let workflows = WorkflowRegistry::builder().register("payment", payment).build();

    let rt = Runtime::start_with_options(store.clone(), Arc::new(activities), workflows, RuntimeOptions::default()).await;
    let client = Client::new(store.clone());
    let key = format!("charge-{amount}");
    let instance = client
        .submit("billing", &key, Some(&key), "payment", amount.clone())
        .await?;
    println!("instance: {instance}");

    let status = client.wait_for_completion(&instance, Duration::from_secs(30)).await?;
    match &status {
        InstanceStatus::Completed { output } => println!("completed: {output}"),
        other => println!("finished with {other:?}"),
    }
    println!("gateway calls in this process: {}", calls.load(Ordering::SeqCst));

    for event in client.read_history(&instance).await? {
        println!("{:>4}  {}", event.seq, event.kind.describe());
    }

    rt.shutdown().await;
    Ok(())
}
