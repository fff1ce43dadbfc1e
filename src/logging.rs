//! Logging setup and replay-aware workflow logging.
//!
//! Workflow code runs again every time its history is replayed. The
//! `durable_*` macros only emit while the engine is executing new decisions,
//! so each line appears once per logical execution:
//!
//! ```rust,ignore
//! durable_info!(ctx, amount = 100, "charging customer");
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Output format for [`init_logging`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    #[default]
    Compact,
}

/// Install a global subscriber. `RUST_LOG` overrides `default_filter`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging(format: LogFormat, default_filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact().with_target(true)).try_init(),
    };
    result.is_ok()
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::debug!(target: "duraflow::workflow", instance = %$ctx.instance(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(target: "duraflow::workflow", instance = %$ctx.instance(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(target: "duraflow::workflow", instance = %$ctx.instance(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(target: "duraflow::workflow", instance = %$ctx.instance(), $($arg)+);
        }
    }};
}
