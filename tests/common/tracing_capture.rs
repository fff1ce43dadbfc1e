//! Records tracing events so tests can assert on what was logged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Dispatch, Subscriber, dispatcher};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone)]
pub struct LogLine {
    pub target: String,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

#[derive(Clone, Default)]
pub struct LogSink(Arc<Mutex<Vec<LogLine>>>);

impl LogSink {
    /// Lines under `target` whose `field` equals `value`.
    pub fn count(&self, target: &str, field: &str, value: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.target == target && l.fields.get(field).map(|v| v.trim_matches('"')) == Some(value))
            .count()
    }
}

struct Fields<'a>(&'a mut BTreeMap<String, String>);

impl Visit for Fields<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

impl<S: Subscriber> Layer<S> for LogSink {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = BTreeMap::new();
        event.record(&mut Fields(&mut fields));
        let message = fields.get("message").cloned().unwrap_or_default();
        self.0.lock().unwrap().push(LogLine {
            target: event.metadata().target().to_string(),
            message,
            fields,
        });
    }
}

/// Capture every event on the current thread until the guard is dropped.
/// Use with a current-thread test runtime so spawned tasks are seen too.
pub fn capture() -> (LogSink, dispatcher::DefaultGuard) {
    let sink = LogSink::default();
    let collector = tracing_subscriber::registry()
        .with(sink.clone())
        .with(LevelFilter::TRACE);
    let guard = dispatcher::set_default(&Dispatch::new(collector));
    (sink, guard)
}
