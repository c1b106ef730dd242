use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

type SinkFn = Box<dyn Fn(String) + Send + Sync>;

/// Swappable destination for captured log lines. The running job installs
/// its sink for the duration of its execution; the job gate guarantees at
/// most one installer at a time.
#[derive(Clone, Default)]
pub struct CaptureSink {
    inner: Arc<Mutex<Option<SinkFn>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, sink: SinkFn) {
        *lock_ignoring_poison(&self.inner) = Some(sink);
    }

    pub fn clear(&self) {
        *lock_ignoring_poison(&self.inner) = None;
    }

    pub fn is_active(&self) -> bool {
        lock_ignoring_poison(&self.inner).is_some()
    }

    pub fn emit(&self, line: String) {
        if let Some(sink) = lock_ignoring_poison(&self.inner).as_ref() {
            sink(line);
        }
    }
}

fn lock_ignoring_poison<T>(lock: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// `tracing` layer that tees formatted events into the active job's log
/// buffer. Replaces a global logger swap: the sink is injected per job and
/// the rest of the process keeps its normal subscriber stack.
pub struct JobLogLayer {
    sink: CaptureSink,
}

impl JobLogLayer {
    pub fn new(sink: CaptureSink) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for JobLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !self.sink.is_active() {
            return;
        }
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        self.sink
            .emit(format!("{} {}", event.metadata().level(), visitor.render()));
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: Vec<(&'static str, String)>,
}

impl LineVisitor {
    fn render(self) -> String {
        let mut line = self.message;
        for (name, value) in self.fields {
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(name);
            line.push('=');
            line.push_str(&value);
        }
        line
    }
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push((field.name(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }
}
