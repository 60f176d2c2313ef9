use std::sync::Arc;
use std::time::Duration;

/// Sink for client-side counters and timings.
///
/// Injected rather than global; the default implementation discards
/// everything, so instrumented code paths cost nothing unless a caller
/// installs a real sink.
pub trait TelemetrySink: Send + Sync {
    fn record_bytes(&self, _name: &'static str, _len: usize) {}
    fn record_duration(&self, _name: &'static str, _elapsed: Duration) {}
    fn record_count(&self, _name: &'static str, _value: u64) {}
}

#[derive(Default)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {}

pub fn noop() -> Arc<dyn TelemetrySink> {
    Arc::new(NoopSink)
}
