// ABOUTME: Dual-sink telemetry: metrics recorder plus structured signal fan-out
// ABOUTME: Both sinks are fire-and-forget and never back-pressure producers

use std::sync::Arc;

use metrics::counter;
use tokio::sync::broadcast;

use switchboard_core::events::Signal;

const SIGNAL_CHANNEL_CAPACITY: usize = 1024;

struct Inner {
    instance_id: String,
    signal_tx: broadcast::Sender<Signal>,
}

/// Telemetry hub for one messaging instance. A single `emit` call feeds the
/// process-wide metrics recorder and every signal subscriber.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

impl Telemetry {
    pub fn new(instance_id: impl Into<String>) -> Self {
        let (signal_tx, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner { instance_id: instance_id.into(), signal_tx }),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Subscribe to the structured signal stream. Slow subscribers lag and
    /// lose signals rather than slowing producers.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.inner.signal_tx.subscribe()
    }

    /// The signal stream as a `Stream`, for observers built on combinators.
    pub fn signal_stream(&self) -> tokio_stream::wrappers::BroadcastStream<Signal> {
        tokio_stream::wrappers::BroadcastStream::new(self.subscribe())
    }

    /// Emit a telemetry event with no subject or correlation.
    pub fn emit(&self, event_name: &'static str, data: serde_json::Value) {
        self.emit_signal(Signal::new(event_name, &self.inner.instance_id, data), event_name);
    }

    /// Emit a telemetry event about a room, correlated to a message or job id.
    pub fn emit_correlated(
        &self,
        event_name: &'static str,
        subject: Option<&str>,
        correlation_id: &str,
        data: serde_json::Value,
    ) {
        let mut signal = Signal::new(event_name, &self.inner.instance_id, data)
            .with_correlation(correlation_id);
        if let Some(subject) = subject {
            signal = signal.with_subject(subject);
        }
        self.emit_signal(signal, event_name);
    }

    fn emit_signal(&self, signal: Signal, event_name: &'static str) {
        counter!("switchboard_events_total", "event" => event_name).increment(1);
        tracing::trace!(event = event_name, subject = ?signal.subject, "telemetry event");
        // No receivers is not an error
        let _ = self.inner.signal_tx.send(signal);
    }
}
