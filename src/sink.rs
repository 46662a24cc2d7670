//! Event delivery and the diagnostics side-channel.
//!
//! The engine never knows where events go: it holds an injected `EventSink`
//! and offers each wave's ordered batch to it without blocking. A sink that
//! cannot keep up answers with `SinkError::Backpressure` and the runtime
//! slows ingestion rather than dropping anything. Operational trouble
//! (evaluation failures, backpressure notices) travels on the separate
//! `DiagnosticSink` so it never mixes with domain events.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::SinkError;
use crate::event::{Event, Impact};

/// One wave's events, in their stable drain order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveBatch {
    pub wave: u64,
    pub events: Vec<Event>,
}

/// Operational signals about the engine itself. Not events: diagnostics
/// describe the machinery, events describe the domain.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Diagnostic {
    /// A neuron's evaluation failed, panicked, timed out, or was still busy.
    #[serde(rename_all = "camelCase")]
    EvaluationFailed {
        node: String,
        wave: u64,
        reason: String,
    },
    /// The event sink refused a batch; ingestion is being slowed.
    #[serde(rename_all = "camelCase")]
    SinkBackpressure { wave: u64, capacity: usize },
    /// The event sink is gone for good; the engine is shutting down.
    SinkClosed,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Destination for wave batches. `offer` must not block: a sink that is
/// full answers `Backpressure` and the caller retains the batch for retry.
pub trait EventSink: Send + Sync {
    fn offer(&self, batch: &WaveBatch) -> Result<(), SinkError>;
}

/// Destination for diagnostics. Delivery is best-effort; implementations
/// must not fail or block.
pub trait DiagnosticSink: Send + Sync {
    fn diagnostic(&self, diagnostic: Diagnostic);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn offer(&self, batch: &WaveBatch) -> Result<(), SinkError> {
        (**self).offer(batch)
    }
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for Arc<S> {
    fn diagnostic(&self, diagnostic: Diagnostic) {
        (**self).diagnostic(diagnostic)
    }
}

// ---------------------------------------------------------------------------
// Built-in sinks
// ---------------------------------------------------------------------------

/// Sink that writes every event to the log and never backpressures.
/// Severe impacts log at warn so they stand out in operator output.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn offer(&self, batch: &WaveBatch) -> Result<(), SinkError> {
        for event in &batch.events {
            if event.impact >= Impact::Major {
                log::warn!(
                    "[wave {}] {} ({}) from {}",
                    batch.wave,
                    event.name,
                    event.impact,
                    event.origin.as_deref().unwrap_or("-")
                );
            } else {
                log::info!(
                    "[wave {}] {} ({}) from {}",
                    batch.wave,
                    event.name,
                    event.impact,
                    event.origin.as_deref().unwrap_or("-")
                );
            }
        }
        Ok(())
    }
}

impl DiagnosticSink for LogSink {
    fn diagnostic(&self, diagnostic: Diagnostic) {
        log::warn!("engine diagnostic: {:?}", diagnostic);
    }
}

/// Sink backed by a bounded tokio channel, for consumers that process
/// batches asynchronously. A full channel reports backpressure instead of
/// queuing without bound.
pub struct ChannelSink {
    tx: mpsc::Sender<WaveBatch>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<WaveBatch>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn offer(&self, batch: &WaveBatch) -> Result<(), SinkError> {
        match self.tx.try_send(batch.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(SinkError::Backpressure(self.tx.max_capacity()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }
}

/// In-memory sink that accumulates batches and diagnostics. Handy in tests
/// and for embedders that poll instead of subscribing.
#[derive(Default)]
pub struct CollectSink {
    batches: parking_lot::Mutex<Vec<WaveBatch>>,
    diagnostics: parking_lot::Mutex<Vec<Diagnostic>>,
}

impl CollectSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batches(&self) -> Vec<WaveBatch> {
        self.batches.lock().clone()
    }

    /// All events across all batches, preserving batch order.
    pub fn events(&self) -> Vec<Event> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.events.iter().cloned())
            .collect()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }
}

impl EventSink for CollectSink {
    fn offer(&self, batch: &WaveBatch) -> Result<(), SinkError> {
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}

impl DiagnosticSink for CollectSink {
    fn diagnostic(&self, diagnostic: Diagnostic) {
        self.diagnostics.lock().push(diagnostic);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBuilder;

    fn batch(wave: u64, names: &[&str]) -> WaveBatch {
        let events = names
            .iter()
            .map(|n| {
                EventBuilder::new(n)
                    .expect("builder")
                    .build()
                    .expect("build")
            })
            .collect();
        WaveBatch { wave, events }
    }

    #[test]
    fn test_collect_sink_preserves_batch_order() {
        let sink = CollectSink::new();
        sink.offer(&batch(1, &["a", "b"])).expect("offer");
        sink.offer(&batch(2, &["c"])).expect("offer");

        let names: Vec<String> = sink.events().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(sink.batches()[1].wave, 2);
    }

    #[test]
    fn test_channel_sink_reports_backpressure_when_full() {
        let (sink, mut rx) = ChannelSink::bounded(1);
        sink.offer(&batch(1, &["a"])).expect("first fits");

        let err = sink.offer(&batch(2, &["b"])).unwrap_err();
        assert_eq!(err, SinkError::Backpressure(1));
        assert!(err.is_transient());

        // Draining frees capacity; the retained batch goes through intact.
        let first = rx.blocking_recv().expect("recv");
        assert_eq!(first.wave, 1);
        sink.offer(&batch(2, &["b"])).expect("retry succeeds");
    }

    #[test]
    fn test_channel_sink_closed_is_terminal() {
        let (sink, rx) = ChannelSink::bounded(1);
        drop(rx);
        let err = sink.offer(&batch(1, &["a"])).unwrap_err();
        assert_eq!(err, SinkError::Closed);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_diagnostic_serializes_tagged() {
        let d = Diagnostic::EvaluationFailed {
            node: "hot-mean".to_string(),
            wave: 7,
            reason: "evaluation panicked".to_string(),
        };
        let json = serde_json::to_value(&d).expect("serialize");
        assert_eq!(json["type"], "evaluationFailed");
        assert_eq!(json["node"], "hot-mean");
        assert_eq!(json["wave"], 7);
    }
}
