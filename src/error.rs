//! Error types for the automation engine
//!
//! Errors are classified by where they surface:
//! - Builder/usage errors: synchronous, local to the offending call
//! - Graph errors: construction-time, fatal; the graph refuses to seal
//! - Push errors: rejected at ingestion, sensor-local, no partial propagation
//! - Evaluation failures: neuron-local, isolated per wave, reported as diagnostics
//! - Sink errors: transient backpressure, bounded pause, never data loss

use thiserror::Error;

use crate::signal::SignalKind;

/// Errors raised by `EventBuilder` and the `Impact` parsing boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("event name must be non-empty")]
    InvalidEventName,

    #[error("builder already consumed; each EventBuilder produces exactly one Event")]
    BuilderAlreadyConsumed,

    #[error("unknown impact level: {0}")]
    InvalidImpact(String),
}

/// Construction-time graph errors. Any of these means the graph cannot seal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle detected through node '{0}'")]
    CycleDetected(String),

    #[error("node '{0}' is registered more than once")]
    DuplicateNode(String),

    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("neuron '{0}' declares no dependencies")]
    NoDependencies(String),
}

/// Errors rejecting a sensor push at the ingestion boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("sensor '{sensor}' expects a {expected} value, got {actual}")]
    SignalTypeMismatch {
        sensor: String,
        expected: SignalKind,
        actual: SignalKind,
    },

    #[error("unknown sensor: {0}")]
    UnknownSensor(String),

    #[error("engine is shutting down")]
    EngineClosed,
}

/// A per-wave evaluation failure for a single neuron.
///
/// Raised by the neuron itself (`Failed`) or synthesized by the scheduler
/// when an evaluation times out, panics, or is still running from a
/// previous wave. Never aborts the wave.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalFailure {
    #[error("evaluation failed: {0}")]
    Failed(String),

    #[error("evaluation timed out after {0} ms")]
    TimedOut(u64),

    #[error("evaluation panicked")]
    Panicked,

    #[error("previous evaluation still running")]
    Busy,
}

impl EvalFailure {
    /// Convenience constructor for neuron code: `Err(EvalFailure::msg("..."))`.
    pub fn msg(reason: impl Into<String>) -> Self {
        EvalFailure::Failed(reason.into())
    }

    /// True when the failure was imposed by the scheduler rather than
    /// returned by the neuron's own evaluation logic.
    pub fn is_scheduler_imposed(&self) -> bool {
        matches!(
            self,
            EvalFailure::TimedOut(_) | EvalFailure::Panicked | EvalFailure::Busy
        )
    }
}

/// Lets neuron code use `?` when assembling events.
impl From<EventError> for EvalFailure {
    fn from(e: EventError) -> Self {
        EvalFailure::Failed(e.to_string())
    }
}

/// Errors returned by an event sink during batch handoff.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The value is the sink's configured capacity in batches.
    #[error("sink at capacity ({0} batch(es))")]
    Backpressure(usize),

    #[error("sink closed")]
    Closed,
}

impl SinkError {
    /// Transient errors are retried after a bounded pause; ingestion is
    /// paused while retrying so no data is lost.
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Backpressure(_))
    }
}
