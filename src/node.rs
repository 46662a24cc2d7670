//! Graph node contracts: sensors, neurons, and their evaluation surface.

use serde::{Deserialize, Serialize};

use crate::error::EvalFailure;
use crate::event::Event;
use crate::signal::{Signal, SignalKind, SignalValue};

/// Declared shape of a sensor: a stable id plus the value kind it accepts.
///
/// Sensors own no upstream dependencies and never build events; their sole
/// responsibility is translating an external occurrence into a signal push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSpec {
    pub name: String,
    pub kind: SignalKind,
}

/// What happens to a neuron's direct dependents in the wave where it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Direct dependents are skipped for the rest of the wave, even if
    /// another of their upstreams updated.
    #[default]
    SuppressDependents,
    /// Direct dependents still evaluate; the failed neuron simply has no new
    /// output, so its slot reflects whatever was last known (or absent).
    PropagateAbsent,
}

/// The latest known upstream signals for one evaluation.
///
/// One slot per declared dependency, in declaration order. A slot is `None`
/// when that upstream has not produced a value yet; each neuron defines its
/// own policy for that case (postpone, fail closed, use a default).
#[derive(Debug, Clone)]
pub struct Inputs {
    node: String,
    wave: u64,
    slots: Vec<(String, Option<Signal>)>,
}

impl Inputs {
    pub(crate) fn new(node: String, wave: u64, slots: Vec<(String, Option<Signal>)>) -> Self {
        Self { node, wave, slots }
    }

    /// The registered id of the neuron being evaluated. Useful for stamping
    /// event origins.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Logical time of the current propagation wave.
    pub fn wave(&self) -> u64 {
        self.wave
    }

    /// Latest signal from a declared dependency, if it has produced one.
    pub fn get(&self, dependency: &str) -> Option<&Signal> {
        self.slots
            .iter()
            .find(|(name, _)| name == dependency)
            .and_then(|(_, signal)| signal.as_ref())
    }

    /// Shorthand for `get(dep).map(|s| &s.value)`.
    pub fn value(&self, dependency: &str) -> Option<&SignalValue> {
        self.get(dependency).map(|signal| &signal.value)
    }

    /// True when every declared dependency has produced at least one value.
    pub fn all_present(&self) -> bool {
        self.slots.iter().all(|(_, signal)| signal.is_some())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Signal>)> {
        self.slots
            .iter()
            .map(|(name, signal)| (name.as_str(), signal.as_ref()))
    }
}

/// Everything a neuron produced for one wave.
///
/// All outputs flow through this value: a neuron communicates events only
/// through its return, never through ambient mutation.
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Derived signal, propagated to the next depth within the same wave.
    pub derived: Option<SignalValue>,
    /// Events to hand to the output sink, in emission order.
    pub events: Vec<Event>,
}

impl Evaluation {
    /// No derived signal, no events. The usual "postpone" outcome.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Derive a signal with no events.
    pub fn derive(value: impl Into<SignalValue>) -> Self {
        Self {
            derived: Some(value.into()),
            events: Vec::new(),
        }
    }

    /// Emit a single event with no derived signal.
    pub fn event(event: Event) -> Self {
        Self {
            derived: None,
            events: vec![event],
        }
    }

    /// Attach an event to this evaluation.
    pub fn with_event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }
}

/// A graph node that consumes upstream signals and computes a derived signal
/// and/or events.
///
/// Internal state (rolling windows, thresholds) is exclusively owned by the
/// neuron and invisible to others. Evaluation is expected to be non-blocking
/// and bounded; any external I/O must go through the neuron's own private
/// resource with its own timeout. The scheduler imposes a per-evaluation
/// timeout and treats overruns as failures.
pub trait Neuron: Send {
    fn evaluate(&mut self, inputs: &Inputs) -> Result<Evaluation, EvalFailure>;
}

/// Closure adapter so small neurons don't need a named struct.
pub struct FnNeuron<F>(F);

impl<F> Neuron for FnNeuron<F>
where
    F: FnMut(&Inputs) -> Result<Evaluation, EvalFailure> + Send,
{
    fn evaluate(&mut self, inputs: &Inputs) -> Result<Evaluation, EvalFailure> {
        (self.0)(inputs)
    }
}

/// Wrap a closure as a neuron.
pub fn neuron_fn<F>(f: F) -> FnNeuron<F>
where
    F: FnMut(&Inputs) -> Result<Evaluation, EvalFailure> + Send,
{
    FnNeuron(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn signal(source: &str, value: SignalValue) -> Signal {
        Signal {
            source: source.to_string(),
            value,
            timestamp: Utc::now(),
            wave: 1,
        }
    }

    #[test]
    fn test_inputs_lookup_and_absence() {
        let inputs = Inputs::new(
            "fusion".to_string(),
            1,
            vec![
                ("temp".to_string(), Some(signal("temp", SignalValue::Float(21.5)))),
                ("humidity".to_string(), None),
            ],
        );

        assert_eq!(inputs.node(), "fusion");
        assert_eq!(inputs.wave(), 1);
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs.value("temp"), Some(&SignalValue::Float(21.5)));
        assert!(inputs.get("humidity").is_none());
        assert!(inputs.get("pressure").is_none());
        assert!(!inputs.all_present());
    }

    #[test]
    fn test_inputs_iter_preserves_declaration_order() {
        let inputs = Inputs::new(
            "n".to_string(),
            3,
            vec![
                ("b".to_string(), None),
                ("a".to_string(), Some(signal("a", SignalValue::Int(1)))),
            ],
        );
        let names: Vec<&str> = inputs.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_evaluation_constructors() {
        let silent = Evaluation::silent();
        assert!(silent.derived.is_none());
        assert!(silent.events.is_empty());

        let derived = Evaluation::derive(0.75);
        assert_eq!(derived.derived, Some(SignalValue::Float(0.75)));

        let event = crate::event::EventBuilder::new("tick")
            .expect("builder")
            .build()
            .expect("build");
        let with_event = Evaluation::derive(1i64).with_event(event);
        assert_eq!(with_event.events.len(), 1);
    }

    #[test]
    fn test_neuron_fn_adapter() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_c = calls.clone();
        let mut neuron = neuron_fn(move |inputs: &Inputs| {
            calls_c.fetch_add(1, Ordering::SeqCst);
            match inputs.value("temp").and_then(SignalValue::as_float) {
                Some(t) if t > 30.0 => Ok(Evaluation::derive(true)),
                Some(_) => Ok(Evaluation::derive(false)),
                None => Ok(Evaluation::silent()),
            }
        });

        let hot = Inputs::new(
            "overheat".to_string(),
            1,
            vec![("temp".to_string(), Some(signal("temp", SignalValue::Float(31.0))))],
        );
        let result = neuron.evaluate(&hot).expect("evaluate");
        assert_eq!(result.derived, Some(SignalValue::Bool(true)));

        let absent = Inputs::new("overheat".to_string(), 2, vec![("temp".to_string(), None)]);
        let result = neuron.evaluate(&absent).expect("evaluate");
        assert!(result.derived.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
