//! The automation graph: arena of sensors and neurons, sealing, and the
//! synchronous wave runner.
//!
//! Nodes live in an arena with integer indices and edges as index lists, so
//! there are no pointer cycles to manage. Registration is open until
//! `seal()`, which validates names, resolves dependencies, computes the
//! topological order and dependency depths once, and caches them. After
//! sealing the topology is immutable; only signal values and the pending
//! push queue are wave-to-wave mutable state, owned exclusively by the graph.
//!
//! A wave runs Collect → Order → Evaluate → Propagate → Drain: pending
//! sensor pushes close into a fixed input set, affected neurons evaluate in
//! dependency order (unaffected neurons are skipped entirely), derived
//! signals feed the next depth within the same wave, and all events drain as
//! one batch ordered by depth, then declaration order within a depth.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{EvalFailure, GraphError, PushError};
use crate::event::Event;
use crate::node::{Evaluation, FailurePolicy, Inputs, Neuron, SensorSpec};
use crate::signal::{Signal, SignalKind, SignalValue};
use crate::sink::Diagnostic;

/// Shared handle to a neuron's exclusively-owned state. The mutex is only
/// contended when a timed-out evaluation is still running from a previous
/// wave, in which case the new wave reports `Busy` instead of blocking.
pub(crate) type NeuronCell = Arc<Mutex<Box<dyn Neuron>>>;

/// Acknowledgement that a push was accepted for the next wave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub sensor: String,
}

/// Everything one wave produced, in stable order.
#[derive(Debug)]
pub struct WaveOutcome {
    pub wave: u64,
    /// Ordered by increasing dependency depth, then declaration order.
    pub events: Vec<Event>,
    /// Evaluation failures, distinct from the event stream.
    pub diagnostics: Vec<Diagnostic>,
    /// Node ids evaluated this wave, in evaluation order (includes failures).
    pub evaluated: Vec<String>,
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

enum NodeKind {
    Sensor { kind: SignalKind },
    Neuron { cell: NeuronCell, policy: FailurePolicy },
}

struct Node {
    name: String,
    /// Upstream indices. Empty for sensors; fixed for the node's lifetime.
    deps: Vec<usize>,
    dependents: Vec<usize>,
    /// Sensors sit at depth 0; a neuron's depth is 1 + max depth of its deps.
    depth: usize,
    kind: NodeKind,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

struct PendingNeuron {
    name: String,
    deps: Vec<String>,
    policy: Option<FailurePolicy>,
    neuron: Box<dyn Neuron>,
}

/// Open registration surface for sensors and neurons. Dependencies may
/// reference nodes registered later; everything is validated at `seal()`.
#[derive(Default)]
pub struct GraphBuilder {
    sensors: Vec<SensorSpec>,
    neurons: Vec<PendingNeuron>,
    fallback_policy: FailurePolicy,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fallback failure policy for neurons registered without an explicit
    /// one. Typically wired from `EngineConfig::default_failure_policy`.
    pub fn default_policy(&mut self, policy: FailurePolicy) -> &mut Self {
        self.fallback_policy = policy;
        self
    }

    /// Register a sensor by stable name and declared value kind.
    pub fn sensor(&mut self, name: &str, kind: SignalKind) -> &mut Self {
        self.sensors.push(SensorSpec {
            name: name.to_string(),
            kind,
        });
        self
    }

    /// Register a neuron with its fixed upstream dependency set.
    pub fn neuron(&mut self, name: &str, deps: &[&str], neuron: impl Neuron + 'static) -> &mut Self {
        self.neurons.push(PendingNeuron {
            name: name.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            policy: None,
            neuron: Box::new(neuron),
        });
        self
    }

    /// Register a neuron with an explicit failure policy for its dependents.
    pub fn neuron_with_policy(
        &mut self,
        name: &str,
        deps: &[&str],
        policy: FailurePolicy,
        neuron: impl Neuron + 'static,
    ) -> &mut Self {
        self.neurons.push(PendingNeuron {
            name: name.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            policy: Some(policy),
            neuron: Box::new(neuron),
        });
        self
    }

    /// Validate the registered topology and freeze it.
    ///
    /// Fails with `DuplicateNode`, `UnknownDependency`, `NoDependencies`
    /// (a neuron with no upstreams could never be due), or `CycleDetected`
    /// (a cycle has no topological order, so the graph refuses to seal).
    pub fn seal(self) -> Result<AutomationGraph, GraphError> {
        let fallback = self.fallback_policy;

        // Index every name first so dependencies can reference nodes
        // registered in any order.
        let mut index: HashMap<String, usize> = HashMap::new();
        let total = self.sensors.len() + self.neurons.len();
        for (i, name) in self
            .sensors
            .iter()
            .map(|s| &s.name)
            .chain(self.neurons.iter().map(|n| &n.name))
            .enumerate()
        {
            if index.insert(name.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode(name.clone()));
            }
        }

        // Build the arena: sensors first, then neurons in declaration order.
        let mut nodes: Vec<Node> = Vec::with_capacity(total);
        for spec in self.sensors {
            nodes.push(Node {
                name: spec.name,
                deps: Vec::new(),
                dependents: Vec::new(),
                depth: 0,
                kind: NodeKind::Sensor { kind: spec.kind },
            });
        }
        for pending in self.neurons {
            // A neuron with no upstreams could never be due for a wave;
            // reject it here rather than leaving it at sensor depth.
            if pending.deps.is_empty() {
                return Err(GraphError::NoDependencies(pending.name));
            }
            let mut deps = Vec::with_capacity(pending.deps.len());
            for dep in &pending.deps {
                let dep_idx = *index.get(dep).ok_or_else(|| GraphError::UnknownDependency {
                    node: pending.name.clone(),
                    dependency: dep.clone(),
                })?;
                deps.push(dep_idx);
            }
            nodes.push(Node {
                name: pending.name,
                deps,
                dependents: Vec::new(),
                depth: 0,
                kind: NodeKind::Neuron {
                    cell: Arc::new(Mutex::new(pending.neuron)),
                    policy: pending.policy.unwrap_or(fallback),
                },
            });
        }

        // Reverse edges.
        for i in 0..nodes.len() {
            for d in nodes[i].deps.clone() {
                nodes[d].dependents.push(i);
            }
        }

        // Kahn's algorithm: topological order + dependency depth in one pass.
        let mut indegree: Vec<usize> = nodes.iter().map(|n| n.deps.len()).collect();
        let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
        let mut processed = 0usize;
        while let Some(i) = queue.pop_front() {
            processed += 1;
            let depth = nodes[i]
                .deps
                .iter()
                .map(|&d| nodes[d].depth + 1)
                .max()
                .unwrap_or(0);
            nodes[i].depth = depth;
            for d in nodes[i].dependents.clone() {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }
        if processed < nodes.len() {
            // Every unprocessed node sits on (or downstream of) a cycle;
            // name the first one registered for a stable error.
            let on_cycle = indegree
                .iter()
                .position(|&d| d > 0)
                .map(|i| nodes[i].name.clone())
                .unwrap_or_default();
            return Err(GraphError::CycleDetected(on_cycle));
        }

        // Cache neuron evaluation levels: levels[d] holds neurons at depth
        // d + 1, in declaration order.
        let max_depth = nodes.iter().map(|n| n.depth).max().unwrap_or(0);
        let mut levels: Vec<Vec<usize>> = vec![Vec::new(); max_depth];
        for (i, node) in nodes.iter().enumerate() {
            if matches!(node.kind, NodeKind::Neuron { .. }) {
                levels[node.depth - 1].push(i);
            }
        }

        let latest = (0..nodes.len()).map(|_| None).collect();
        Ok(AutomationGraph {
            nodes,
            index,
            levels,
            latest,
            pending: Vec::new(),
            wave: 0,
        })
    }
}

// ---------------------------------------------------------------------------
// Sealed graph
// ---------------------------------------------------------------------------

/// Book-keeping for one in-flight wave.
pub(crate) struct WaveCursor {
    pub(crate) wave: u64,
    /// Nodes that produced a new signal this wave.
    updated: HashSet<usize>,
    /// Neurons force-skipped by an upstream's `SuppressDependents` failure.
    suppressed: HashSet<usize>,
    events: Vec<Event>,
    diagnostics: Vec<Diagnostic>,
    evaluated: Vec<String>,
}

/// A neuron pulled out for evaluation: shared state cell plus an owned
/// snapshot of its inputs, safe to move onto another thread.
pub(crate) struct Prepared {
    pub(crate) cell: NeuronCell,
    pub(crate) inputs: Inputs,
}

/// The sealed directed graph of sensors and neurons.
pub struct AutomationGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    levels: Vec<Vec<usize>>,
    /// Latest signal per node index; `None` until a node first produces.
    latest: Vec<Option<Signal>>,
    /// Signals pushed since the last wave.
    pending: Vec<(usize, Signal)>,
    wave: u64,
}

// Neurons are opaque trait objects, so derive(Debug) is off the table;
// summarize the topology instead.
impl std::fmt::Debug for AutomationGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationGraph")
            .field("sensors", &self.sensor_count())
            .field("neurons", &self.neuron_count())
            .field("depths", &self.levels.len())
            .field("wave", &self.wave)
            .finish()
    }
}

impl AutomationGraph {
    /// Push an externally observed value as a signal from `sensor`.
    ///
    /// Only enqueues for the next wave, never blocking on downstream
    /// processing. A value incompatible with the sensor's declared kind is
    /// rejected whole; nothing partial propagates.
    pub fn push(
        &mut self,
        sensor: &str,
        value: impl Into<SignalValue>,
        timestamp: DateTime<Utc>,
    ) -> Result<Ack, PushError> {
        let idx = *self
            .index
            .get(sensor)
            .ok_or_else(|| PushError::UnknownSensor(sensor.to_string()))?;
        let expected = match &self.nodes[idx].kind {
            NodeKind::Sensor { kind } => *kind,
            NodeKind::Neuron { .. } => return Err(PushError::UnknownSensor(sensor.to_string())),
        };
        let value = value.into();
        if value.kind() != expected {
            return Err(PushError::SignalTypeMismatch {
                sensor: sensor.to_string(),
                expected,
                actual: value.kind(),
            });
        }
        self.pending.push((
            idx,
            Signal {
                source: sensor.to_string(),
                value,
                timestamp,
                // Stamped with the wave's logical time at collect.
                wave: 0,
            },
        ));
        Ok(Ack {
            sensor: sensor.to_string(),
        })
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn sensor_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Sensor { .. }))
            .count()
    }

    pub fn neuron_count(&self) -> usize {
        self.nodes.len() - self.sensor_count()
    }

    /// Dependency depth of a node: 0 for sensors, 1 + max upstream depth
    /// for neurons.
    pub fn depth_of(&self, node: &str) -> Option<usize> {
        self.index.get(node).map(|&i| self.nodes[i].depth)
    }

    /// Latest signal a node has produced, if any.
    pub fn latest_signal(&self, node: &str) -> Option<&Signal> {
        self.index.get(node).and_then(|&i| self.latest[i].as_ref())
    }

    /// Run one complete wave synchronously. Returns `None` when no signals
    /// are pending (nothing to collect, nothing to evaluate).
    ///
    /// Failures are isolated per neuron: a panic or `EvalFailure` becomes a
    /// diagnostic and, per the neuron's policy, may suppress its direct
    /// dependents; the wave itself always completes. Per-evaluation
    /// timeouts are enforced by the async runtime, which drives the same
    /// wave machinery with preemption.
    pub fn run_wave(&mut self) -> Option<WaveOutcome> {
        let mut cursor = self.begin_wave()?;
        for level in 0..self.level_count() {
            for idx in self.due_neurons(level, &cursor) {
                let prepared = self.prepare(idx, cursor.wave);
                let result = match prepared.cell.try_lock() {
                    Some(mut neuron) => {
                        std::panic::catch_unwind(AssertUnwindSafe(|| {
                            neuron.evaluate(&prepared.inputs)
                        }))
                        .unwrap_or(Err(EvalFailure::Panicked))
                    }
                    None => Err(EvalFailure::Busy),
                };
                self.commit(idx, &mut cursor, result);
            }
        }
        Some(self.finish_wave(cursor))
    }

    // -- wave machinery shared with the async runtime ----------------------

    /// Collect: close the wave's input set and stamp its logical time.
    pub(crate) fn begin_wave(&mut self) -> Option<WaveCursor> {
        if self.pending.is_empty() {
            return None;
        }
        self.wave += 1;
        let wave = self.wave;
        let mut updated = HashSet::new();
        for (idx, mut signal) in self.pending.drain(..) {
            signal.wave = wave;
            // Multiple pushes to one sensor within a wave coalesce; the
            // last value wins and dependents evaluate once.
            self.latest[idx] = Some(signal);
            updated.insert(idx);
        }
        log::debug!("wave {} collected {} updated source(s)", wave, updated.len());
        Some(WaveCursor {
            wave,
            updated,
            suppressed: HashSet::new(),
            events: Vec::new(),
            diagnostics: Vec::new(),
            evaluated: Vec::new(),
        })
    }

    pub(crate) fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Order: neurons at this depth due for evaluation, meaning at least one
    /// updated upstream, and not suppressed by a failed upstream's policy.
    pub(crate) fn due_neurons(&self, level: usize, cursor: &WaveCursor) -> Vec<usize> {
        self.levels[level]
            .iter()
            .copied()
            .filter(|&idx| {
                if cursor.suppressed.contains(&idx) {
                    log::debug!(
                        "wave {}: '{}' suppressed by failed upstream",
                        cursor.wave,
                        self.nodes[idx].name
                    );
                    return false;
                }
                self.nodes[idx].deps.iter().any(|d| cursor.updated.contains(d))
            })
            .collect()
    }

    pub(crate) fn prepare(&self, idx: usize, wave: u64) -> Prepared {
        let node = &self.nodes[idx];
        let NodeKind::Neuron { cell, .. } = &node.kind else {
            unreachable!("prepare() called on sensor '{}'", node.name);
        };
        let slots = node
            .deps
            .iter()
            .map(|&d| (self.nodes[d].name.clone(), self.latest[d].clone()))
            .collect();
        Prepared {
            cell: cell.clone(),
            inputs: Inputs::new(node.name.clone(), wave, slots),
        }
    }

    /// Propagate/record one evaluation result. Must be called in evaluation
    /// order (depth, then declaration order) to keep the event batch stable.
    pub(crate) fn commit(
        &mut self,
        idx: usize,
        cursor: &mut WaveCursor,
        result: Result<Evaluation, EvalFailure>,
    ) {
        let name = self.nodes[idx].name.clone();
        cursor.evaluated.push(name.clone());
        match result {
            Ok(evaluation) => {
                if let Some(value) = evaluation.derived {
                    self.latest[idx] = Some(Signal {
                        source: name,
                        value,
                        timestamp: Utc::now(),
                        wave: cursor.wave,
                    });
                    cursor.updated.insert(idx);
                }
                cursor.events.extend(evaluation.events);
            }
            Err(failure) => {
                log::warn!("neuron '{}' failed in wave {}: {}", name, cursor.wave, failure);
                let policy = match &self.nodes[idx].kind {
                    NodeKind::Neuron { policy, .. } => *policy,
                    NodeKind::Sensor { .. } => FailurePolicy::default(),
                };
                cursor.diagnostics.push(Diagnostic::EvaluationFailed {
                    node: name,
                    wave: cursor.wave,
                    reason: failure.to_string(),
                });
                if policy == FailurePolicy::SuppressDependents {
                    for d in self.nodes[idx].dependents.clone() {
                        cursor.suppressed.insert(d);
                    }
                }
            }
        }
    }

    pub(crate) fn finish_wave(&self, cursor: WaveCursor) -> WaveOutcome {
        log::info!(
            "wave {} complete: {} evaluated, {} event(s), {} diagnostic(s)",
            cursor.wave,
            cursor.evaluated.len(),
            cursor.events.len(),
            cursor.diagnostics.len()
        );
        WaveOutcome {
            wave: cursor.wave,
            events: cursor.events,
            diagnostics: cursor.diagnostics,
            evaluated: cursor.evaluated,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
