//! The async engine: owns the sealed graph, ingests pushes over a bounded
//! command channel, runs waves, and delivers batches to the injected sink.
//!
//! One background task owns the graph outright, so no lock guards the
//! wave-to-wave state. Producers talk to it through [`EngineHandle`], whose
//! channel is bounded by `EngineConfig::command_capacity`: while the engine
//! is stuck retrying a backpressured sink it stops polling the channel, the
//! channel fills, and producers wait; backpressure reaches the edge without
//! dropping a single accepted signal.
//!
//! Evaluations run on the blocking pool, one task per due neuron per depth
//! level, each under the configured timeout. Results are committed in
//! declaration order so the wave's event batch stays stable regardless of
//! which task finished first. A timed-out evaluation keeps running in the
//! background holding its neuron's cell; subsequent waves find the cell
//! busy and report that instead of blocking.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::{EvalFailure, PushError, SinkError};
use crate::graph::{Ack, AutomationGraph, WaveOutcome};
use crate::signal::SignalValue;
use crate::sink::{Diagnostic, DiagnosticSink, EventSink, LogSink, WaveBatch};

enum EngineCommand {
    Push {
        sensor: String,
        value: SignalValue,
        timestamp: DateTime<Utc>,
        ack: oneshot::Sender<Result<Ack, PushError>>,
    },
    Shutdown,
}

/// Cloneable producer-side handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Push a signal and wait for the ingestion verdict. Waits (rather than
    /// failing) while the command channel is full.
    pub async fn push(
        &self,
        sensor: &str,
        value: impl Into<SignalValue>,
        timestamp: DateTime<Utc>,
    ) -> Result<Ack, PushError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Push {
                sensor: sensor.to_string(),
                value: value.into(),
                timestamp,
                ack: ack_tx,
            })
            .await
            .map_err(|_| PushError::EngineClosed)?;
        ack_rx.await.map_err(|_| PushError::EngineClosed)?
    }

    /// Push with the current time as the observation timestamp.
    pub async fn push_now(
        &self,
        sensor: &str,
        value: impl Into<SignalValue>,
    ) -> Result<Ack, PushError> {
        self.push(sensor, value, Utc::now()).await
    }

    /// A handle pre-bound to one sensor, convenient to hand to the code
    /// that owns that data source.
    pub fn sensor(&self, name: &str) -> SensorHandle {
        SensorHandle {
            handle: self.clone(),
            name: name.to_string(),
        }
    }

    /// Ask the engine to stop. Signals accepted before this point still get
    /// a final wave and delivery; the request is ignored if the engine is
    /// already gone.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineCommand::Shutdown).await;
    }
}

/// An [`EngineHandle`] bound to a single sensor.
#[derive(Clone)]
pub struct SensorHandle {
    handle: EngineHandle,
    name: String,
}

impl SensorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn push(
        &self,
        value: impl Into<SignalValue>,
        timestamp: DateTime<Utc>,
    ) -> Result<Ack, PushError> {
        self.handle.push(&self.name, value, timestamp).await
    }

    pub async fn push_now(&self, value: impl Into<SignalValue>) -> Result<Ack, PushError> {
        self.handle.push(&self.name, value, Utc::now()).await
    }
}

/// A sealed graph plus its sinks and tuning, ready to start.
pub struct Engine<S, D = LogSink> {
    graph: AutomationGraph,
    config: EngineConfig,
    sink: S,
    diagnostics: D,
}

impl<S: EventSink> Engine<S, LogSink> {
    pub fn new(graph: AutomationGraph, config: EngineConfig, sink: S) -> Self {
        Self {
            graph,
            config,
            sink,
            diagnostics: LogSink,
        }
    }
}

impl<S: EventSink, D: DiagnosticSink> Engine<S, D> {
    /// Replace the diagnostics destination (the default logs them).
    pub fn with_diagnostics<D2: DiagnosticSink>(self, diagnostics: D2) -> Engine<S, D2> {
        Engine {
            graph: self.graph,
            config: self.config,
            sink: self.sink,
            diagnostics,
        }
    }

    /// Spawn the engine task. The `JoinHandle` resolves once the engine has
    /// stopped and flushed.
    pub fn start(self) -> (EngineHandle, JoinHandle<()>)
    where
        S: 'static,
        D: 'static,
    {
        let (tx, rx) = mpsc::channel(self.config.command_capacity);
        let join = tokio::spawn(self.run(rx));
        (EngineHandle { tx }, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<EngineCommand>) {
        log::info!(
            "engine started: {} sensor(s), {} neuron(s), eval timeout {}ms",
            self.graph.sensor_count(),
            self.graph.neuron_count(),
            self.config.eval_timeout_ms
        );

        let mut shutdown = false;
        'engine: while !shutdown {
            let Some(command) = rx.recv().await else {
                break;
            };
            shutdown = self.apply(command);

            // Drain whatever else is already queued; later pushes to the
            // same sensor coalesce into this wave.
            while !shutdown {
                match rx.try_recv() {
                    Ok(command) => shutdown = self.apply(command),
                    Err(_) => break,
                }
            }

            if self.graph.has_pending() {
                if let Some(outcome) = self.evaluate_wave().await {
                    if self.deliver(outcome).await.is_err() {
                        break 'engine;
                    }
                }
            }
        }

        // Final wave for signals accepted before the channel closed.
        if self.graph.has_pending() {
            if let Some(outcome) = self.evaluate_wave().await {
                let _ = self.deliver(outcome).await;
            }
        }
        log::info!("engine stopped");
    }

    /// Returns true when the command asks for shutdown.
    fn apply(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Push {
                sensor,
                value,
                timestamp,
                ack,
            } => {
                let result = self.graph.push(&sensor, value, timestamp);
                let _ = ack.send(result);
                false
            }
            EngineCommand::Shutdown => true,
        }
    }

    /// One wave with concurrent, timeout-bounded evaluation per depth level.
    async fn evaluate_wave(&mut self) -> Option<WaveOutcome> {
        let mut cursor = self.graph.begin_wave()?;
        let timeout = self.config.eval_timeout();

        for level in 0..self.graph.level_count() {
            let due = self.graph.due_neurons(level, &cursor);
            let mut tasks = Vec::with_capacity(due.len());
            for idx in due {
                let prepared = self.graph.prepare(idx, cursor.wave);
                let task = tokio::task::spawn_blocking(move || {
                    match prepared.cell.try_lock() {
                        Some(mut neuron) => neuron.evaluate(&prepared.inputs),
                        None => Err(EvalFailure::Busy),
                    }
                });
                tasks.push((idx, task));
            }
            // Commit in declaration order, not completion order, so the
            // batch ordering guarantee holds.
            for (idx, task) in tasks {
                let result = match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join)) if join.is_panic() => Err(EvalFailure::Panicked),
                    Ok(Err(_)) => Err(EvalFailure::Panicked),
                    Err(_) => Err(EvalFailure::TimedOut(self.config.eval_timeout_ms)),
                };
                self.graph.commit(idx, &mut cursor, result);
            }
        }
        Some(self.graph.finish_wave(cursor))
    }

    /// Forward diagnostics and offer the batch until the sink takes it.
    /// While retrying, the command channel goes unpolled, which is what
    /// slows producers down.
    async fn deliver(&mut self, outcome: WaveOutcome) -> Result<(), SinkError> {
        for diagnostic in outcome.diagnostics {
            self.diagnostics.diagnostic(diagnostic);
        }
        if outcome.events.is_empty() {
            return Ok(());
        }
        let batch = WaveBatch {
            wave: outcome.wave,
            events: outcome.events,
        };
        let mut reported = false;
        loop {
            match self.sink.offer(&batch) {
                Ok(()) => return Ok(()),
                Err(SinkError::Backpressure(capacity)) => {
                    if !reported {
                        log::warn!(
                            "sink backpressure on wave {}; pausing ingestion",
                            batch.wave
                        );
                        self.diagnostics.diagnostic(Diagnostic::SinkBackpressure {
                            wave: batch.wave,
                            capacity,
                        });
                        reported = true;
                    }
                    tokio::time::sleep(self.config.sink_retry()).await;
                }
                Err(SinkError::Closed) => {
                    log::error!("event sink closed; stopping engine");
                    self.diagnostics.diagnostic(Diagnostic::SinkClosed);
                    return Err(SinkError::Closed);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, Impact};
    use crate::graph::GraphBuilder;
    use crate::node::{neuron_fn, Evaluation, Inputs};
    use crate::signal::SignalKind;
    use crate::sink::{ChannelSink, CollectSink};
    use std::time::Duration;

    /// Graph with one float sensor and one neuron that emits an event per
    /// evaluation, echoing the sensed value into the payload.
    fn echo_graph() -> AutomationGraph {
        let mut builder = GraphBuilder::new();
        builder.sensor("temp", SignalKind::Float);
        builder.neuron(
            "watch",
            &["temp"],
            neuron_fn(|inputs: &Inputs| {
                let Some(v) = inputs.value("temp").and_then(SignalValue::as_float) else {
                    return Ok(Evaluation::silent());
                };
                let mut b = EventBuilder::new("reading").expect("builder");
                b.with_origin(inputs.node()).with_float("value", v);
                Ok(Evaluation::event(b.build().expect("build")))
            }),
        );
        builder.seal().expect("seal")
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            sink_retry_ms: 10,
            ..EngineConfig::default()
        }
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[tokio::test]
    async fn test_push_wave_deliver_shutdown() {
        init_logging();
        let sink = CollectSink::new();
        let engine = Engine::new(echo_graph(), fast_config(), sink.clone())
            .with_diagnostics(sink.clone());
        let (handle, join) = engine.start();

        let ack = handle.push_now("temp", 21.5).await.expect("push");
        assert_eq!(ack.sensor, "temp");

        handle.shutdown().await;
        join.await.expect("engine task");

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "reading");
        assert_eq!(events[0].origin.as_deref(), Some("watch"));
        assert!(sink.diagnostics().is_empty());
    }

    #[tokio::test]
    async fn test_ingestion_verdict_reaches_producer() {
        let sink = CollectSink::new();
        let (handle, join) = Engine::new(echo_graph(), fast_config(), sink.clone()).start();

        let err = handle.push_now("temp", "warm").await.unwrap_err();
        assert!(matches!(err, PushError::SignalTypeMismatch { .. }));

        let err = handle.push_now("humidity", 0.5).await.unwrap_err();
        assert_eq!(err, PushError::UnknownSensor("humidity".to_string()));

        handle.shutdown().await;
        join.await.expect("engine task");
        assert!(sink.events().is_empty(), "rejected pushes propagate nothing");
    }

    #[tokio::test]
    async fn test_push_after_shutdown_is_engine_closed() {
        let sink = CollectSink::new();
        let (handle, join) = Engine::new(echo_graph(), fast_config(), sink).start();

        handle.shutdown().await;
        join.await.expect("engine task");

        let err = handle.push_now("temp", 1.0).await.unwrap_err();
        assert_eq!(err, PushError::EngineClosed);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_accepted_signals() {
        let sink = CollectSink::new();
        let (handle, join) = Engine::new(echo_graph(), fast_config(), sink.clone()).start();

        // Push and shutdown back to back; the accepted signal still gets
        // its wave before the engine exits.
        handle.push_now("temp", 30.0).await.expect("push");
        handle.shutdown().await;
        join.await.expect("engine task");

        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_sensor_handle_binds_name() {
        let sink = CollectSink::new();
        let (handle, join) = Engine::new(echo_graph(), fast_config(), sink.clone()).start();

        let temp = handle.sensor("temp");
        assert_eq!(temp.name(), "temp");
        temp.push_now(18.0).await.expect("push");

        handle.shutdown().await;
        join.await.expect("engine task");
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_neuron_times_out_and_wave_completes() {
        init_logging();
        let mut builder = GraphBuilder::new();
        builder.sensor("s", SignalKind::Float);
        builder.neuron(
            "slow",
            &["s"],
            neuron_fn(|_: &Inputs| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(Evaluation::silent())
            }),
        );
        builder.neuron(
            "quick",
            &["s"],
            neuron_fn(|inputs: &Inputs| {
                let mut b = EventBuilder::new("quick-report").expect("builder");
                b.with_origin(inputs.node()).with_impact(Impact::Minor);
                Ok(Evaluation::event(b.build().expect("build")))
            }),
        );
        let graph = builder.seal().expect("seal");

        let sink = CollectSink::new();
        let config = EngineConfig {
            eval_timeout_ms: 50,
            sink_retry_ms: 10,
            ..EngineConfig::default()
        };
        let engine = Engine::new(graph, config, sink.clone()).with_diagnostics(sink.clone());
        let (handle, join) = engine.start();

        handle.push_now("s", 1.0).await.expect("push");
        handle.shutdown().await;
        join.await.expect("engine task");

        // The healthy neuron's event arrived despite the overrun.
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "quick-report");

        let diagnostics = sink.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        match &diagnostics[0] {
            Diagnostic::EvaluationFailed { node, reason, .. } => {
                assert_eq!(node, "slow");
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected diagnostic: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backpressure_pauses_then_delivers_everything() {
        let (channel, mut rx) = ChannelSink::bounded(1);
        let diagnostics = CollectSink::new();
        let engine = Engine::new(echo_graph(), fast_config(), channel)
            .with_diagnostics(diagnostics.clone());
        let (handle, join) = engine.start();

        handle.push_now("temp", 1.0).await.expect("push");
        // Let the first wave run and occupy the sink's only slot.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.push_now("temp", 2.0).await.expect("push");

        // The engine should now be parked in its retry loop.
        let mut saw_backpressure = false;
        for _ in 0..50 {
            if diagnostics
                .diagnostics()
                .iter()
                .any(|d| matches!(d, Diagnostic::SinkBackpressure { .. }))
            {
                saw_backpressure = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_backpressure, "expected a backpressure diagnostic");

        // Draining the sink unblocks delivery; nothing was dropped.
        let first = rx.recv().await.expect("first batch");
        let second = rx.recv().await.expect("second batch");
        assert_eq!(first.wave, 1);
        assert_eq!(second.wave, 2);
        assert_eq!(second.events[0].payload["value"], 2.0);

        // Exactly one notice for the whole stall.
        let notices = diagnostics
            .diagnostics()
            .iter()
            .filter(|d| matches!(d, Diagnostic::SinkBackpressure { .. }))
            .count();
        assert_eq!(notices, 1);

        handle.shutdown().await;
        join.await.expect("engine task");
    }

    #[tokio::test]
    async fn test_sink_closed_stops_engine() {
        let (channel, rx) = ChannelSink::bounded(1);
        drop(rx);
        let diagnostics = CollectSink::new();
        let engine = Engine::new(echo_graph(), fast_config(), channel)
            .with_diagnostics(diagnostics.clone());
        let (handle, join) = engine.start();

        handle.push_now("temp", 1.0).await.expect("push accepted");
        join.await.expect("engine task");

        assert!(diagnostics
            .diagnostics()
            .iter()
            .any(|d| matches!(d, Diagnostic::SinkClosed)));
        let err = handle.push_now("temp", 2.0).await.unwrap_err();
        assert_eq!(err, PushError::EngineClosed);
    }
}
