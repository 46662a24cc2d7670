//! Synapse is a dataflow automation engine. External observations enter as
//! typed signals from named sensors, propagate through a sealed acyclic
//! graph of stateful neurons in dependency-ordered waves, and leave as
//! immutable, severity-tagged events delivered to an injected sink.
//!
//! The usual shape of an embedding:
//!
//! ```no_run
//! use synapse::{
//!     neuron_fn, ChannelSink, Engine, EngineConfig, Evaluation, EventBuilder, GraphBuilder,
//!     Impact, Inputs, SignalKind, SignalValue,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut builder = GraphBuilder::new();
//! builder.sensor("temperature", SignalKind::Float);
//! builder.neuron(
//!     "overheat",
//!     &["temperature"],
//!     neuron_fn(|inputs: &Inputs| {
//!         match inputs.value("temperature").and_then(SignalValue::as_float) {
//!             Some(t) if t > 90.0 => {
//!                 let mut event = EventBuilder::new("overheat")?;
//!                 event
//!                     .with_impact(Impact::Critical)
//!                     .with_origin(inputs.node())
//!                     .with_float("celsius", t);
//!                 Ok(Evaluation::event(event.build()?))
//!             }
//!             _ => Ok(Evaluation::silent()),
//!         }
//!     }),
//! );
//!
//! let (sink, mut batches) = ChannelSink::bounded(64);
//! let engine = Engine::new(builder.seal()?, EngineConfig::default(), sink);
//! let (handle, join) = engine.start();
//!
//! handle.push_now("temperature", 97.3).await?;
//! if let Some(batch) = batches.recv().await {
//!     println!("wave {} produced {} event(s)", batch.wave, batch.events.len());
//! }
//!
//! handle.shutdown().await;
//! join.await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod node;
pub mod runtime;
pub mod signal;
pub mod sink;

pub use config::EngineConfig;
pub use error::{EvalFailure, EventError, GraphError, PushError, SinkError};
pub use event::{Event, EventBuilder, Impact};
pub use graph::{Ack, AutomationGraph, GraphBuilder, WaveOutcome};
pub use node::{neuron_fn, Evaluation, FailurePolicy, FnNeuron, Inputs, Neuron, SensorSpec};
pub use runtime::{Engine, EngineHandle, SensorHandle};
pub use signal::{Signal, SignalKind, SignalValue};
pub use sink::{ChannelSink, CollectSink, Diagnostic, DiagnosticSink, EventSink, LogSink, WaveBatch};
