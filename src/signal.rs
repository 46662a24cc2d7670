//! Signals: timestamped values flowing along graph edges.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The declared value shape of a sensor or derived signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Float,
    Int,
    Bool,
    Text,
    Json,
}

impl Display for SignalKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Float => write!(f, "float"),
            SignalKind::Int => write!(f, "int"),
            SignalKind::Bool => write!(f, "bool"),
            SignalKind::Text => write!(f, "text"),
            SignalKind::Json => write!(f, "json"),
        }
    }
}

/// A signal value. Closed tagged set so kind checks at the ingestion
/// boundary stay exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
    Json(serde_json::Value),
}

impl SignalValue {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalValue::Float(_) => SignalKind::Float,
            SignalValue::Int(_) => SignalKind::Int,
            SignalValue::Bool(_) => SignalKind::Bool,
            SignalValue::Text(_) => SignalKind::Text,
            SignalValue::Json(_) => SignalKind::Json,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            SignalValue::Float(v) => Some(*v),
            SignalValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SignalValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SignalValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SignalValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f64> for SignalValue {
    fn from(value: f64) -> Self {
        SignalValue::Float(value)
    }
}

impl From<i64> for SignalValue {
    fn from(value: i64) -> Self {
        SignalValue::Int(value)
    }
}

impl From<i32> for SignalValue {
    fn from(value: i32) -> Self {
        SignalValue::Int(value as i64)
    }
}

impl From<bool> for SignalValue {
    fn from(value: bool) -> Self {
        SignalValue::Bool(value)
    }
}

impl From<&str> for SignalValue {
    fn from(value: &str) -> Self {
        SignalValue::Text(value.to_string())
    }
}

impl From<String> for SignalValue {
    fn from(value: String) -> Self {
        SignalValue::Text(value)
    }
}

impl From<serde_json::Value> for SignalValue {
    fn from(value: serde_json::Value) -> Self {
        SignalValue::Json(value)
    }
}

/// A timestamped value produced by a sensor or derived by a neuron.
///
/// Immutable once emitted: each propagation step creates a new Signal, so
/// downstream neurons always observe a consistent snapshot. `wave` is the
/// logical time of the propagation wave that recorded the signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    /// Stable id of the sensor or neuron that produced the value.
    pub source: String,
    pub value: SignalValue,
    pub timestamp: DateTime<Utc>,
    pub wave: u64,
}
