//! Events and the severity model.
//!
//! An `Event` is an immutable record describing something a neuron decided
//! was worth reporting. Construction goes through `EventBuilder`, the sole
//! supported path, which enforces required fields and defaults before
//! finalization. Escalation is modeled as emitting a new Event, never as
//! mutating an old one.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EventError;

// ---------------------------------------------------------------------------
// Impact
// ---------------------------------------------------------------------------

/// Ordered severity classification attached to every Event.
///
/// The ordering is load-bearing: consumers use it to decide whether a new
/// event supersedes, coalesces with, or is dominated by a pending one. The
/// total order derives from declaration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    #[default]
    Negligible,
    Minor,
    Moderate,
    Major,
    Critical,
}

impl Impact {
    /// All levels, smallest to largest, for exhaustive handling by consumers.
    pub const ALL: [Impact; 5] = [
        Impact::Negligible,
        Impact::Minor,
        Impact::Moderate,
        Impact::Major,
        Impact::Critical,
    ];
}

impl Display for Impact {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Impact::Negligible => write!(f, "negligible"),
            Impact::Minor => write!(f, "minor"),
            Impact::Moderate => write!(f, "moderate"),
            Impact::Major => write!(f, "major"),
            Impact::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Impact {
    type Err = EventError;

    /// Parse an impact level from external input (configuration, wire).
    /// Undefined levels fail here, at the boundary, not inside the core type.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "negligible" => Ok(Impact::Negligible),
            "minor" => Ok(Impact::Minor),
            "moderate" => Ok(Impact::Moderate),
            "major" => Ok(Impact::Major),
            "critical" => Ok(Impact::Critical),
            other => Err(EventError::InvalidImpact(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An immutable, severity-tagged record describing a reportable occurrence.
///
/// Built by `EventBuilder::build()`; owned by the caller until handed to the
/// graph's output sink. Immutability is enforced by construction: there are
/// no mutating methods, and the impact is fixed at build time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    /// Name/kind identifier, e.g. "sensor-offline".
    pub name: String,
    pub impact: Impact,
    /// Id of the neuron (or sensor) that originated the event, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Opaque structured payload.
    pub payload: serde_json::Map<String, serde_json::Value>,
    /// Assigned at build time, not at dispatch time.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// EventBuilder
// ---------------------------------------------------------------------------

/// Mutable, single-use construction helper for `Event`.
///
/// Configuration methods return the builder for fluent chaining; `build()`
/// produces exactly one Event and marks the builder spent; a second call is
/// a usage error (`BuilderAlreadyConsumed`), not a silent second Event.
#[derive(Debug)]
pub struct EventBuilder {
    name: String,
    impact: Impact,
    origin: Option<String>,
    payload: serde_json::Map<String, serde_json::Value>,
    consumed: bool,
}

impl EventBuilder {
    /// Start building an event. `name` must be non-empty.
    pub fn new(name: &str) -> Result<Self, EventError> {
        if name.trim().is_empty() {
            return Err(EventError::InvalidEventName);
        }
        Ok(Self {
            name: name.to_string(),
            impact: Impact::default(),
            origin: None,
            payload: serde_json::Map::new(),
            consumed: false,
        })
    }

    /// Start building with an initial payload context.
    pub fn with_context(
        name: &str,
        context: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, EventError> {
        let mut builder = Self::new(name)?;
        builder.payload = context;
        Ok(builder)
    }

    /// Replace the pending impact. Last write wins; default is `Negligible`.
    pub fn with_impact(&mut self, impact: Impact) -> &mut Self {
        self.impact = impact;
        self
    }

    /// Record the originating node id.
    pub fn with_origin(&mut self, origin: &str) -> &mut Self {
        self.origin = Some(origin.to_string());
        self
    }

    /// Accumulate a payload entry. Duplicate keys overwrite.
    pub fn with_payload(&mut self, key: &str, value: serde_json::Value) -> &mut Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn with_text(&mut self, key: &str, value: &str) -> &mut Self {
        self.with_payload(key, serde_json::Value::String(value.to_string()))
    }

    pub fn with_int(&mut self, key: &str, value: i64) -> &mut Self {
        self.with_payload(key, serde_json::Value::from(value))
    }

    pub fn with_float(&mut self, key: &str, value: f64) -> &mut Self {
        self.with_payload(key, serde_json::Value::from(value))
    }

    pub fn with_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.with_payload(key, serde_json::Value::Bool(value))
    }

    /// Finalize into an immutable Event, consuming the builder's state.
    ///
    /// The creation timestamp is assigned here, at build time. Calling
    /// `build()` again on the same builder fails with
    /// `BuilderAlreadyConsumed`; the first Event is unaffected.
    pub fn build(&mut self) -> Result<Event, EventError> {
        if self.consumed {
            return Err(EventError::BuilderAlreadyConsumed);
        }
        self.consumed = true;
        Ok(Event {
            id: Uuid::new_v4(),
            name: self.name.clone(),
            impact: self.impact,
            origin: self.origin.take(),
            payload: std::mem::take(&mut self.payload),
            created_at: Utc::now(),
        })
    }
}
