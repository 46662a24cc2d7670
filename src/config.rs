//! Engine tuning knobs, loadable from a JSON file.
//!
//! Every field has a conservative default so an empty `{}` (or no file at
//! all) yields a working engine. Durations are stored as integer
//! milliseconds in the file and exposed as `Duration` to callers.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::node::FailurePolicy;

fn default_command_capacity() -> usize {
    256
}

fn default_eval_timeout_ms() -> u64 {
    5_000
}

fn default_sink_retry_ms() -> u64 {
    50
}

/// Runtime configuration for [`Engine`](crate::runtime::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Bounded capacity of the ingestion command channel. When full,
    /// producers wait; this is what backpressure propagates through.
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,

    /// Per-evaluation wall-clock budget in milliseconds. An overrunning
    /// neuron is reported as timed out and its result discarded.
    #[serde(default = "default_eval_timeout_ms")]
    pub eval_timeout_ms: u64,

    /// Pause between delivery retries while the event sink reports
    /// backpressure.
    #[serde(default = "default_sink_retry_ms")]
    pub sink_retry_ms: u64,

    /// Policy applied to neurons registered without an explicit one.
    #[serde(default)]
    pub default_failure_policy: FailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_capacity: default_command_capacity(),
            eval_timeout_ms: default_eval_timeout_ms(),
            sink_retry_ms: default_sink_retry_ms(),
            default_failure_policy: FailurePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is
    /// missing or invalid. The fallback is logged, never silent.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("using default engine config: {}", e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.command_capacity == 0 {
            return Err("commandCapacity must be at least 1".into());
        }
        if self.eval_timeout_ms == 0 {
            return Err("evalTimeoutMs must be at least 1".into());
        }
        Ok(())
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_millis(self.eval_timeout_ms)
    }

    pub fn sink_retry(&self) -> Duration {
        Duration::from_millis(self.sink_retry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.eval_timeout(), Duration::from_secs(5));
        assert_eq!(config.default_failure_policy, FailurePolicy::SuppressDependents);
    }

    #[test]
    fn test_empty_object_yields_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"evalTimeoutMs": 250, "defaultFailurePolicy": "propagate_absent"}}"#
        )
        .expect("write");

        let config = EngineConfig::load(file.path()).expect("load");
        assert_eq!(config.eval_timeout_ms, 250);
        assert_eq!(config.default_failure_policy, FailurePolicy::PropagateAbsent);
        assert_eq!(config.command_capacity, 256);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"commandCapacity": 0}}"#).expect("write");
        let err = EngineConfig::load(file.path()).unwrap_err();
        assert!(err.contains("commandCapacity"));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = EngineConfig::load_or_default(Path::new("/nonexistent/engine.json"));
        assert_eq!(config, EngineConfig::default());
    }
}
