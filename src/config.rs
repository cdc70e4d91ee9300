//! Execution configuration.
//!
//! [`ExecutionOptions`] collects the knobs of one co-simulation run and can
//! be loaded declaratively from YAML or JSON:
//!
//! ```yaml
//! name: pump_rig
//! start_time: 0.0
//! max_time: 10.0
//! step_size: 0.01
//! comm_timeout_ms: 1000
//! variable_recv_timeout_ms: 1000
//! ```
//!
//! Omitted fields take their defaults; `max_time` left out means the
//! simulation has no predefined end.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{TimeDuration, TimePoint, ETERNITY};

/// Configuration options for an execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Name of the execution, used e.g. in slave-side log file names.
    #[serde(default = "default_name")]
    pub name: String,

    /// The start time of the simulation.  Must be less than `max_time`.
    #[serde(default)]
    pub start_time: TimePoint,

    /// The maximum simulation time point; `None` means no predefined end.
    #[serde(default)]
    pub max_time: Option<TimePoint>,

    /// The fixed step size (ΔT) of the simulation.
    #[serde(default = "default_step_size")]
    pub step_size: TimeDuration,

    /// How long the master waits for a control reply from a slave.
    #[serde(default = "default_timeout_ms")]
    pub comm_timeout_ms: u64,

    /// How long slaves wait for each other's variable values per step.
    #[serde(default = "default_timeout_ms")]
    pub variable_recv_timeout_ms: u64,

    /// Whether the step size is controlled by error estimation.  Unused by
    /// the fixed-step master itself, but forwarded to the slaves.
    #[serde(default)]
    pub adaptive_step_size: bool,

    /// Relative tolerance for slaves with internal error estimation; only
    /// meaningful together with `adaptive_step_size`.
    #[serde(default = "default_relative_tolerance")]
    pub relative_tolerance: f64,
}

fn default_name() -> String {
    "execution".to_string()
}

fn default_step_size() -> TimeDuration {
    0.1
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_relative_tolerance() -> f64 {
    1.0
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            name: default_name(),
            start_time: 0.0,
            max_time: None,
            step_size: default_step_size(),
            comm_timeout_ms: default_timeout_ms(),
            variable_recv_timeout_ms: default_timeout_ms(),
            adaptive_step_size: false,
            relative_tolerance: default_relative_tolerance(),
        }
    }
}

impl ExecutionOptions {
    /// The maximum simulation time, [`ETERNITY`] when unbounded.
    pub fn max_time(&self) -> TimePoint {
        self.max_time.unwrap_or(ETERNITY)
    }

    /// The control reply timeout as a [`Duration`].
    pub fn comm_timeout(&self) -> Duration {
        Duration::from_millis(self.comm_timeout_ms)
    }

    /// Loads options from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let options: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidArgument(format!("YAML parsing error: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Loads options from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Loads options from a file, choosing the format by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            Some("json") => Self::from_json(&content),
            other => Err(Error::InvalidArgument(format!(
                "unknown configuration file format: {}",
                other.unwrap_or("")
            ))),
        }
    }

    /// Checks the invariants between the options.
    pub fn validate(&self) -> Result<()> {
        if !self.start_time.is_finite() {
            return Err(Error::InvalidArgument(
                "start_time must be finite".into(),
            ));
        }
        if self.start_time >= self.max_time() {
            return Err(Error::InvalidArgument(
                "start_time must be less than max_time".into(),
            ));
        }
        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return Err(Error::InvalidArgument(
                "step_size must be positive and finite".into(),
            ));
        }
        if self.comm_timeout_ms == 0 {
            return Err(Error::InvalidArgument(
                "comm_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ExecutionOptions::default();
        assert_eq!(options.start_time, 0.0);
        assert_eq!(options.max_time(), ETERNITY);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing_with_defaults() {
        let yaml = r#"
name: pump_rig
step_size: 0.01
max_time: 10.0
"#;
        let options = ExecutionOptions::from_yaml(yaml).unwrap();
        assert_eq!(options.name, "pump_rig");
        assert_eq!(options.step_size, 0.01);
        assert_eq!(options.max_time(), 10.0);
        assert_eq!(options.comm_timeout_ms, 1000);
    }

    #[test]
    fn test_json_parsing() {
        let json = r#"{"step_size": 0.5, "comm_timeout_ms": 250}"#;
        let options = ExecutionOptions::from_json(json).unwrap();
        assert_eq!(options.step_size, 0.5);
        assert_eq!(options.comm_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_validation_rejects_bad_time_frame() {
        let mut options = ExecutionOptions {
            start_time: 5.0,
            max_time: Some(1.0),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        options.max_time = Some(6.0);
        assert!(options.validate().is_ok());

        options.step_size = 0.0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_unknown_file_format() {
        let result = ExecutionOptions::from_file("options.toml");
        assert!(result.is_err());
    }
}
