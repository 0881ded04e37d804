use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::TraceError;

/// What the consumer sees when a run fails.
///
/// The choice applies to every run of a trace. In both cases the run's end
/// event is never emitted and the failure is recorded in the run tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Deliver a [`RunFailure`](crate::RunFailure) item in place of the end event.
    #[default]
    Signal,
    /// Leave the end event absent without an inline signal.
    Omit,
}

impl FromStr for FailurePolicy {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "signal" => Ok(Self::Signal),
            "omit" => Ok(Self::Omit),
            other => Err(TraceError::Config(format!("unknown failure policy `{other}`"))),
        }
    }
}

/// Whether end events carry an output that can be derived from the chunks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPolicy {
    /// Always include `output`, filling it from the accumulated chunks when the
    /// unit did not return one.
    #[default]
    Always,
    /// Omit `output` when the run streamed chunks; consumers fold the chunks.
    OmitDerivable,
}

impl FromStr for OutputPolicy {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "omit_derivable" | "omit-derivable" => Ok(Self::OmitDerivable),
            other => Err(TraceError::Config(format!("unknown output policy `{other}`"))),
        }
    }
}

/// Tracer behavior options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TracerConfig {
    /// Bounded event buffer size between the producing runs and the consumer.
    pub stream_buffer_capacity: usize,
    /// How long an emission may wait for buffer space before the consumer is
    /// considered stalled and detached. `None` waits indefinitely.
    pub emit_timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
    pub output_policy: OutputPolicy,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            stream_buffer_capacity: 128,
            emit_timeout: Some(Duration::from_secs(30)),
            failure_policy: FailurePolicy::default(),
            output_policy: OutputPolicy::default(),
        }
    }
}

impl TracerConfig {
    /// Defaults overridden by environment variables:
    /// - `RUNTRACE_STREAM_BUFFER`: buffer capacity (> 0).
    /// - `RUNTRACE_EMIT_TIMEOUT_MS`: stall timeout in milliseconds, `0` or `none` to disable.
    /// - `RUNTRACE_FAILURE_POLICY`: `signal` or `omit`.
    /// - `RUNTRACE_OUTPUT_POLICY`: `always` or `omit_derivable`.
    pub fn from_env() -> Result<Self, TraceError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TraceError> {
        let mut config = Self::default();
        if let Some(raw) = lookup("RUNTRACE_STREAM_BUFFER") {
            config.stream_buffer_capacity = raw.trim().parse().map_err(|_| {
                TraceError::Config(format!("RUNTRACE_STREAM_BUFFER is not a number: `{raw}`"))
            })?;
        }
        if let Some(raw) = lookup("RUNTRACE_EMIT_TIMEOUT_MS") {
            config.emit_timeout = match raw.trim().to_ascii_lowercase().as_str() {
                "" | "0" | "none" | "off" => None,
                value => {
                    let millis: u64 = value.parse().map_err(|_| {
                        TraceError::Config(format!(
                            "RUNTRACE_EMIT_TIMEOUT_MS is not a number: `{raw}`"
                        ))
                    })?;
                    Some(Duration::from_millis(millis))
                }
            };
        }
        if let Some(raw) = lookup("RUNTRACE_FAILURE_POLICY") {
            config.failure_policy = raw.parse()?;
        }
        if let Some(raw) = lookup("RUNTRACE_OUTPUT_POLICY") {
            config.output_policy = raw.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub fn emit_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.emit_timeout = timeout;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn output_policy(mut self, policy: OutputPolicy) -> Self {
        self.output_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<(), TraceError> {
        if self.stream_buffer_capacity == 0 {
            return Err(TraceError::Config(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        if self.emit_timeout.is_some_and(|t| t.is_zero()) {
            return Err(TraceError::Config(
                "emit_timeout must be non-zero when set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = TracerConfig::default();
        assert_eq!(config.stream_buffer_capacity, 128);
        assert_eq!(config.failure_policy, FailurePolicy::Signal);
        assert_eq!(config.output_policy, OutputPolicy::Always);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = TracerConfig::from_lookup(lookup(&[
            ("RUNTRACE_STREAM_BUFFER", "8"),
            ("RUNTRACE_EMIT_TIMEOUT_MS", "none"),
            ("RUNTRACE_FAILURE_POLICY", "Omit"),
            ("RUNTRACE_OUTPUT_POLICY", "omit-derivable"),
        ]))
        .expect("config");
        assert_eq!(config.stream_buffer_capacity, 8);
        assert_eq!(config.emit_timeout, None);
        assert_eq!(config.failure_policy, FailurePolicy::Omit);
        assert_eq!(config.output_policy, OutputPolicy::OmitDerivable);
    }

    #[test]
    fn invalid_env_values_are_config_errors() {
        let err = TracerConfig::from_lookup(lookup(&[("RUNTRACE_STREAM_BUFFER", "0")]))
            .expect_err("zero buffer");
        assert!(matches!(err, TraceError::Config(msg) if msg.contains("greater than 0")));

        let err = TracerConfig::from_lookup(lookup(&[("RUNTRACE_FAILURE_POLICY", "loud")]))
            .expect_err("unknown policy");
        assert!(matches!(err, TraceError::Config(msg) if msg.contains("loud")));
    }
}
