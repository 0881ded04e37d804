use serde_json::Value;
use uuid::Uuid;

use crate::event::{Phase, RunKind};

/// Envelope construction errors: the payload contradicts the declared phase.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// Event name is not of the form `on_<kind>_<start|stream|end>`.
    #[error("invalid event name `{0}`: expected on_<kind>_<start|stream|end>")]
    InvalidEventName(String),
    /// Run kind is empty or contains characters other than `[a-z0-9_]`.
    #[error("invalid run kind `{0}`")]
    InvalidKind(String),
    /// A payload field that the phase does not allow was supplied.
    #[error("{phase} event must not carry `{field}`")]
    UnexpectedField { phase: Phase, field: &'static str },
    /// A stream event was built without its chunk.
    #[error("stream event requires a `chunk`")]
    MissingChunk,
    /// The end event repeated an input that was already emitted at start.
    #[error("input of run {run_id} was already emitted at start")]
    InputAlreadyEmitted { run_id: Uuid },
}

/// Two chunks could not be combined.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot combine {accumulated} with {chunk}")]
pub struct CombineError {
    pub accumulated: String,
    pub chunk: String,
}

impl CombineError {
    pub fn new(accumulated: impl Into<String>, chunk: impl Into<String>) -> Self {
        Self {
            accumulated: accumulated.into(),
            chunk: chunk.into(),
        }
    }
}

/// Why a run reached a terminal failure instead of its end event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The unit's body returned an error.
    #[error("unit failed: {message}")]
    Unit { message: String },
    /// The trace was aborted by the consumer.
    #[error("run cancelled")]
    Cancelled,
    /// The accumulated chunks disagreed with the explicit output.
    #[error("accumulated chunks do not match the explicit output")]
    ChunkMismatch,
    /// The run handle was dropped, or its parent terminated while it was open.
    #[error("run abandoned before a terminal event")]
    Abandoned,
    /// The unit broke the emission contract (e.g. repeated its input at end).
    #[error("emission contract violated: {message}")]
    Contract { message: String },
    /// The unit panicked while the run was open.
    #[error("unit panicked: {message}")]
    Panicked { message: String },
}

/// Terminal failure of one run, delivered in place of its end event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[error("run `{name}` ({run_id}) failed: {reason}")]
pub struct RunFailure {
    pub run_id: Uuid,
    pub name: String,
    pub kind: RunKind,
    pub reason: FailureReason,
}

/// Error returned by a unit's body.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnitError {
    /// The unit's own computation failed.
    #[error("{0}")]
    Failed(String),
    /// A nested run or an emission failed.
    #[error(transparent)]
    Trace(#[from] TraceError),
}

impl UnitError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<&UnitError> for FailureReason {
    fn from(err: &UnitError) -> Self {
        match err {
            UnitError::Trace(TraceError::Cancelled) => FailureReason::Cancelled,
            UnitError::Trace(TraceError::RunFailed(RunFailure {
                reason: FailureReason::Cancelled,
                ..
            })) => FailureReason::Cancelled,
            other => FailureReason::Unit {
                message: other.to_string(),
            },
        }
    }
}

/// Top-level error type of the tracing API.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TraceError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Combine(#[from] CombineError),
    /// Input, chunk or output could not be converted to a JSON payload.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Explicit output disagrees with the chunks already emitted.
    #[error("chunk/output mismatch in run {run_id}: chunks combine to {accumulated}, output is {explicit}")]
    ChunkMismatch {
        run_id: Uuid,
        accumulated: Value,
        explicit: Value,
    },
    /// The run already reached a terminal state; no further events are accepted.
    #[error("run {run_id} is closed")]
    RunClosed { run_id: Uuid },
    /// A run failed; no end event was emitted for it.
    #[error(transparent)]
    RunFailed(RunFailure),
    /// The trace was aborted before the root run completed.
    #[error("cancelled")]
    Cancelled,
    /// The root invocation panicked; its open runs were failed.
    #[error("unit panicked: {0}")]
    Panicked(String),
    /// Invalid tracer configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for TraceError {
    fn from(value: serde_json::Error) -> Self {
        TraceError::Serialization(value.to_string())
    }
}

impl From<RunFailure> for TraceError {
    fn from(value: RunFailure) -> Self {
        TraceError::RunFailed(value)
    }
}
