//! Common imports for writing and tracing units.
//!
//! Exports the types most units and consumers touch so application code
//! needs fewer import lines.
pub use crate::{
    AbortHandle, Combine, EventStream, FailureReason, RunConfig, RunContext, RunHandle, RunKind,
    Runnable, RunnableExt, RunnableLambda, StreamEvent, StreamingLambda, TraceError, Tracer,
    TracerConfig, UnitError,
};
