//! Execution-event tracing for nested units of work.
//!
//! Invoking a root [`Runnable`] through [`Tracer::stream_events`] yields one
//! [`EventStream`] covering the whole call tree: a start event for every run,
//! zero or more stream events carrying output chunks, then an end event (or a
//! [`RunFailure`] in its place). Tags are inherited from the parent run and
//! metadata is merged, child keys winning.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use runtrace_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), TraceError> {
//! let reverse = RunnableLambda::new("reverse", |s: String| async move {
//!     Ok::<_, UnitError>(s.chars().rev().collect::<String>())
//! });
//!
//! let tracer = Tracer::new(TracerConfig::default())?;
//! let mut events = tracer.stream_events(Arc::new(reverse), "hello".into(), RunConfig::new());
//! while let Some(item) = events.next_event().await {
//!     match item {
//!         Ok(event) => println!("{}", serde_json::to_string(&event)?),
//!         Err(failure) => eprintln!("{failure}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Chunk combination contract and accumulator.
pub mod chunk;
/// Tracer configuration and emission policies.
pub mod config;
/// Invocation config and inherited run context.
pub mod context;
/// Public error types.
pub mod errors;
/// Event envelopes and their names.
pub mod event;
/// Process-wide logging setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Units of work and the lambda adapters.
pub mod runnable;
/// Consumer side of a trace.
pub mod stream;
/// Tracer entry point.
pub mod tracer;
/// Run arena, run contexts and run handles.
pub mod tracker;
/// Checks over recorded traces.
pub mod validate;

pub use chunk::{ChunkAccumulator, Combine};
pub use config::{FailurePolicy, OutputPolicy, TracerConfig};
pub use context::{ResolvedContext, RunConfig};
pub use errors::{CombineError, EnvelopeError, FailureReason, RunFailure, TraceError, UnitError};
pub use event::{EventData, EventName, Phase, RunKind, StreamEvent};
pub use observability::{LogSettings, init_observability};
pub use runnable::{Bound, Runnable, RunnableExt, RunnableLambda, StreamingLambda};
pub use stream::{AbortHandle, EventStream};
pub use tracer::Tracer;
pub use tracker::{RunContext, RunHandle, RunRecord, RunState};
pub use validate::{RunSummary, TraceSummary, TraceViolation, validate_trace};
