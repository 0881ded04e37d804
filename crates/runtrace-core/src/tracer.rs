use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt as _;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use crate::config::TracerConfig;
use crate::context::RunConfig;
use crate::errors::{FailureReason, TraceError};
use crate::runnable::Runnable;
use crate::stream::{AbortHandle, EventStream};
use crate::tracker::{RunContext, TraceState};

/// Entry point: invokes a root unit and exposes the events of its whole call
/// tree as one stream.
#[derive(Clone, Debug, Default)]
pub struct Tracer {
    config: TracerConfig,
}

impl Tracer {
    /// Creates a tracer after validating `config`.
    pub fn new(config: TracerConfig) -> Result<Self, TraceError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Creates a tracer configured from `RUNTRACE_*` environment variables.
    pub fn from_env() -> Result<Self, TraceError> {
        Self::new(TracerConfig::from_env()?)
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    /// Invokes `runnable` on a spawned task and returns the stream of its
    /// trace. `config` is the caller's invocation-time config for the root run.
    ///
    /// Must be called from within a tokio runtime.
    pub fn stream_events<R>(
        &self,
        runnable: Arc<R>,
        input: R::Input,
        config: RunConfig,
    ) -> EventStream<R::Output>
    where
        R: Runnable + ?Sized + 'static,
    {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer_capacity);
        let (abort_tx, abort_rx) = watch::channel(false);
        let (final_tx, final_rx) = oneshot::channel();
        let trace = Arc::new(TraceState::new(tx, &self.config, abort_rx));
        let root = RunContext::root(trace.clone());
        let trace_id = trace.trace_id();
        let name = runnable.name();

        tokio::spawn(async move {
            info!(trace_id = %trace_id, name = %name, "trace opened");
            let invocation = AssertUnwindSafe(root.invoke(&*runnable, input, config)).catch_unwind();
            let result = tokio::select! {
                outcome = invocation => match outcome {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!(trace_id = %trace_id, name = %name, panic = %message, "unit panicked; failing open runs");
                        root.trace.relabel_abandoned(&FailureReason::Panicked {
                            message: message.clone(),
                        });
                        Err(TraceError::Panicked(message))
                    }
                },
                _ = root.cancelled() => Err(TraceError::Cancelled),
            };
            root.trace.seal().await;
            match &result {
                Ok(_) => info!(trace_id = %trace_id, name = %name, "trace completed"),
                Err(err) => warn!(trace_id = %trace_id, name = %name, error = %err, "trace failed"),
            }
            let _ = final_tx.send(result);
        });

        EventStream::new(trace, rx, final_rx, AbortHandle::new(abort_tx))
    }

    /// Invokes `runnable` without consuming its events and returns the root
    /// run's output.
    pub async fn invoke<R>(
        &self,
        runnable: Arc<R>,
        input: R::Input,
        config: RunConfig,
    ) -> Result<Option<R::Output>, TraceError>
    where
        R: Runnable + ?Sized + 'static,
    {
        self.stream_events(runnable, input, config).finish().await
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::UnitError;
    use crate::runnable::RunnableLambda;
    use std::time::Duration;

    #[test]
    fn new_rejects_invalid_config() {
        let err = Tracer::new(TracerConfig::default().stream_buffer_capacity(0))
            .expect_err("zero capacity");
        assert!(matches!(err, TraceError::Config(_)));
    }

    #[tokio::test]
    async fn invoke_returns_root_output() {
        let unit = Arc::new(RunnableLambda::new("double", |n: i64| async move {
            Ok::<_, UnitError>(n * 2)
        }));
        let output = Tracer::default()
            .invoke(unit, 21, RunConfig::new())
            .await
            .expect("invoke");
        assert_eq!(output, Some(42));
    }

    #[tokio::test]
    async fn abort_fails_the_root_run_as_cancelled() {
        let unit = Arc::new(RunnableLambda::new("slow", |_: ()| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, UnitError>("never".to_string())
        }));
        let mut stream = Tracer::default().stream_events(unit, (), RunConfig::new());
        let first = stream.next_event().await.expect("start event").expect("ok");
        stream.abort_handle().abort();

        let failure = stream
            .next_event()
            .await
            .expect("failure item")
            .expect_err("root failed");
        assert_eq!(failure.run_id, first.run_id());
        assert_eq!(failure.reason, FailureReason::Cancelled);
        assert!(stream.next_event().await.is_none());
        assert!(matches!(stream.finish().await, Err(TraceError::Cancelled)));
    }

    #[tokio::test]
    async fn panicking_unit_fails_its_run_and_ends_the_stream() {
        let unit = Arc::new(RunnableLambda::new("explodes", |fail: bool| async move {
            if fail {
                panic!("unit bug");
            }
            Ok::<_, UnitError>("fine".to_string())
        }));
        let mut stream = Tracer::default().stream_events(unit, true, RunConfig::new());

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            let mut items = Vec::new();
            while let Some(item) = stream.next_event().await {
                items.push(item);
            }
            items
        })
        .await
        .expect("stream ends after a panic");

        assert_eq!(drained.len(), 2);
        let start = drained[0].as_ref().expect("start event");
        let failure = drained[1].as_ref().expect_err("failure item");
        assert_eq!(failure.run_id, start.run_id());
        assert_eq!(
            failure.reason,
            FailureReason::Panicked {
                message: "unit bug".into()
            }
        );
        assert_eq!(
            stream.finish().await,
            Err(TraceError::Panicked("unit bug".into()))
        );
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "non-string panic payload");
    }
}
