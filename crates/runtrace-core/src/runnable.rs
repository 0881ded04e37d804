//! Units of work and how they are invoked under a run.
//!
//! A [`Runnable`] only computes; [`RunContext::invoke`] wraps every call in a
//! run (start event, chunks, end event or failure). Units call nested units
//! through `run.context().invoke(..)`, which makes them children of the
//! current run.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::chunk::Combine;
use crate::context::RunConfig;
use crate::errors::{FailureReason, TraceError, UnitError};
use crate::event::RunKind;
use crate::tracker::{RunContext, RunHandle};

/// A composable, invocable unit of work.
#[async_trait]
pub trait Runnable: Send + Sync {
    type Input: Serialize + Send + 'static;
    type Output: Combine + Serialize + PartialEq + Send + Sync + 'static;

    /// Display name used in emitted events.
    fn name(&self) -> String;

    fn kind(&self) -> RunKind {
        RunKind::Chain
    }

    /// Tags and metadata bound to this unit ahead of time.
    fn config(&self) -> RunConfig {
        RunConfig::default()
    }

    /// `true` when the input is itself streamed in, so it is only reported on
    /// the end event.
    fn streams_input(&self) -> bool {
        false
    }

    /// Executes the unit. Chunks go through `run.stream(..)`; nested units are
    /// invoked through `run.context()`.
    ///
    /// Returning `Ok(None)` makes the output the combination of the streamed
    /// chunks.
    async fn run(
        &self,
        input: Self::Input,
        run: &mut RunHandle<Self::Output>,
    ) -> Result<Option<Self::Output>, UnitError>;
}

impl RunContext {
    /// Invokes `runnable` as a run under this context.
    ///
    /// `config` is the caller's invocation-time config, layered over the
    /// unit's bound config. On success returns the run's output (`None` if it
    /// produced nothing); if the unit fails, the run fails and the error is
    /// [`TraceError::RunFailed`].
    pub async fn invoke<R>(
        &self,
        runnable: &R,
        input: R::Input,
        config: RunConfig,
    ) -> Result<Option<R::Output>, TraceError>
    where
        R: Runnable + ?Sized,
    {
        let own = runnable.config().merge(&config);
        let payload = serde_json::to_value(&input)?;
        let (start_input, end_input) = if runnable.streams_input() {
            (None, Some(payload))
        } else {
            (Some(payload), None)
        };
        let mut run = self
            .start_run::<R::Output>(runnable.kind(), runnable.name(), &own, start_input)
            .await?;
        match runnable.run(input, &mut run).await {
            Ok(output) => match end_input {
                Some(input) => run.end_with_input(input, output).await,
                None => run.end(output).await,
            },
            Err(err) => {
                let failure = run.fail(FailureReason::from(&err)).await;
                Err(TraceError::RunFailed(failure))
            }
        }
    }
}

/// Unit built from an async function. Its whole result is emitted as a single
/// chunk before the end event.
pub struct RunnableLambda<F, I, O> {
    name: String,
    kind: RunKind,
    func: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<F, I, O> RunnableLambda<F, I, O> {
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            kind: RunKind::Chain,
            func,
            _marker: PhantomData,
        }
    }

    pub fn with_kind(mut self, kind: RunKind) -> Self {
        self.kind = kind;
        self
    }
}

#[async_trait]
impl<F, Fut, I, O> Runnable for RunnableLambda<F, I, O>
where
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, UnitError>> + Send,
    I: Serialize + Send + 'static,
    O: Combine + Serialize + PartialEq + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> RunKind {
        self.kind.clone()
    }

    async fn run(&self, input: I, run: &mut RunHandle<O>) -> Result<Option<O>, UnitError> {
        let output = (self.func)(input).await?;
        run.stream(output.clone()).await?;
        Ok(Some(output))
    }
}

/// Unit whose output is produced as a stream of chunks.
pub struct StreamingLambda<F, I, O> {
    name: String,
    kind: RunKind,
    func: F,
    _marker: PhantomData<fn(I) -> O>,
}

impl<F, I, O> StreamingLambda<F, I, O> {
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            kind: RunKind::Chain,
            func,
            _marker: PhantomData,
        }
    }

    pub fn with_kind(mut self, kind: RunKind) -> Self {
        self.kind = kind;
        self
    }
}

#[async_trait]
impl<F, I, O> Runnable for StreamingLambda<F, I, O>
where
    F: Fn(I) -> BoxStream<'static, Result<O, UnitError>> + Send + Sync,
    I: Serialize + Send + 'static,
    O: Combine + Serialize + PartialEq + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> String {
        self.name.clone()
    }

    fn kind(&self) -> RunKind {
        self.kind.clone()
    }

    async fn run(&self, input: I, run: &mut RunHandle<O>) -> Result<Option<O>, UnitError> {
        let mut chunks = (self.func)(input);
        while let Some(chunk) = chunks.next().await {
            run.stream(chunk?).await?;
        }
        Ok(None)
    }
}

/// A unit with extra bound config (tags, metadata, run name).
pub struct Bound<R> {
    inner: R,
    config: RunConfig,
}

#[async_trait]
impl<R: Runnable> Runnable for Bound<R> {
    type Input = R::Input;
    type Output = R::Output;

    fn name(&self) -> String {
        self.config
            .run_name
            .clone()
            .unwrap_or_else(|| self.inner.name())
    }

    fn kind(&self) -> RunKind {
        self.inner.kind()
    }

    fn config(&self) -> RunConfig {
        self.inner.config().merge(&self.config)
    }

    fn streams_input(&self) -> bool {
        self.inner.streams_input()
    }

    async fn run(
        &self,
        input: Self::Input,
        run: &mut RunHandle<Self::Output>,
    ) -> Result<Option<Self::Output>, UnitError> {
        self.inner.run(input, run).await
    }
}

/// Binding helpers for every [`Runnable`].
pub trait RunnableExt: Runnable + Sized {
    /// Binds `config` to the unit; it applies to every invocation.
    fn with_config(self, config: RunConfig) -> Bound<Self> {
        Bound {
            inner: self,
            config,
        }
    }

    fn with_tags<I, S>(self, tags: I) -> Bound<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_config(RunConfig::new().with_tags(tags))
    }
}

impl<R: Runnable> RunnableExt for R {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracerConfig;
    use crate::tracker::TraceState;
    use futures::{StreamExt, stream};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    fn root() -> (RunContext, mpsc::Receiver<crate::tracker::Emission>, watch::Sender<bool>) {
        let config = TracerConfig::default();
        let (tx, rx) = mpsc::channel(64);
        let (abort_tx, abort_rx) = watch::channel(false);
        (
            RunContext::root(Arc::new(TraceState::new(tx, &config, abort_rx))),
            rx,
            abort_tx,
        )
    }

    struct Echo;

    #[async_trait]
    impl Runnable for Echo {
        type Input = String;
        type Output = String;

        fn name(&self) -> String {
            "echo".into()
        }

        fn streams_input(&self) -> bool {
            true
        }

        async fn run(&self, input: String, _run: &mut RunHandle<String>) -> Result<Option<String>, UnitError> {
            Ok(Some(input))
        }
    }

    #[tokio::test]
    async fn lambda_emits_its_result_as_one_chunk() {
        let (root, _rx, _abort) = root();
        let upper = RunnableLambda::new("upper", |s: String| async move {
            Ok::<_, UnitError>(s.to_uppercase())
        });
        let output = root
            .invoke(&upper, "abc".to_string(), RunConfig::new())
            .await
            .expect("invoke");
        assert_eq!(output.as_deref(), Some("ABC"));
        let tree = root.run_tree();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].chunk_count, 1);
    }

    #[tokio::test]
    async fn streaming_lambda_output_is_the_chunk_combination() {
        let (root, _rx, _abort) = root();
        let counter = StreamingLambda::new("count", |n: i64| {
            stream::iter((1..=n).map(Ok::<i64, UnitError>)).boxed()
        });
        let output = root.invoke(&counter, 4, RunConfig::new()).await.expect("invoke");
        assert_eq!(output, Some(10));
    }

    #[tokio::test]
    async fn streaming_input_is_reported_at_end() {
        let (root, mut rx, _abort) = root();
        root.invoke(&Echo, "in".to_string(), RunConfig::new())
            .await
            .expect("invoke");
        let mut events = Vec::new();
        while let Ok(crate::tracker::Emission::Event(event)) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data().input(), None);
        assert_eq!(events[1].data().input(), Some(&json!("in")));
        assert_eq!(events[1].data().output(), Some(&json!("in")));
    }

    #[tokio::test]
    async fn bound_config_names_and_tags_the_run() {
        let (root, _rx, _abort) = root();
        let unit = Echo.with_config(RunConfig::new().with_tag("bound").named("renamed"));
        root.invoke(&unit, "x".to_string(), RunConfig::new().with_tag("call"))
            .await
            .expect("invoke");
        let record = root.run_tree().remove(0);
        assert_eq!(record.name, "renamed");
        assert_eq!(record.tags, ["bound", "call"]);
    }

    #[tokio::test]
    async fn failing_unit_fails_its_run() {
        let (root, _rx, _abort) = root();
        let broken = RunnableLambda::new("broken", |_: ()| async move {
            Err::<String, _>(UnitError::failed("nope"))
        });
        let err = root
            .invoke(&broken, (), RunConfig::new())
            .await
            .expect_err("unit error");
        match err {
            TraceError::RunFailed(failure) => {
                assert_eq!(failure.name, "broken");
                assert_eq!(
                    failure.reason,
                    FailureReason::Unit {
                        message: "nope".into()
                    }
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
