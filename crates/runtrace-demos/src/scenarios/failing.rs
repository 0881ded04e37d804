use async_trait::async_trait;
use runtrace_core::prelude::*;

/// Calls a tool that always fails, then recovers with a fallback answer. The
/// tool's run fails without an end event; this run still ends normally.
pub struct Fallback;

fn flaky_tool() -> impl Runnable<Input = String, Output = String> {
    RunnableLambda::new("flaky_lookup", |query: String| async move {
        Err::<String, _>(UnitError::failed(format!("lookup of `{query}` timed out")))
    })
    .with_kind(RunKind::Tool)
}

#[async_trait]
impl Runnable for Fallback {
    type Input = String;
    type Output = String;

    fn name(&self) -> String {
        "fallback".into()
    }

    async fn run(&self, query: String, run: &mut RunHandle<String>) -> Result<Option<String>, UnitError> {
        match run
            .context()
            .invoke(&flaky_tool(), query.clone(), RunConfig::new())
            .await
        {
            Ok(found) => Ok(found),
            Err(TraceError::RunFailed(failure)) => {
                tracing::warn!(run_id = %failure.run_id, reason = %failure.reason, "lookup failed; using fallback");
                Ok(Some(format!("no result for `{query}`")))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Like [`Fallback`] but propagates the tool failure, so the whole trace fails.
pub struct Strict;

#[async_trait]
impl Runnable for Strict {
    type Input = String;
    type Output = String;

    fn name(&self) -> String {
        "strict".into()
    }

    async fn run(&self, query: String, run: &mut RunHandle<String>) -> Result<Option<String>, UnitError> {
        Ok(run
            .context()
            .invoke(&flaky_tool(), query, RunConfig::new())
            .await?)
    }
}
