use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use futures::stream;
use runtrace_core::prelude::*;

/// Answers a question the way a small agent would: render a prompt, stream a
/// model completion, then post-process it with a tool.
pub struct Agent {
    pub model: String,
}

fn prompt_unit() -> impl Runnable<Input = String, Output = String> {
    RunnableLambda::new("question_prompt", |question: String| async move {
        Ok::<_, UnitError>(format!("Answer briefly: {question}"))
    })
    .with_kind(RunKind::Prompt)
}

fn model_unit(model: &str) -> impl Runnable<Input = String, Output = String> {
    StreamingLambda::new("echo_model", |prompt: String| {
        let words: Vec<String> = prompt
            .split_whitespace()
            .skip(2)
            .map(|w| format!("{w} "))
            .collect();
        stream::iter(words)
            .then(|word| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, UnitError>(word)
            })
            .boxed()
    })
    .with_kind(RunKind::Llm)
    .with_config(
        RunConfig::new()
            .with_tag("model")
            .with_metadata("model_name", model.to_string()),
    )
}

fn word_count_unit() -> impl Runnable<Input = String, Output = i64> {
    RunnableLambda::new("word_count", |text: String| async move {
        Ok::<_, UnitError>(text.split_whitespace().count() as i64)
    })
    .with_kind(RunKind::Tool)
}

#[async_trait]
impl Runnable for Agent {
    type Input = String;
    type Output = String;

    fn name(&self) -> String {
        "agent".into()
    }

    fn config(&self) -> RunConfig {
        RunConfig::new()
            .with_tag("agent")
            .with_metadata("model_name", "unset")
            .with_metadata("scenario", "nested")
    }

    async fn run(&self, question: String, run: &mut RunHandle<String>) -> Result<Option<String>, UnitError> {
        let ctx = run.context();
        let prompt = ctx
            .invoke(&prompt_unit(), question, RunConfig::new())
            .await?
            .unwrap_or_default();
        let answer = ctx
            .invoke(&model_unit(&self.model), prompt, RunConfig::new())
            .await?
            .unwrap_or_default();
        let words = ctx
            .invoke(&word_count_unit(), answer.clone(), RunConfig::new())
            .await?
            .unwrap_or_default();
        let answer = answer.trim_end().to_string();
        run.stream(answer.clone()).await?;
        run.stream(format!(" ({words} words)")).await?;
        Ok(None)
    }
}
