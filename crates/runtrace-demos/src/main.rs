//! Runs a demo unit under the tracer and prints its events as JSONL.

mod scenarios;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use runtrace_core::prelude::*;
use runtrace_core::init_observability;

use crate::scenarios::{Agent, FanOut, Fallback, Strict, reverse_unit, write_jsonl};

#[derive(Parser, Debug)]
#[command(name = "runtrace-demos", about = "Print the event trace of a demo unit as JSONL")]
struct Cli {
    /// Tag attached to the root run (repeatable).
    #[arg(long = "tag", global = true)]
    tags: Vec<String>,

    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand, Debug)]
enum Scenario {
    /// Stream the characters of TEXT in reverse.
    Reverse {
        #[arg(default_value = "hello")]
        text: String,
    },
    /// Prompt -> model -> tool chain with inherited tags and metadata.
    Nested {
        #[arg(default_value = "why is the sky blue")]
        question: String,
        #[arg(long, default_value = "echo-1")]
        model: String,
    },
    /// Concurrent child runs under one parent.
    Parallel {
        #[arg(long, default_value_t = 4)]
        width: i64,
        #[arg(long, default_value_t = 1)]
        start: i64,
    },
    /// A failing tool call, recovered from or propagated.
    Failing {
        #[arg(default_value = "rust")]
        query: String,
        /// Propagate the tool failure instead of falling back.
        #[arg(long)]
        strict: bool,
    },
}

async fn trace<R>(tracer: &Tracer, unit: R, input: R::Input, config: RunConfig) -> Result<(), Box<dyn std::error::Error>>
where
    R: Runnable + 'static,
{
    let mut events = tracer.stream_events(Arc::new(unit), input, config);
    let trace_id = events.trace_id();
    let mut stdout = std::io::stdout().lock();
    let written = write_jsonl(&mut events, &mut stdout).await?;
    match events.finish().await {
        Ok(output) => {
            let output = serde_json::to_string(&output)?;
            tracing::info!(%trace_id, events = written.events, failures = written.failures, %output, "trace finished");
        }
        Err(err) => {
            tracing::error!(%trace_id, events = written.events, failures = written.failures, error = %err, "trace failed");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_observability();

    let cli = Cli::parse();
    let tracer = Tracer::from_env()?;
    let config = RunConfig::new().with_tags(cli.tags);

    match cli.scenario {
        Scenario::Reverse { text } => trace(&tracer, reverse_unit(), text, config).await,
        Scenario::Nested { question, model } => trace(&tracer, Agent { model }, question, config).await,
        Scenario::Parallel { width, start } => trace(&tracer, FanOut { width }, start, config).await,
        Scenario::Failing { query, strict: false } => trace(&tracer, Fallback, query, config).await,
        Scenario::Failing { query, strict: true } => trace(&tracer, Strict, query, config).await,
    }
}
