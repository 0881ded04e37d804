//! Demo units, one scenario per file.

pub mod failing;
pub mod nested;
pub mod parallel;
pub mod reverse;

use std::io::Write;

use runtrace_core::EventStream;
use serde_json::json;

pub use failing::{Fallback, Strict};
pub use nested::Agent;
pub use parallel::FanOut;
pub use reverse::reverse_unit;

/// Counts of what was written for one trace.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Written {
    pub events: usize,
    pub failures: usize,
}

/// Drains `events`, writing one JSON object per line: envelopes as they are,
/// failed runs as `{"failure": ...}`.
pub async fn write_jsonl<O, W: Write>(
    events: &mut EventStream<O>,
    out: &mut W,
) -> Result<Written, Box<dyn std::error::Error>> {
    let mut written = Written::default();
    while let Some(item) = events.next_event().await {
        match item {
            Ok(event) => {
                serde_json::to_writer(&mut *out, &event)?;
                written.events += 1;
            }
            Err(failure) => {
                serde_json::to_writer(&mut *out, &json!({ "failure": failure }))?;
                written.failures += 1;
            }
        }
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtrace_core::prelude::*;
    use runtrace_core::validate_trace;
    use std::sync::Arc;

    fn lines(buf: &[u8]) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(buf)
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect()
    }

    #[tokio::test]
    async fn reverse_writes_one_line_per_event() {
        let mut events =
            Tracer::default().stream_events(Arc::new(reverse_unit()), "abc".into(), RunConfig::new());
        let mut buf = Vec::new();
        let written = write_jsonl(&mut events, &mut buf).await.expect("write");
        assert_eq!(written, Written { events: 5, failures: 0 });

        let lines = lines(&buf);
        assert_eq!(lines[0]["event"], "on_chain_start");
        assert_eq!(lines[4]["data"]["output"], "cba");
        assert_eq!(events.finish().await.expect("finish").as_deref(), Some("cba"));
    }

    #[tokio::test]
    async fn agent_children_inherit_agent_tag() {
        let agent = Agent {
            model: "tiny".into(),
        };
        let mut stream = Tracer::default().stream_events(
            Arc::new(agent),
            "why is the sky blue".into(),
            RunConfig::new(),
        );
        let events = stream.collect_events().await;
        let summary = validate_trace(&events).expect("valid");
        assert_eq!(summary.runs().len(), 4);
        assert!(summary.runs().iter().all(|r| r.tags.first().map(String::as_str) == Some("agent")));

        let model = summary.by_name("echo_model").expect("model run");
        assert_eq!(model.event.to_string(), "on_llm_start");
        assert_eq!(model.tags, ["agent", "model"]);
        assert_eq!(model.metadata["model_name"], "tiny");
        assert_eq!(summary.by_name("agent").expect("agent").metadata["model_name"], "unset");
        assert_eq!(
            model.combined_chunks::<String>().expect("fold").as_deref(),
            Some("why is the sky blue ")
        );
        assert_eq!(
            stream.finish().await.expect("finish").as_deref(),
            Some("why is the sky blue (5 words)")
        );
    }

    #[tokio::test]
    async fn fan_out_streams_squares_in_order() {
        let output = Tracer::default()
            .invoke(Arc::new(FanOut { width: 4 }), 2, RunConfig::new())
            .await
            .expect("invoke");
        assert_eq!(output, Some(vec![4, 9, 16, 25]));
    }

    #[tokio::test]
    async fn fallback_recovers_from_failed_tool() {
        let mut events =
            Tracer::default().stream_events(Arc::new(Fallback), "rust".into(), RunConfig::new());
        let mut buf = Vec::new();
        let written = write_jsonl(&mut events, &mut buf).await.expect("write");
        assert_eq!(written, Written { events: 3, failures: 1 });

        let lines = lines(&buf);
        assert_eq!(lines[2]["failure"]["name"], "flaky_lookup");
        assert_eq!(lines[2]["failure"]["reason"]["kind"], "unit");
        assert_eq!(lines[3]["event"], "on_chain_end");
        assert!(events.finish().await.is_ok());
    }

    #[tokio::test]
    async fn strict_fails_the_whole_trace() {
        let result = Tracer::default()
            .invoke(Arc::new(Strict), "rust".into(), RunConfig::new())
            .await;
        assert!(matches!(result, Err(TraceError::RunFailed(f)) if f.name == "strict"));
    }
}
