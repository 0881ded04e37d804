//! Consumer-side checks over a recorded sequence of envelopes.
//!
//! [`validate_trace`] verifies the per-run ordering rules on events as they
//! were received (start first, chunks in between, nothing after the end, the
//! same identity on every event of a run) and summarizes each run. Runs that
//! failed or were cut off by a detached consumer have no end event; they are
//! reported with `ended == false` rather than as violations.

use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::chunk::{ChunkAccumulator, Combine};
use crate::errors::TraceError;
use crate::event::{EventName, Phase, StreamEvent};

/// An ordering or identity rule broken by a recorded trace.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TraceViolation {
    #[error("event #{index} ({event}) for run {run_id} precedes its start event")]
    BeforeStart {
        index: usize,
        run_id: Uuid,
        event: EventName,
    },
    #[error("event #{index} ({event}) for run {run_id} follows its end event")]
    AfterEnd {
        index: usize,
        run_id: Uuid,
        event: EventName,
    },
    #[error("event #{index} is a second start event for run {run_id}")]
    DuplicateStart { index: usize, run_id: Uuid },
    #[error("event #{index} for run {run_id} changes its {field}")]
    IdentityChanged {
        index: usize,
        run_id: Uuid,
        field: &'static str,
    },
    #[error("run {run_id} reports its input on both start and end")]
    InputRepeated { run_id: Uuid },
}

/// What a recorded trace says about one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub name: String,
    pub event: EventName,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, Value>,
    /// Index of the start event in the recorded sequence.
    pub started_at: usize,
    /// Index of the end event, `None` if the run never ended.
    pub ended_at: Option<usize>,
    pub chunks: Vec<Value>,
    pub input: Option<Value>,
    pub output: Option<Value>,
}

impl RunSummary {
    pub fn ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Folds the run's chunks as `O`. `None` when the run streamed nothing.
    pub fn combined_chunks<O>(&self) -> Result<Option<O>, TraceError>
    where
        O: Combine + DeserializeOwned,
    {
        let mut acc = ChunkAccumulator::new();
        for chunk in &self.chunks {
            acc.push(serde_json::from_value::<O>(chunk.clone())?)?;
        }
        Ok(acc.take())
    }

    /// The run's output: the explicit end output, else the folded chunks.
    pub fn resolved_output<O>(&self) -> Result<Option<O>, TraceError>
    where
        O: Combine + DeserializeOwned,
    {
        match &self.output {
            Some(output) => Ok(Some(serde_json::from_value(output.clone())?)),
            None => self.combined_chunks(),
        }
    }
}

/// Runs of a recorded trace in order of their start events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceSummary {
    runs: Vec<RunSummary>,
}

impl TraceSummary {
    pub fn runs(&self) -> &[RunSummary] {
        &self.runs
    }

    pub fn run(&self, run_id: Uuid) -> Option<&RunSummary> {
        self.runs.iter().find(|r| r.run_id == run_id)
    }

    /// First run started under `name`.
    pub fn by_name(&self, name: &str) -> Option<&RunSummary> {
        self.runs.iter().find(|r| r.name == name)
    }

    /// Runs that started but have no end event.
    pub fn unfinished(&self) -> impl Iterator<Item = &RunSummary> {
        self.runs.iter().filter(|r| !r.ended())
    }
}

/// Checks a recorded event sequence and summarizes every run in it.
pub fn validate_trace(events: &[StreamEvent]) -> Result<TraceSummary, TraceViolation> {
    let mut runs: Vec<RunSummary> = Vec::new();
    let mut index_of: HashMap<Uuid, usize> = HashMap::new();

    for (index, event) in events.iter().enumerate() {
        let run_id = event.run_id();
        let slot = index_of.get(&run_id).copied();

        if event.phase() == Phase::Start {
            if slot.is_some() {
                return Err(TraceViolation::DuplicateStart { index, run_id });
            }
            index_of.insert(run_id, runs.len());
            runs.push(RunSummary {
                run_id,
                name: event.name().to_string(),
                event: event.event().clone(),
                tags: event.tags().to_vec(),
                metadata: event.metadata().clone(),
                started_at: index,
                ended_at: None,
                chunks: Vec::new(),
                input: event.data().input().cloned(),
                output: None,
            });
            continue;
        }

        let Some(slot) = slot else {
            return Err(TraceViolation::BeforeStart {
                index,
                run_id,
                event: event.event().clone(),
            });
        };
        let run = &mut runs[slot];
        if run.ended_at.is_some() {
            return Err(TraceViolation::AfterEnd {
                index,
                run_id,
                event: event.event().clone(),
            });
        }
        check_identity(index, run, event)?;

        match event.phase() {
            Phase::Stream => {
                if let Some(chunk) = event.data().chunk() {
                    run.chunks.push(chunk.clone());
                }
            }
            Phase::End => {
                if let Some(input) = event.data().input() {
                    if run.input.is_some() {
                        return Err(TraceViolation::InputRepeated { run_id });
                    }
                    run.input = Some(input.clone());
                }
                run.output = event.data().output().cloned();
                run.ended_at = Some(index);
            }
            Phase::Start => {}
        }
    }

    Ok(TraceSummary { runs })
}

fn check_identity(
    index: usize,
    run: &RunSummary,
    event: &StreamEvent,
) -> Result<(), TraceViolation> {
    let field = if event.name() != run.name {
        "name"
    } else if event.kind() != &run.event.kind {
        "kind"
    } else if event.tags() != run.tags.as_slice() {
        "tags"
    } else if event.metadata() != &run.metadata {
        "metadata"
    } else {
        return Ok(());
    };
    Err(TraceViolation::IdentityChanged {
        index,
        run_id: run.run_id,
        field,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventData, RunKind};
    use serde_json::json;

    fn event(kind: RunKind, name: &str, run_id: Uuid, data: EventData) -> StreamEvent {
        StreamEvent::new(kind, name, run_id, vec![], BTreeMap::new(), data)
    }

    #[test]
    fn summarizes_a_well_formed_run() {
        let id = Uuid::new_v4();
        let events = vec![
            event(RunKind::Chain, "reverse", id, EventData::start(Some(json!("hello")))),
            event(RunKind::Chain, "reverse", id, EventData::stream(json!("ol"))),
            event(RunKind::Chain, "reverse", id, EventData::stream(json!("leh"))),
            event(RunKind::Chain, "reverse", id, EventData::end(None, None)),
        ];
        let summary = validate_trace(&events).expect("valid");
        let run = summary.run(id).expect("run");
        assert!(run.ended());
        assert_eq!(run.input, Some(json!("hello")));
        assert_eq!(
            run.resolved_output::<String>().expect("fold").as_deref(),
            Some("olleh")
        );
    }

    #[test]
    fn chunk_before_start_is_rejected() {
        let id = Uuid::new_v4();
        let events = vec![event(RunKind::Llm, "m", id, EventData::stream(json!("x")))];
        assert!(matches!(
            validate_trace(&events),
            Err(TraceViolation::BeforeStart { index: 0, .. })
        ));
    }

    #[test]
    fn chunk_after_end_is_rejected() {
        let id = Uuid::new_v4();
        let events = vec![
            event(RunKind::Llm, "m", id, EventData::start(None)),
            event(RunKind::Llm, "m", id, EventData::end(None, Some(json!("a")))),
            event(RunKind::Llm, "m", id, EventData::stream(json!("b"))),
        ];
        assert!(matches!(
            validate_trace(&events),
            Err(TraceViolation::AfterEnd { index: 2, .. })
        ));
    }

    #[test]
    fn identity_must_not_change_within_a_run() {
        let id = Uuid::new_v4();
        let events = vec![
            event(RunKind::Tool, "search", id, EventData::start(None)),
            event(RunKind::Tool, "lookup", id, EventData::end(None, None)),
        ];
        assert_eq!(
            validate_trace(&events),
            Err(TraceViolation::IdentityChanged {
                index: 1,
                run_id: id,
                field: "name"
            })
        );
    }

    #[test]
    fn input_on_both_start_and_end_is_rejected() {
        let id = Uuid::new_v4();
        let events = vec![
            event(RunKind::Chain, "c", id, EventData::start(Some(json!(1)))),
            event(RunKind::Chain, "c", id, EventData::end(Some(json!(1)), None)),
        ];
        assert_eq!(
            validate_trace(&events),
            Err(TraceViolation::InputRepeated { run_id: id })
        );
    }

    #[test]
    fn runs_without_end_are_listed_as_unfinished() {
        let done = Uuid::new_v4();
        let failed = Uuid::new_v4();
        let events = vec![
            event(RunKind::Chain, "outer", done, EventData::start(None)),
            event(RunKind::Tool, "inner", failed, EventData::start(None)),
            event(RunKind::Chain, "outer", done, EventData::end(None, None)),
        ];
        let summary = validate_trace(&events).expect("valid");
        let unfinished: Vec<&str> = summary.unfinished().map(|r| r.name.as_str()).collect();
        assert_eq!(unfinished, ["inner"]);
        assert_eq!(summary.by_name("outer").and_then(|r| r.ended_at), Some(2));
    }
}
