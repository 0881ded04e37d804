//! Event envelope: the immutable record emitted for every run phase transition.
//!
//! The payload is a sum type keyed by phase ([`EventData`]), so a `stream`
//! envelope without a chunk, or an `end` envelope carrying one, cannot be
//! built through the typed constructors. The flat wire shape
//! (`{"input"?, "output"?, "chunk"?}`) is only accepted through
//! [`EventData::from_parts`], which applies the same rules at runtime.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::EnvelopeError;

/// Kind of unit that emitted an event.
///
/// `llm`, `prompt`, `tool` and `chain` are reserved; other kinds may be used
/// through [`RunKind::custom`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RunKind {
    /// Chat and completion models.
    Llm,
    /// Prompt templates.
    Prompt,
    /// Tools invoked by a model or a chain.
    Tool,
    /// Everything else; the default for composed units.
    Chain,
    /// Non-reserved kind (lowercase ascii, digits and `_`).
    Custom(String),
}

impl RunKind {
    /// Creates a custom kind, mapping reserved names onto their variants.
    pub fn custom(kind: impl Into<String>) -> Result<Self, EnvelopeError> {
        let kind = kind.into();
        match kind.as_str() {
            "llm" => return Ok(Self::Llm),
            "prompt" => return Ok(Self::Prompt),
            "tool" => return Ok(Self::Tool),
            "chain" => return Ok(Self::Chain),
            _ => {}
        }
        let valid = !kind.is_empty()
            && !kind.starts_with('_')
            && !kind.ends_with('_')
            && kind
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(EnvelopeError::InvalidKind(kind));
        }
        Ok(Self::Custom(kind))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Llm => "llm",
            Self::Prompt => "prompt",
            Self::Tool => "tool",
            Self::Chain => "chain",
            Self::Custom(kind) => kind,
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for RunKind {
    type Error = EnvelopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::custom(value)
    }
}

impl From<RunKind> for String {
    fn from(value: RunKind) -> Self {
        value.as_str().to_string()
    }
}

/// Lifecycle phase of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Start,
    Stream,
    End,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stream => "stream",
            Self::End => "end",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stream" => Ok(Self::Stream),
            "end" => Ok(Self::End),
            other => Err(EnvelopeError::InvalidEventName(other.to_string())),
        }
    }
}

/// Event type name of the form `on_<kind>_<phase>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventName {
    pub kind: RunKind,
    pub phase: Phase,
}

impl EventName {
    pub fn new(kind: RunKind, phase: Phase) -> Self {
        Self { kind, phase }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "on_{}_{}", self.kind, self.phase)
    }
}

impl FromStr for EventName {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EnvelopeError::InvalidEventName(s.to_string());
        let rest = s.strip_prefix("on_").ok_or_else(invalid)?;
        let (kind, phase) = rest.rsplit_once('_').ok_or_else(invalid)?;
        let phase = phase.parse::<Phase>().map_err(|_| invalid())?;
        let kind = RunKind::custom(kind).map_err(|_| invalid())?;
        Ok(Self { kind, phase })
    }
}

impl TryFrom<String> for EventName {
    type Error = EnvelopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EventName> for String {
    fn from(value: EventName) -> Self {
        value.to_string()
    }
}

/// Phase-shaped event payload.
#[derive(Clone, Debug, PartialEq)]
pub enum EventData {
    /// Input is present only when it is known when the run starts.
    Start { input: Option<Value> },
    /// Exactly one output chunk.
    Stream { chunk: Value },
    /// Final output, plus the input when it was not emitted at start.
    End {
        input: Option<Value>,
        output: Option<Value>,
    },
}

impl EventData {
    pub fn start(input: Option<Value>) -> Self {
        Self::Start { input }
    }

    pub fn stream(chunk: Value) -> Self {
        Self::Stream { chunk }
    }

    pub fn end(input: Option<Value>, output: Option<Value>) -> Self {
        Self::End { input, output }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::Start { .. } => Phase::Start,
            Self::Stream { .. } => Phase::Stream,
            Self::End { .. } => Phase::End,
        }
    }

    pub fn input(&self) -> Option<&Value> {
        match self {
            Self::Start { input } | Self::End { input, .. } => input.as_ref(),
            Self::Stream { .. } => None,
        }
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            Self::End { output, .. } => output.as_ref(),
            _ => None,
        }
    }

    pub fn chunk(&self) -> Option<&Value> {
        match self {
            Self::Stream { chunk } => Some(chunk),
            _ => None,
        }
    }

    /// Builds a payload from the flat wire fields, rejecting combinations that
    /// contradict `phase`.
    pub fn from_parts(
        phase: Phase,
        input: Option<Value>,
        output: Option<Value>,
        chunk: Option<Value>,
    ) -> Result<Self, EnvelopeError> {
        match phase {
            Phase::Start => {
                if output.is_some() {
                    return Err(EnvelopeError::UnexpectedField { phase, field: "output" });
                }
                if chunk.is_some() {
                    return Err(EnvelopeError::UnexpectedField { phase, field: "chunk" });
                }
                Ok(Self::Start { input })
            }
            Phase::Stream => {
                if input.is_some() {
                    return Err(EnvelopeError::UnexpectedField { phase, field: "input" });
                }
                if output.is_some() {
                    return Err(EnvelopeError::UnexpectedField { phase, field: "output" });
                }
                let chunk = chunk.ok_or(EnvelopeError::MissingChunk)?;
                Ok(Self::Stream { chunk })
            }
            Phase::End => {
                if chunk.is_some() {
                    return Err(EnvelopeError::UnexpectedField { phase, field: "chunk" });
                }
                Ok(Self::End { input, output })
            }
        }
    }
}

impl Serialize for EventData {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireEventData {
            input: self.input().cloned(),
            output: self.output().cloned(),
            chunk: self.chunk().cloned(),
        }
        .serialize(serializer)
    }
}

/// Flat payload as it appears on the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WireEventData {
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    input: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    chunk: Option<Value>,
}

// A field that is present (even as `null`) is `Some`; only a missing field is `None`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// One lifecycle event of one run.
///
/// Fields are private; an envelope cannot change after construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireStreamEvent")]
pub struct StreamEvent {
    event: EventName,
    name: String,
    run_id: Uuid,
    tags: Vec<String>,
    metadata: BTreeMap<String, Value>,
    data: EventData,
}

impl StreamEvent {
    /// Creates an envelope. The phase in the event name is taken from `data`.
    pub fn new(
        kind: RunKind,
        name: impl Into<String>,
        run_id: Uuid,
        tags: Vec<String>,
        metadata: BTreeMap<String, Value>,
        data: EventData,
    ) -> Self {
        Self {
            event: EventName::new(kind, data.phase()),
            name: name.into(),
            run_id,
            tags,
            metadata,
            data,
        }
    }

    pub fn event(&self) -> &EventName {
        &self.event
    }

    pub fn kind(&self) -> &RunKind {
        &self.event.kind
    }

    pub fn phase(&self) -> Phase {
        self.event.phase
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }
}

#[derive(Deserialize)]
struct WireStreamEvent {
    event: EventName,
    name: String,
    run_id: Uuid,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
    #[serde(default)]
    data: WireEventData,
}

impl TryFrom<WireStreamEvent> for StreamEvent {
    type Error = EnvelopeError;

    fn try_from(wire: WireStreamEvent) -> Result<Self, Self::Error> {
        let WireEventData {
            input,
            output,
            chunk,
        } = wire.data;
        let data = EventData::from_parts(wire.event.phase, input, output, chunk)?;
        Ok(Self {
            event: wire.event,
            name: wire.name,
            run_id: wire.run_id,
            tags: wire.tags,
            metadata: wire.metadata,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_name_round_trips_reserved_and_custom_kinds() {
        let name: EventName = "on_chain_start".parse().expect("parse");
        assert_eq!(name, EventName::new(RunKind::Chain, Phase::Start));

        let name: EventName = "on_chat_model_stream".parse().expect("parse");
        assert_eq!(name.kind, RunKind::Custom("chat_model".into()));
        assert_eq!(name.phase, Phase::Stream);
        assert_eq!(name.to_string(), "on_chat_model_stream");
    }

    #[test]
    fn event_name_rejects_malformed_names() {
        for raw in ["chain_start", "on_chain_finish", "on__start", "on_Chain_end", "on_end"] {
            assert!(
                raw.parse::<EventName>().is_err(),
                "expected `{raw}` to be rejected"
            );
        }
    }

    #[test]
    fn stream_payload_requires_chunk_only() {
        assert!(matches!(
            EventData::from_parts(Phase::Stream, None, None, None),
            Err(EnvelopeError::MissingChunk)
        ));
        assert!(matches!(
            EventData::from_parts(Phase::Stream, Some(json!("x")), None, Some(json!("c"))),
            Err(EnvelopeError::UnexpectedField { field: "input", .. })
        ));
        assert!(matches!(
            EventData::from_parts(Phase::Stream, None, Some(json!("x")), Some(json!("c"))),
            Err(EnvelopeError::UnexpectedField { field: "output", .. })
        ));
    }

    #[test]
    fn start_and_end_reject_chunks() {
        assert!(EventData::from_parts(Phase::Start, None, None, Some(json!(1))).is_err());
        assert!(EventData::from_parts(Phase::Start, None, Some(json!(1)), None).is_err());
        assert!(EventData::from_parts(Phase::End, None, None, Some(json!(1))).is_err());
        let end = EventData::from_parts(Phase::End, Some(json!("in")), Some(json!("out")), None)
            .expect("end with input and output");
        assert_eq!(end.input(), Some(&json!("in")));
        assert_eq!(end.output(), Some(&json!("out")));
    }

    #[test]
    fn serializes_to_flat_wire_shape() {
        let event = StreamEvent::new(
            RunKind::Chain,
            "reverse",
            Uuid::nil(),
            vec![],
            BTreeMap::new(),
            EventData::stream(json!("o")),
        );
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(
            value,
            json!({
                "event": "on_chain_stream",
                "name": "reverse",
                "run_id": "00000000-0000-0000-0000-000000000000",
                "tags": [],
                "metadata": {},
                "data": {"chunk": "o"},
            })
        );
    }

    #[test]
    fn deserialization_applies_phase_rules() {
        let bad = json!({
            "event": "on_tool_end",
            "name": "search",
            "run_id": Uuid::new_v4(),
            "data": {"chunk": "x"},
        });
        assert!(serde_json::from_value::<StreamEvent>(bad).is_err());

        let good = json!({
            "event": "on_tool_start",
            "name": "search",
            "run_id": Uuid::new_v4(),
            "data": {"input": null},
        });
        let event: StreamEvent = serde_json::from_value(good).expect("valid start");
        assert_eq!(event.data().input(), Some(&Value::Null));
        assert!(event.tags().is_empty());
        assert_eq!(event.kind(), &RunKind::Tool);
    }
}
