//! Run event model and the `{type, payload}` envelope codec.
//!
//! Field spellings follow the producer: suite-level payloads are camelCase,
//! per-test payloads use `Name`/`Status`/`Stage`/`DurationMs`/`Messages`.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::model::SuiteSummary;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStart {
    #[serde(default)]
    pub total: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteStart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub total: u64,
    /// Announced stage index -> expected test count.
    #[serde(default)]
    pub stages: BTreeMap<u32, u64>,
}

impl SuiteStart {
    /// Suite key: the path, or the name when the producer sent no path.
    pub fn suite_key(&self) -> Option<&str> {
        non_empty(self.path.as_deref()).or_else(|| non_empty(self.name.as_deref()))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStart {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Stage", default)]
    pub stage: u32,
    #[serde(default)]
    pub path: Option<String>,
}

/// Result of one test (`test` event).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "DurationMs", default)]
    pub duration_ms: Option<u64>,
    #[serde(rename = "Stage", default)]
    pub stage: u32,
    #[serde(rename = "Messages", default)]
    pub messages: Option<Vec<String>>,
    #[serde(rename = "Tags", default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub path: Option<String>,
}

/// Per-test entry of a `suiteEnd` payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteEndTest {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(alias = "Status", default)]
    pub status: String,
    #[serde(rename = "durationMs", alias = "DurationMs", default)]
    pub duration_ms: Option<u64>,
    #[serde(alias = "Messages", default)]
    pub messages: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteEnd {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub summary: SuiteSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<SuiteEndTest>>,
}

impl SuiteEnd {
    pub fn suite_key(&self) -> Option<&str> {
        non_empty(self.path.as_deref()).or_else(|| non_empty(self.name.as_deref()))
    }
}

/// Where an `error` event came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// Emitted by the producer inside the stream.
    #[default]
    Producer,
    /// Synthesised by the connection after a transport failure.
    Transport,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip)]
    pub origin: ErrorOrigin,
}

impl ErrorEvent {
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            path: None,
            origin: ErrorOrigin::Transport,
        }
    }
}

/// One decoded stream message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunEvent {
    BatchStart(BatchStart),
    SuiteStart(SuiteStart),
    TestStart(TestStart),
    Test(TestResult),
    SuiteEnd(SuiteEnd),
    BatchEnd,
    Error(ErrorEvent),
    Done,
}

impl RunEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::BatchStart(_) => EventKind::BatchStart,
            Self::SuiteStart(_) => EventKind::SuiteStart,
            Self::TestStart(_) => EventKind::TestStart,
            Self::Test(_) => EventKind::Test,
            Self::SuiteEnd(_) => EventKind::SuiteEnd,
            Self::BatchEnd => EventKind::BatchEnd,
            Self::Error(_) => EventKind::Error,
            Self::Done => EventKind::Done,
        }
    }
}

/// Wire tag of a [`RunEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    BatchStart,
    SuiteStart,
    TestStart,
    Test,
    SuiteEnd,
    BatchEnd,
    Error,
    Done,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BatchStart => "batchStart",
            Self::SuiteStart => "suiteStart",
            Self::TestStart => "testStart",
            Self::Test => "test",
            Self::SuiteEnd => "suiteEnd",
            Self::BatchEnd => "batchEnd",
            Self::Error => "error",
            Self::Done => "done",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "batchStart" => Self::BatchStart,
            "suiteStart" => Self::SuiteStart,
            "testStart" => Self::TestStart,
            "test" => Self::Test,
            "suiteEnd" => Self::SuiteEnd,
            "batchEnd" => Self::BatchEnd,
            "error" => Self::Error,
            "done" => Self::Done,
            _ => return None,
        })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Decodes one message body. A missing or `null` payload reads as `{}`.
pub fn decode_envelope(text: &str) -> Result<RunEvent, ProtocolError> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(ProtocolError::Json)?;
    let tag = raw
        .kind
        .filter(|k| !k.is_empty())
        .ok_or(ProtocolError::MissingType)?;
    let kind = EventKind::parse(&tag).ok_or(ProtocolError::UnknownType(tag))?;
    let payload = if raw.payload.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        raw.payload
    };

    Ok(match kind {
        EventKind::BatchStart => RunEvent::BatchStart(decode_payload(kind, payload)?),
        EventKind::SuiteStart => RunEvent::SuiteStart(decode_payload(kind, payload)?),
        EventKind::TestStart => RunEvent::TestStart(decode_payload(kind, payload)?),
        EventKind::Test => RunEvent::Test(decode_payload(kind, payload)?),
        EventKind::SuiteEnd => RunEvent::SuiteEnd(decode_payload(kind, payload)?),
        EventKind::BatchEnd => RunEvent::BatchEnd,
        EventKind::Error => RunEvent::Error(decode_payload(kind, payload)?),
        EventKind::Done => RunEvent::Done,
    })
}

/// Encodes an event as a `{type, payload}` envelope (producer side and fixtures).
pub fn encode_envelope(event: &RunEvent) -> Result<String, serde_json::Error> {
    let payload = match event {
        RunEvent::BatchStart(p) => serde_json::to_value(p)?,
        RunEvent::SuiteStart(p) => serde_json::to_value(p)?,
        RunEvent::TestStart(p) => serde_json::to_value(p)?,
        RunEvent::Test(p) => serde_json::to_value(p)?,
        RunEvent::SuiteEnd(p) => serde_json::to_value(p)?,
        RunEvent::Error(p) => serde_json::to_value(p)?,
        RunEvent::BatchEnd | RunEvent::Done => serde_json::json!({}),
    };
    serde_json::to_string(&serde_json::json!({
        "type": event.kind().as_str(),
        "payload": payload,
    }))
}

fn decode_payload<T: DeserializeOwned>(
    kind: EventKind,
    value: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.as_str(),
        source,
    })
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
