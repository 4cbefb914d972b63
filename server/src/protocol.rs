//! # WebSocket Protocol Messages
//!
//! Defines the frames exchanged between interview participants and the relay.
//! Every frame is a JSON object with a `"type"` tag and a `"payload"` body:
//!
//! ```json
//! { "type": "code_update", "payload": { "code": "x = 1" } }
//! ```
//!
//! Older clients send "flat" frames where the payload fields sit next to the
//! tag (`{"type": "code_update", "code": "x = 1"}`). Those are accepted on the
//! way in; the relay always forwards the canonical shape.

use crate::error::RelayError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The closed set of message tags the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Full editor contents after a change. Enriched with the sender's `userId`.
    CodeUpdate,
    /// Interviewer notes after a change. Enriched with the sender's `userId`.
    NotesUpdate,
    /// Results of a (simulated) test run, forwarded as-is.
    TestResultsUpdate,
    /// AI analysis of the current code, forwarded as-is.
    AiInsightsUpdate,
    /// Proctoring capture. Persisted to disk, never fanned out.
    Screenshot,
    /// Sent by clients right after connecting. Acknowledged, no side effect.
    JoinInterview,
}

impl MessageKind {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "code_update" => Some(Self::CodeUpdate),
            "notes_update" => Some(Self::NotesUpdate),
            "test_results_update" => Some(Self::TestResultsUpdate),
            "ai_insights_update" => Some(Self::AiInsightsUpdate),
            "screenshot" => Some(Self::Screenshot),
            "join_interview" => Some(Self::JoinInterview),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CodeUpdate => "code_update",
            Self::NotesUpdate => "notes_update",
            Self::TestResultsUpdate => "test_results_update",
            Self::AiInsightsUpdate => "ai_insights_update",
            Self::Screenshot => "screenshot",
            Self::JoinInterview => "join_interview",
        }
    }

    /// Whether the relay stamps the sender's `userId` into the payload
    /// before forwarding.
    pub fn is_enriched(self) -> bool {
        matches!(self, Self::CodeUpdate | Self::NotesUpdate)
    }
}

// ─── Inbound ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

/// A decoded inbound frame. The tag is kept as a string so that unknown
/// types can be reported by name instead of failing to parse.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    /// Decodes a text frame, accepting both the canonical and the flat shape.
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| RelayError::MalformedMessage(e.to_string()))?;

        let payload = match raw.payload {
            Some(payload) => payload,
            None => Value::Object(raw.rest),
        };

        Ok(Self {
            kind: raw.kind,
            payload,
        })
    }
}

// ─── Outbound ───────────────────────────────────────────────────

/// A frame forwarded by the relay to the other participants of a room.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Value,
}

impl RelayMessage {
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Self { kind, payload }
    }
}

/// Merges the sender's identity into a payload. A client-supplied `userId`
/// is overwritten; non-object payloads are wrapped under `value`.
pub fn with_sender(payload: Value, user_id: &str) -> Value {
    let mut object = match payload {
        Value::Object(object) => object,
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("value".to_string(), other);
            wrapped
        }
    };
    object.insert("userId".to_string(), Value::String(user_id.to_string()));
    Value::Object(object)
}

// ─── Screenshot payload ─────────────────────────────────────────

/// Image bytes as sent by the browser: either the numeric byte array
/// produced by `Array.from(new Uint8Array(..))` or a base64 string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImageData {
    Bytes(Vec<u8>),
    Base64(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawScreenshot {
    #[serde(default)]
    interview_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
    data: ImageData,
}

/// Body of a `screenshot` frame after the image has been reconstructed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenshotPayload {
    pub interview_id: Option<String>,
    pub user_id: Option<String>,
    pub timestamp: Option<String>,
    pub data: Vec<u8>,
}

impl ScreenshotPayload {
    pub fn decode(payload: Value) -> Result<Self, RelayError> {
        let raw: RawScreenshot = serde_json::from_value(payload)
            .map_err(|e| RelayError::MalformedMessage(format!("screenshot payload: {e}")))?;

        let data = match raw.data {
            ImageData::Bytes(bytes) => bytes,
            ImageData::Base64(encoded) => BASE64
                .decode(encoded.as_bytes())
                .map_err(|e| RelayError::MalformedMessage(format!("screenshot data: {e}")))?,
        };

        // Browsers send either an ISO string or `Date.now()` millis.
        let timestamp = match raw.timestamp {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Ok(Self {
            interview_id: non_blank(raw.interview_id),
            user_id: non_blank(raw.user_id),
            timestamp,
            data,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
