use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8765;

/// Column order of the persisted log.
pub const CSV_HEADER: [&str; 11] = [
    "timestamp",
    "participant",
    "cardId",
    "question",
    "difficulty",
    "correct_answer",
    "correct_side",
    "participants_side_choice",
    "Robot",
    "gazeDecision",
    "move_duration",
];

/// Record keys that must all be present before a card record is written out.
pub const REQUIRED_FIELDS: [&str; 8] = [
    "cardId",
    "side",
    "answer",
    "question",
    "difficulty",
    "side_choice_raw",
    "Robot",
    "gazeDecision",
];

pub const STATUS_LOGGED: &str = "combined record logged";
pub const STATUS_REVEAL_FORWARDED: &str = "cardReveal processed, stored, and forwarded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CardReveal,
    CardDropped,
    RobotsMove,
    Other,
}

impl EventKind {
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("cardReveal") => EventKind::CardReveal,
            Some("cardDropped") => EventKind::CardDropped,
            Some("RobotsMove") => EventKind::RobotsMove,
            _ => EventKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CardReveal => "cardReveal",
            EventKind::CardDropped => "cardDropped",
            EventKind::RobotsMove => "RobotsMove",
            EventKind::Other => "other",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// One decoded inbound event. Fields are kept untyped; only `event`,
/// `cardId` and `participant` have meaning to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    fields: Map<String, Value>,
}

impl EventMessage {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(ParseError::NotAnObject(json_type_name(&other))),
        }
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.fields.get("event").and_then(Value::as_str)
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_name(self.event_name())
    }

    /// Correlation key of the event. Empty strings, `null`, `false` and
    /// zero count as missing; non-zero numbers are used in their text form.
    pub fn card_id(&self) -> Option<String> {
        match self.fields.get("cardId")? {
            Value::String(id) if !id.is_empty() => Some(id.clone()),
            Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
            Value::Bool(true) => Some("true".to_string()),
            _ => None,
        }
    }

    pub fn participant(&self) -> Option<&str> {
        self.fields
            .get("participant")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Status message sent back to the client that produced an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusReply {
    pub fn ok(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.into()),
        }
    }

    pub fn logged() -> Self {
        Self::ok(STATUS_LOGGED)
    }

    pub fn reveal_forwarded() -> Self {
        Self::ok(STATUS_REVEAL_FORWARDED)
    }

    pub fn waiting(kind: EventKind) -> Self {
        Self::ok(format!("{} stored; waiting for additional info", kind))
    }

    pub fn missing_card_id(kind: EventKind) -> Self {
        Self::error(format!("{} missing cardId", kind))
    }

    pub fn server_full() -> Self {
        Self::error("server full")
    }

    pub fn is_error(&self) -> bool {
        self.status == "error"
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
