//! Payloads carried by detail log events.
//!
//! Every value that crosses a log, database, broker, or HTTP boundary is one
//! of a small set of shapes. Keeping them in a closed enum lets serialization
//! and masking match exhaustively.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description of a failed call, as recorded in a detail event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Optional result/error code (e.g. `"500"`, `"timeout"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable error text.
    pub error: String,
}

impl ErrorDetail {
    /// Create an error detail from any displayable error.
    #[must_use]
    pub fn new(error: impl std::fmt::Display) -> Self {
        Self {
            code: None,
            error: error.to_string(),
        }
    }

    /// Attach a result code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// A payload recorded in a detail event.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    /// Nothing to record.
    #[default]
    Empty,
    /// Verbatim wire bytes (message value, HTTP body, SQL text).
    RawBytes(Vec<u8>),
    /// A structured JSON document.
    Structured(Value),
    /// A failed call.
    Error(ErrorDetail),
}

impl Payload {
    /// Build a structured payload from any serializable value.
    ///
    /// Values that fail to serialize are recorded as an [`ErrorDetail`]
    /// rather than dropped.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Self::Structured(value),
            Err(e) => Self::Error(ErrorDetail::new(format!("unserializable payload: {e}"))),
        }
    }

    /// Build a raw payload from text.
    #[must_use]
    pub fn raw(text: impl Into<String>) -> Self {
        Self::RawBytes(text.into().into_bytes())
    }

    /// Whether this payload carries nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Render the payload as the JSON value written into a log record.
    ///
    /// Raw bytes are written as text (lossy for non-UTF-8 input).
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Empty => Value::Null,
            Self::RawBytes(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
            Self::Structured(value) => value.clone(),
            Self::Error(detail) => serde_json::to_value(detail)
                .unwrap_or_else(|_| Value::String(detail.error.clone())),
        }
    }

    /// Parse raw bytes as JSON when possible, leaving other variants untouched.
    #[must_use]
    pub fn parsed(self) -> Self {
        match self {
            Self::RawBytes(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => Self::Structured(value),
                Err(_) => Self::RawBytes(bytes),
            },
            other => other,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Structured(value)
    }
}

impl From<ErrorDetail> for Payload {
    fn from(detail: ErrorDetail) -> Self {
        Self::Error(detail)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::raw(text)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::raw(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::RawBytes(bytes)
    }
}
