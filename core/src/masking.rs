//! Field masking for human-identifiable payloads.
//!
//! Fields are selected by name at any depth of a JSON document:
//!
//! - **mark**: the whole value is replaced by [`MASK_TOKEN`].
//! - **highlight**: the value is partially masked. Email addresses keep the
//!   first three characters of the local part and the whole domain; any other
//!   string keeps its first two characters.
//!
//! A call-site [`MaskingConfig`] is always merged with the built-in lists, so
//! `password`, `access_token` and `refresh_token` can never be logged in clear.

use crate::payload::Payload;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Replacement for fully masked fields.
pub const MASK_TOKEN: &str = "******";

/// Character used for partial masks.
const MASK_CHAR: char = '*';

/// Fields always fully masked.
pub const DEFAULT_MARK_FIELDS: [&str; 3] = ["password", "access_token", "refresh_token"];

/// Fields always partially masked.
pub const DEFAULT_HIGHLIGHT_FIELDS: [&str; 2] = ["email", "phone"];

static EMAIL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,4}$").ok());

/// Call-site masking lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingConfig {
    /// Field names replaced entirely by [`MASK_TOKEN`].
    pub mark: Vec<String>,
    /// Field names partially masked.
    pub highlight: Vec<String>,
}

impl MaskingConfig {
    /// Create a config from explicit lists.
    #[must_use]
    pub fn new<I, J, S, T>(mark: I, highlight: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            mark: mark.into_iter().map(Into::into).collect(),
            highlight: highlight.into_iter().map(Into::into).collect(),
        }
    }
}

/// Applies a merged masking configuration to payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Masker {
    mark: BTreeSet<String>,
    highlight: BTreeSet<String>,
}

impl Default for Masker {
    fn default() -> Self {
        Self::new(&MaskingConfig::default())
    }
}

impl Masker {
    /// Build a masker from the built-in lists unioned with `config`.
    #[must_use]
    pub fn new(config: &MaskingConfig) -> Self {
        let mark = DEFAULT_MARK_FIELDS
            .iter()
            .map(|f| (*f).to_string())
            .chain(config.mark.iter().cloned())
            .collect();
        let highlight = DEFAULT_HIGHLIGHT_FIELDS
            .iter()
            .map(|f| (*f).to_string())
            .chain(config.highlight.iter().cloned())
            .collect();
        Self { mark, highlight }
    }

    /// Whether `field` is fully masked.
    #[must_use]
    pub fn is_marked(&self, field: &str) -> bool {
        self.mark.contains(field)
    }

    /// Whether `field` is partially masked.
    #[must_use]
    pub fn is_highlighted(&self, field: &str) -> bool {
        self.highlight.contains(field)
    }

    /// Mask a JSON document, returning a new value.
    #[must_use]
    pub fn mask_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, v)| (key.clone(), self.mask_field(key, v)))
                    .collect::<Map<String, Value>>(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.mask_value(v)).collect()),
            other => other.clone(),
        }
    }

    fn mask_field(&self, key: &str, value: &Value) -> Value {
        if self.is_marked(key) {
            return Value::String(MASK_TOKEN.to_string());
        }
        if self.is_highlighted(key) {
            if let Value::String(text) = value {
                return Value::String(partial_mask(text));
            }
        }
        self.mask_value(value)
    }

    /// Mask a payload.
    ///
    /// Raw bytes holding a JSON document are masked and re-serialized; other
    /// raw bytes and error details pass through unchanged.
    #[must_use]
    pub fn mask_payload(&self, payload: Payload) -> Payload {
        match payload {
            Payload::Structured(value) => Payload::Structured(self.mask_value(&value)),
            Payload::RawBytes(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value @ (Value::Object(_) | Value::Array(_))) => {
                    let masked = self.mask_value(&value);
                    serde_json::to_vec(&masked).map_or(Payload::RawBytes(bytes), Payload::RawBytes)
                },
                _ => Payload::RawBytes(bytes),
            },
            other @ (Payload::Empty | Payload::Error(_)) => other,
        }
    }
}

/// Partially mask a string value.
#[must_use]
pub fn partial_mask(value: &str) -> String {
    let is_email = EMAIL.as_ref().is_some_and(|re| re.is_match(value));
    if is_email {
        if let Some((local, domain)) = value.split_once('@') {
            let keep = if local.chars().count() > 2 { 3 } else { 1 };
            return format!("{}@{domain}", mask_after(local, keep));
        }
    }
    if value.chars().count() > 2 {
        mask_after(value, 2)
    } else {
        value.to_string()
    }
}

fn mask_after(value: &str, keep: usize) -> String {
    value
        .chars()
        .enumerate()
        .map(|(i, c)| if i < keep { c } else { MASK_CHAR })
        .collect()
}
