//! Text extraction from completed Gen-API task payloads.
//!
//! The backend has moved the answer between several fields across revisions
//! (`result`, `response`, `output`), and each of them may hold either a plain
//! string or a chat-style message array. Every location is decoded once into a
//! [`ContentShape`], and [`extract`] applies the fixed lookup order to the
//! decoded shapes.

use serde_json::Value;
use std::fmt;

const PRIMARY_FIELD: &str = "result";
const SECONDARY_FIELD: &str = "response";
const TERTIARY_FIELD: &str = "output";

/// Decoded form of a single content location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContentShape<'a> {
    /// A non-empty string.
    PlainString(&'a str),
    /// A non-empty array whose first record carries `message.content`.
    MessageArray(&'a Value),
    Unrecognized,
}

impl<'a> ContentShape<'a> {
    /// Decode the value found at a content location.
    ///
    /// For `MessageArray` the wrapped value is the `content` of the first
    /// record, not the array itself.
    pub fn decode(value: Option<&'a Value>) -> Self {
        match value {
            Some(Value::String(text)) if !text.trim().is_empty() => Self::PlainString(text),
            Some(Value::Array(records)) => records
                .first()
                .and_then(|record| record.get("message"))
                .and_then(|message| message.get("content"))
                .map(Self::MessageArray)
                .unwrap_or(Self::Unrecognized),
            _ => Self::Unrecognized,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseFailureReason {
    /// No content location matched any known shape.
    UnrecognizedSchema,
    /// `message.content` was neither a string nor a list of text fragments.
    UnsupportedContent { location: &'static str },
    /// The extracted text was empty.
    EmptyContent { location: &'static str },
}

impl fmt::Display for ParseFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnrecognizedSchema => write!(f, "unrecognized schema"),
            Self::UnsupportedContent { location } => {
                write!(f, "unsupported content shape in '{}'", location)
            }
            Self::EmptyContent { location } => write!(f, "empty content in '{}'", location),
        }
    }
}

/// Structured parse failure; keeps the full payload for diagnostics.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}")]
pub struct ParseFailure {
    pub reason: ParseFailureReason,
    pub snapshot: Value,
}

impl ParseFailure {
    fn new(reason: ParseFailureReason, envelope: &Value) -> Self {
        Self {
            reason,
            snapshot: envelope.clone(),
        }
    }
}

/// Extract the answer text from a successful task payload.
///
/// Lookup order, first match wins:
/// 1. `result` message array
/// 2. `response` message array
/// 3. `output` plain string
/// 4. `output` message array
pub fn extract(envelope: &Value) -> Result<String, ParseFailure> {
    let primary = ContentShape::decode(envelope.get(PRIMARY_FIELD));
    let secondary = ContentShape::decode(envelope.get(SECONDARY_FIELD));
    let tertiary = ContentShape::decode(envelope.get(TERTIARY_FIELD));

    let (location, content) = match (primary, secondary, tertiary) {
        (ContentShape::MessageArray(content), _, _) => (PRIMARY_FIELD, content),
        (_, ContentShape::MessageArray(content), _) => (SECONDARY_FIELD, content),
        (_, _, ContentShape::PlainString(text)) => return Ok(text.to_string()),
        (_, _, ContentShape::MessageArray(content)) => (TERTIARY_FIELD, content),
        _ => {
            return Err(ParseFailure::new(
                ParseFailureReason::UnrecognizedSchema,
                envelope,
            ))
        }
    };

    normalize_content(content, location).map_err(|reason| ParseFailure::new(reason, envelope))
}

/// Flatten `message.content` into text.
///
/// Strings pass through unchanged. Fragment lists are joined with newlines
/// and trailing whitespace is trimmed.
fn normalize_content(content: &Value, location: &'static str) -> Result<String, ParseFailureReason> {
    let text = match content {
        Value::String(text) => text.clone(),
        Value::Array(fragments) => {
            let mut parts = Vec::with_capacity(fragments.len());
            for fragment in fragments {
                match fragment.get("text").and_then(Value::as_str) {
                    Some(text) => parts.push(text),
                    None => return Err(ParseFailureReason::UnsupportedContent { location }),
                }
            }
            parts.join("\n").trim_end().to_string()
        }
        _ => return Err(ParseFailureReason::UnsupportedContent { location }),
    };

    if text.trim().is_empty() {
        return Err(ParseFailureReason::EmptyContent { location });
    }
    Ok(text)
}
