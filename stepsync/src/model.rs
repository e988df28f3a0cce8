//! Reference plain-text document model.
//!
//! Content is `{"type": "doc", "text": String}`. Two step kinds exist:
//!
//! | stepType | fields            | effect                          |
//! |----------|-------------------|---------------------------------|
//! | `insert` | `pos`, `text`     | insert `text` before char `pos` |
//! | `delete` | `from`, `to`      | remove chars `from..to`         |
//!
//! Positions are char indices. Used by tests, benches and demos; real
//! deployments inject their own [`DocumentModel`].

use serde_json::{json, Value};

use crate::document::{DocumentModel, StepRejected};

/// Seed text for a fresh document.
pub const DEFAULT_SEED_TEXT: &str = "Let's start collaborating. Yeah!";

#[derive(Debug, Clone)]
pub struct TextModel {
    seed_text: String,
}

impl TextModel {
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED_TEXT)
    }

    pub fn with_seed(seed_text: impl Into<String>) -> Self {
        Self {
            seed_text: seed_text.into(),
        }
    }

    /// Build document content holding `text`.
    pub fn content(text: &str) -> Value {
        json!({ "type": "doc", "text": text })
    }

    /// Extract the text of a content value.
    pub fn text_of(content: &Value) -> Option<&str> {
        content.get("text").and_then(Value::as_str)
    }

    /// Build an insert step.
    pub fn insert(pos: usize, text: &str) -> Value {
        json!({ "stepType": "insert", "pos": pos, "text": text })
    }

    /// Build a delete step.
    pub fn delete(from: usize, to: usize) -> Value {
        json!({ "stepType": "delete", "from": from, "to": to })
    }
}

impl Default for TextModel {
    fn default() -> Self {
        Self::new()
    }
}

fn position(step: &Value, field: &str) -> Result<usize, StepRejected> {
    step.get(field)
        .and_then(Value::as_u64)
        .map(|p| p as usize)
        .ok_or_else(|| StepRejected::new(format!("missing or invalid `{field}`")))
}

/// Byte offset of char index `pos` (end of string when `pos == len`).
fn byte_offset(text: &str, pos: usize) -> usize {
    text.char_indices()
        .nth(pos)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

impl DocumentModel for TextModel {
    fn seed(&self) -> Value {
        Self::content(&self.seed_text)
    }

    fn apply(&self, content: &Value, step: &Value) -> Result<Value, StepRejected> {
        let text = Self::text_of(content)
            .ok_or_else(|| StepRejected::new("content is not a text document"))?;
        let len = text.chars().count();

        let kind = step
            .get("stepType")
            .and_then(Value::as_str)
            .ok_or_else(|| StepRejected::new("missing `stepType`"))?;

        match kind {
            "insert" => {
                let pos = position(step, "pos")?;
                let inserted = step
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StepRejected::new("missing or invalid `text`"))?;
                if pos > len {
                    return Err(StepRejected::new(format!(
                        "insert position {pos} beyond document length {len}"
                    )));
                }
                let at = byte_offset(text, pos);
                let mut out = String::with_capacity(text.len() + inserted.len());
                out.push_str(&text[..at]);
                out.push_str(inserted);
                out.push_str(&text[at..]);
                Ok(Self::content(&out))
            }
            "delete" => {
                let from = position(step, "from")?;
                let to = position(step, "to")?;
                if from > to || to > len {
                    return Err(StepRejected::new(format!(
                        "delete range {from}..{to} invalid for document length {len}"
                    )));
                }
                let start = byte_offset(text, from);
                let end = byte_offset(text, to);
                let mut out = String::with_capacity(text.len() - (end - start));
                out.push_str(&text[..start]);
                out.push_str(&text[end..]);
                Ok(Self::content(&out))
            }
            other => Err(StepRejected::new(format!("unknown stepType `{other}`"))),
        }
    }
}
