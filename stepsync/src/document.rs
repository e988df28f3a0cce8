//! Canonical document snapshot, step records and the step-application seam.
//!
//! The engine never interprets document content or step payloads. Both are
//! opaque JSON values; the only thing that gives them meaning is the
//! [`DocumentModel`] injected at construction time.
//!
//! ```text
//!   seed ──apply(step 1)──► v1 ──apply(step 2)──► v2 ── … ──► vN
//!                           │                     │
//!                    StepRecord{version: 1}  StepRecord{version: 2}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The authoritative `{version, content}` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Number of steps applied to the seed to reach `content`
    pub version: u64,
    /// Opaque structured content
    pub content: Value,
}

impl Document {
    /// The version-0 document built from seed content.
    pub fn seed(content: Value) -> Self {
        Self { version: 0, content }
    }
}

/// One applied step, keyed by the version it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Value,
    pub version: u64,
    /// Identifier of the session that submitted the step
    #[serde(rename = "clientID")]
    pub client_id: String,
}

impl StepRecord {
    pub fn new(step: Value, version: u64, client_id: impl Into<String>) -> Self {
        Self {
            step,
            version,
            client_id: client_id.into(),
        }
    }
}

/// A step the document model refused to apply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("step rejected: {reason}")]
pub struct StepRejected {
    pub reason: String,
}

impl StepRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Deterministic step-application primitive.
///
/// Implementations must be pure: the same `(content, step)` pair always
/// yields the same result. The engine calls `apply` inside its critical
/// section, so it should not block on I/O.
pub trait DocumentModel: Send + Sync + 'static {
    /// Content of the version-0 document.
    fn seed(&self) -> Value;

    /// Apply one step to `content`, producing the next content.
    fn apply(&self, content: &Value, step: &Value) -> Result<Value, StepRejected>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seed_document_is_version_zero() {
        let doc = Document::seed(json!({"type": "doc"}));
        assert_eq!(doc.version, 0);
        assert_eq!(doc.content, json!({"type": "doc"}));
    }

    #[test]
    fn test_step_record_wire_field_names() {
        let record = StepRecord::new(json!({"stepType": "insert"}), 3, "A");
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["clientID"], "A");
        assert_eq!(value["version"], 3);
        assert!(value.get("client_id").is_none());

        let back: StepRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_step_rejected_display() {
        let err = StepRejected::new("position out of range");
        assert_eq!(err.to_string(), "step rejected: position out of range");
    }
}
