//! Write-ahead commit record.
//!
//! One record per committed transaction, holding everything needed to
//! redo it: the new snapshot and the appended steps.
//!
//! ```text
//! ┌──────────────┬─────────────┬───────────┬──────────────┬─────────────┬──────────┐
//! │ base_version │ new_version │ client_id │ snapshot     │ steps       │ checksum │
//! │ u64          │ u64         │ string    │ JSON bytes   │ [StoredStep]│ u32      │
//! └──────────────┴─────────────┴───────────┴──────────────┴─────────────┴──────────┘
//! ```
//!
//! The envelope is bincode; opaque payloads are stored as JSON bytes since
//! `serde_json::Value` needs a self-describing format to deserialize.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StoreError;
use crate::document::{Document, StepRecord};

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv_mix(mut hash: u32, bytes: &[u8]) -> u32 {
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// A step record in its at-rest form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredStep {
    pub version: u64,
    pub client_id: String,
    /// JSON-encoded step payload
    pub step: Vec<u8>,
}

impl StoredStep {
    pub fn from_record(record: &StepRecord) -> Result<Self, StoreError> {
        let step = serde_json::to_vec(&record.step)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            version: record.version,
            client_id: record.client_id.clone(),
            step,
        })
    }

    pub fn to_record(&self) -> Result<StepRecord, StoreError> {
        let step: Value = serde_json::from_slice(&self.step)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(StepRecord::new(step, self.version, self.client_id.clone()))
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (step, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(step)
    }
}

/// The single atomic unit of a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub base_version: u64,
    pub new_version: u64,
    pub client_id: String,
    /// JSON-encoded document content at `new_version`
    pub snapshot: Vec<u8>,
    pub steps: Vec<StoredStep>,
    pub checksum: u32,
}

impl CommitRecord {
    /// Build a record for `steps` applied on top of `base_version`,
    /// producing `content`.
    pub fn new(
        base_version: u64,
        client_id: impl Into<String>,
        content: &Value,
        steps: &[StepRecord],
    ) -> Result<Self, StoreError> {
        let snapshot =
            serde_json::to_vec(content).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let steps = steps
            .iter()
            .map(StoredStep::from_record)
            .collect::<Result<Vec<_>, _>>()?;

        let mut record = Self {
            base_version,
            new_version: base_version + steps.len() as u64,
            client_id: client_id.into(),
            snapshot,
            steps,
            checksum: 0,
        };
        record.checksum = record.compute_checksum();
        Ok(record)
    }

    /// FNV-1a over every field except the checksum itself.
    fn compute_checksum(&self) -> u32 {
        let mut hash = FNV_OFFSET;
        hash = fnv_mix(hash, &self.base_version.to_le_bytes());
        hash = fnv_mix(hash, &self.new_version.to_le_bytes());
        hash = fnv_mix(hash, self.client_id.as_bytes());
        hash = fnv_mix(hash, &self.snapshot);
        for step in &self.steps {
            hash = fnv_mix(hash, &step.version.to_le_bytes());
            hash = fnv_mix(hash, step.client_id.as_bytes());
            hash = fnv_mix(hash, &step.step);
        }
        hash
    }

    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Decode and verify.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        if !record.verify() {
            return Err(StoreError::ChecksumMismatch {
                version: record.new_version,
            });
        }
        Ok(record)
    }

    /// The snapshot this record commits.
    pub fn document(&self) -> Result<Document, StoreError> {
        let content: Value = serde_json::from_slice(&self.snapshot)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(Document {
            version: self.new_version,
            content,
        })
    }

    /// The step records this record appends.
    pub fn step_records(&self) -> Result<Vec<StepRecord>, StoreError> {
        self.steps.iter().map(StoredStep::to_record).collect()
    }
}
