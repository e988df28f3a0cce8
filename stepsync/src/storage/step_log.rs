//! Retention-bounded history of applied steps.
//!
//! ```text
//!  oldest                                   latest
//!    │                                         │
//!    ▼                                         ▼
//!  [ v=k | v=k+1 | v=k+2 | … | v=k+N-1 ]  ◄── append
//!    ▲
//!    └── evicted first once len > N
//! ```
//!
//! Versions are contiguous and ascending, so `get_since` is an index
//! computation rather than a scan.

use std::collections::VecDeque;

use super::StoreError;
use crate::document::StepRecord;

/// Default retention bound.
pub const DEFAULT_MAX_STORED_STEPS: usize = 1000;

#[derive(Debug, Clone)]
pub struct StepLog {
    records: VecDeque<StepRecord>,
    retention: usize,
}

impl StepLog {
    /// Create an empty log keeping at most `retention` records (minimum 1).
    pub fn new(retention: usize) -> Self {
        let retention = retention.max(1);
        Self {
            records: VecDeque::with_capacity(retention.min(4096)),
            retention,
        }
    }

    /// Rebuild a log from recovered records, re-applying retention.
    pub fn from_records(retention: usize, records: Vec<StepRecord>) -> Result<Self, StoreError> {
        let mut log = Self::new(retention);
        log.append(records)?;
        Ok(log)
    }

    /// Check that `records` would extend this log contiguously.
    pub fn check_append(&self, records: &[StepRecord]) -> Result<(), StoreError> {
        let mut expected = self.latest_version().map(|v| v + 1);
        for record in records {
            if let Some(exp) = expected {
                if record.version != exp {
                    return Err(StoreError::NonContiguous {
                        expected: exp,
                        found: record.version,
                    });
                }
            }
            expected = Some(record.version + 1);
        }
        Ok(())
    }

    /// Append records, then evict the oldest until at most N remain.
    ///
    /// Returns the number of evicted records. Nothing is appended if the
    /// batch is not contiguous.
    pub fn append(&mut self, records: Vec<StepRecord>) -> Result<usize, StoreError> {
        self.check_append(&records)?;
        self.records.extend(records);

        let mut evicted = 0;
        while self.records.len() > self.retention {
            self.records.pop_front();
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Records with version greater than `version`, ascending.
    pub fn get_since(&self, version: u64) -> Vec<StepRecord> {
        let Some(oldest) = self.oldest_version() else {
            return Vec::new();
        };
        let skip = version.saturating_add(1).saturating_sub(oldest) as usize;
        self.records.iter().skip(skip).cloned().collect()
    }

    /// True when every version after `version`, up to the latest, is
    /// still retained.
    pub fn covers(&self, version: u64) -> bool {
        match (self.oldest_version(), self.latest_version()) {
            (Some(oldest), Some(latest)) => version >= latest || oldest <= version.saturating_add(1),
            _ => true,
        }
    }

    pub fn oldest_version(&self) -> Option<u64> {
        self.records.front().map(|r| r.version)
    }

    pub fn latest_version(&self) -> Option<u64> {
        self.records.back().map(|r| r.version)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepRecord> {
        self.records.iter()
    }
}

impl Default for StepLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STORED_STEPS)
    }
}
