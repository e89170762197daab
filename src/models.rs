//
// models.rs
// Dicom-Sort-rs
//
// Serializable run reports: the sort summary and the in-place batch summary.
//

use serde::{Deserialize, Serialize};

/// Aggregate counts of one sort run. Every enumerated file lands in exactly one counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Files never processed because the run was cancelled.
    pub cancelled: usize,
    /// Distinct identifiers pseudonymized without a correlation entry.
    pub unmapped_ids: usize,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

/// Counts of an in-place batch operation (decompress / explicit rewrite).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub rewritten: usize,
    pub skipped: usize,
    pub failed: usize,
}
