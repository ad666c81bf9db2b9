//! Error classes shared across the pipeline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An explicit zero-guard that fired while deriving a record.
///
/// Guards are not failures: the affected score or share is defined as `0`
/// and the guard is carried on the record so reports can tell a real zero
/// from a guarded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    /// Standard deviation or moving average was zero.
    DegenerateBaseline,
    /// The bucket's weight sum was zero; nothing was allocated.
    ZeroDenominatorAttribution,
}

impl Guard {
    pub fn as_str(self) -> &'static str {
        match self {
            Guard::DegenerateBaseline => "degenerate_baseline",
            Guard::ZeroDenominatorAttribution => "zero_denominator_attribution",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bucket {bucket} failed for {} entit(ies): {}", failures.len(), failures.join("; "))]
    PartialBucketFailure {
        bucket: NaiveDate,
        failures: Vec<String>,
    },

    #[error("bucket {bucket} skipped: depends on failed bucket {failed}")]
    UpstreamBucketFailed { bucket: NaiveDate, failed: NaiveDate },

    #[error("invalid bucket range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
}
