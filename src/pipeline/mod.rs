//! Bucket-range recompute: aggregate, baseline, trend, score, attribute, and
//! commit every materialization one day at a time.

pub mod runner;
pub mod views;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::analysis::trend::TrendRecord;
use crate::analysis::BusinessHours;
use crate::config::{Config, CostConfig};
use crate::detect::anomaly::AnomalyRecord;
use crate::error::{Guard, PipelineError};
use crate::metrics::Metric;
use crate::scheduler::history::RunStatus;

pub use runner::Pipeline;

/// Metric whose lag drives the write-activity growth column.
pub const WRITE_TREND_METRIC: Metric = Metric::RowsInserted;
/// Metric whose trend drives the consumption credit columns.
pub const CONSUMPTION_TREND_METRIC: Metric = Metric::TotalCredits;
/// Metric whose behavior classification sets the risk of hourly patterns.
pub const PATTERN_METRIC: Metric = Metric::QueryCount;
/// Quantile reported as the baseline percentile.
pub const BASELINE_QUANTILE: f64 = 0.95;

/// An inclusive range of day buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BucketRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, PipelineError> {
        if start > end {
            return Err(PipelineError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    /// The `days` closed days ending the day before `today`.
    pub fn trailing(today: NaiveDate, days: u32) -> Self {
        let end = today - Duration::days(1);
        let start = end - Duration::days(i64::from(days.max(1)) - 1);
        Self { start, end }
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

/// Knobs the recompute reads from the configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub profile_metrics: Vec<Metric>,
    pub business_hours: BusinessHours,
    pub workers: usize,
    pub cost: CostConfig,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            profile_metrics: config.analysis.profile_metrics.clone(),
            business_hours: config.analysis.business_hours,
            workers: config.analysis.workers.max(1),
            cost: config.cost.clone(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Trend, and for baselined groupings the score, of one entity-day-metric.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDay {
    pub trend: TrendRecord,
    pub anomaly: Option<AnomalyRecord>,
}

/// Outcome of one bucket of a run.
#[derive(Debug, Clone, Serialize)]
pub struct BucketReport {
    pub bucket: NaiveDate,
    pub status: RunStatus,
    pub rows_written: usize,
    /// Events left out of some grouping for a missing required dimension.
    pub excluded_events: usize,
    pub degenerate_baselines: usize,
    pub zero_denominator_attributions: usize,
    pub error: Option<String>,
}

impl BucketReport {
    fn new(bucket: NaiveDate, status: RunStatus) -> Self {
        Self {
            bucket,
            status,
            rows_written: 0,
            excluded_events: 0,
            degenerate_baselines: 0,
            zero_denominator_attributions: 0,
            error: None,
        }
    }

    fn count_guards<'a>(&mut self, guards: impl IntoIterator<Item = &'a Guard>) {
        for guard in guards {
            match guard {
                Guard::DegenerateBaseline => self.degenerate_baselines += 1,
                Guard::ZeroDenominatorAttribution => self.zero_denominator_attributions += 1,
            }
        }
    }
}

/// Result of one recompute.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub range: BucketRange,
    pub buckets: Vec<BucketReport>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.buckets.iter().all(|b| b.status == RunStatus::Success)
    }

    pub fn first_failure(&self) -> Option<&BucketReport> {
        self.buckets.iter().find(|b| b.status == RunStatus::Failed)
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.buckets.iter().filter(|b| b.status == status).count()
    }
}
