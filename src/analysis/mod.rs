//! Statistical core: aggregation, baselines, trends, and rule tables.

pub mod aggregator;
pub mod rules;
pub mod stats;
pub mod trend;

pub use aggregator::{Aggregation, Aggregator, Bucket, BusinessHours, MetricRecord};
pub use stats::{Baseline, BaselineArena, BaselineRecord, RunningStats};
pub use trend::{ChangeConvention, TrendRecord};
