use crate::entity::EntityKey;
use crate::metrics::Metric;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq)]
pub enum BaselineError {
    #[error("out-of-order replay for {entity}/{metric}: last applied {last}, attempted {attempted}")]
    OutOfOrderReplay {
        entity: String,
        metric: Metric,
        last: NaiveDate,
        attempted: NaiveDate,
    },
}

/// Running count, mean and sum of squared deviations (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn from_parts(count: u64, mean: f64, m2: f64) -> Self {
        Self { count, mean, m2 }
    }

    /// Fold one value in O(1).
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn m2(&self) -> f64 {
        self.m2
    }

    /// Sample (Bessel-corrected) variance; 0 below two points.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            // m2 can dip a hair below zero on constant input.
            (self.m2 / (self.count - 1) as f64).max(0.0)
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Continuous (linear interpolation) percentile of already sorted values.
///
/// Fewer than two values yields 0.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n < 2 {
        return 0.0;
    }
    let h = q.clamp(0.0, 1.0) * (n - 1) as f64;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Insert into an ascending vector, keeping it sorted.
pub fn insert_sorted(sorted: &mut Vec<f64>, value: f64) {
    let idx = sorted.partition_point(|v| v.total_cmp(&value).is_lt());
    sorted.insert(idx, value);
}

/// Point-in-time baseline used for scoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub std_dev: f64,
    pub p95: f64,
    pub sample_count: u64,
}

/// Running statistics of one entity's metric over its daily history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub entity: EntityKey,
    pub metric: Metric,
    pub stats: RunningStats,
    pub last_date: Option<NaiveDate>,
}

impl BaselineRecord {
    pub fn new(entity: EntityKey, metric: Metric) -> Self {
        Self {
            entity,
            metric,
            stats: RunningStats::default(),
            last_date: None,
        }
    }

    /// Baseline with the given p95 estimate; cold start (< 2 points) reports
    /// zero spread and zero percentile.
    pub fn baseline(&self, p95: f64) -> Baseline {
        let warm = self.stats.count() >= 2;
        Baseline {
            mean: self.stats.mean(),
            std_dev: if warm { self.stats.std_dev() } else { 0.0 },
            p95: if warm { p95 } else { 0.0 },
            sample_count: self.stats.count(),
        }
    }
}

/// Baselines indexed by (entity, metric).
#[derive(Debug, Clone, Default)]
pub struct BaselineArena {
    records: HashMap<(EntityKey, Metric), BaselineRecord>,
}

impl BaselineArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a previously persisted record, replacing any existing one.
    pub fn seed(&mut self, record: BaselineRecord) {
        self.records
            .insert((record.entity.clone(), record.metric), record);
    }

    pub fn get(&self, entity: &EntityKey, metric: Metric) -> Option<&BaselineRecord> {
        // HashMap lookups need an owned tuple key.
        self.records.get(&(entity.clone(), metric))
    }

    /// Fold one day's value. Dates must strictly increase per (entity, metric);
    /// a replay is rejected and leaves the statistics untouched.
    pub fn update(
        &mut self,
        entity: &EntityKey,
        metric: Metric,
        date: NaiveDate,
        value: f64,
    ) -> Result<&BaselineRecord, BaselineError> {
        let record = self
            .records
            .entry((entity.clone(), metric))
            .or_insert_with(|| BaselineRecord::new(entity.clone(), metric));

        if let Some(last) = record.last_date {
            if date <= last {
                let err = BaselineError::OutOfOrderReplay {
                    entity: entity.to_string(),
                    metric,
                    last,
                    attempted: date,
                };
                warn!(error = %err, "baseline update rejected");
                return Err(err);
            }
        }
        record.stats.push(value);
        record.last_date = Some(date);
        Ok(record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &BaselineRecord> {
        self.records.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, day).unwrap()
    }

    fn alice() -> EntityKey {
        EntityKey {
            user: Some("ALICE".into()),
            role: Some("ANALYST".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_welford_matches_two_pass() {
        let values = [10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 50.0];
        let mut stats = RunningStats::default();
        for v in values {
            stats.push(v);
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 6.0;
        assert!((stats.mean() - mean).abs() < 1e-12);
        assert!((stats.variance() - var).abs() < 1e-9);
        assert!((stats.mean() - 15.714).abs() < 1e-3);
    }

    #[test]
    fn test_welford_is_stable_with_large_offsets() {
        // Naive sum-of-squares loses everything at this magnitude.
        let mut stats = RunningStats::default();
        for v in [1e9 + 4.0, 1e9 + 7.0, 1e9 + 13.0, 1e9 + 16.0] {
            stats.push(v);
        }
        assert!((stats.variance() - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_single_point_has_zero_spread() {
        let mut stats = RunningStats::default();
        stats.push(42.0);
        assert_eq!(stats.std_dev(), 0.0);
        assert_eq!(RunningStats::default().std_dev(), 0.0);
    }

    #[test]
    fn test_continuous_percentile() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        // h = 0.95 * 4 = 3.8 -> 4 + 0.8 * (5 - 4)
        assert!((percentile(&sorted, 0.95) - 4.8).abs() < 1e-12);
        assert_eq!(percentile(&sorted, 0.5), 3.0);
        assert_eq!(percentile(&sorted, 1.0), 5.0);
        assert_eq!(percentile(&[7.0], 0.95), 0.0);
        assert_eq!(percentile(&[], 0.95), 0.0);
    }

    #[test]
    fn test_insert_sorted() {
        let mut v = Vec::new();
        for x in [5.0, 1.0, 3.0, 3.0, 9.0] {
            insert_sorted(&mut v, x);
        }
        assert_eq!(v, vec![1.0, 3.0, 3.0, 5.0, 9.0]);
    }

    #[test]
    fn test_arena_rejects_out_of_order_replay() {
        let mut arena = BaselineArena::new();
        arena.update(&alice(), Metric::QueryCount, d(18), 10.0).unwrap();
        arena.update(&alice(), Metric::QueryCount, d(19), 20.0).unwrap();
        let before = arena.get(&alice(), Metric::QueryCount).unwrap().clone();

        let err = arena
            .update(&alice(), Metric::QueryCount, d(19), 99.0)
            .unwrap_err();
        assert!(matches!(err, BaselineError::OutOfOrderReplay { .. }));
        let err = arena
            .update(&alice(), Metric::QueryCount, d(17), 99.0)
            .unwrap_err();
        assert!(matches!(err, BaselineError::OutOfOrderReplay { .. }));

        assert_eq!(arena.get(&alice(), Metric::QueryCount).unwrap(), &before);
    }

    #[test]
    fn test_arena_keeps_entities_and_metrics_independent() {
        let mut arena = BaselineArena::new();
        let bob = EntityKey {
            user: Some("BOB".into()),
            ..Default::default()
        };
        arena.update(&alice(), Metric::QueryCount, d(18), 1.0).unwrap();
        arena.update(&alice(), Metric::ExecutionTime, d(18), 1.0).unwrap();
        arena.update(&bob, Metric::QueryCount, d(17), 1.0).unwrap();
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn test_seeded_record_continues_incrementally() {
        let mut full = BaselineArena::new();
        for (day, v) in [(18, 3.0), (19, 5.0), (20, 11.0)] {
            full.update(&alice(), Metric::QueryCount, d(day), v).unwrap();
        }

        let mut partial = BaselineArena::new();
        for (day, v) in [(18, 3.0), (19, 5.0)] {
            partial.update(&alice(), Metric::QueryCount, d(day), v).unwrap();
        }
        let snapshot = partial.get(&alice(), Metric::QueryCount).unwrap().clone();

        let mut resumed = BaselineArena::new();
        resumed.seed(snapshot);
        resumed.update(&alice(), Metric::QueryCount, d(20), 11.0).unwrap();

        assert_eq!(
            resumed.get(&alice(), Metric::QueryCount),
            full.get(&alice(), Metric::QueryCount)
        );
    }

    #[test]
    fn test_cold_start_baseline_is_zero() {
        let mut record = BaselineRecord::new(alice(), Metric::QueryCount);
        record.stats.push(12.0);
        let b = record.baseline(12.0);
        assert_eq!(b.std_dev, 0.0);
        assert_eq!(b.p95, 0.0);
        assert_eq!(b.mean, 12.0);
    }
}
