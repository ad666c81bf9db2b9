//! Proportional allocation of shared bucket totals.
//!
//! A bucket (one hour of one warehouse, or one anomalous day) carries a shared
//! total that is split across the entities active in it. Each resource pool
//! names its own weight metric, so compute credits and cloud-service credits
//! of the same bucket can follow different shares.

pub mod contribution;

use crate::analysis::aggregator::MetricRecord;
use crate::analysis::Bucket;
use crate::entity::EntityKey;
use crate::error::Guard;
use crate::metrics::Metric;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Result of splitting one total by weight.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    /// One share per weight, in input order.
    pub shares: Vec<f64>,
    /// Part of the total nobody received. Non-zero only when all weights are 0.
    pub unallocated: f64,
    pub guard: Option<Guard>,
}

/// Split `total` by `weights`: `share_i = w_i / Σw * total`.
///
/// Negative or non-finite weights count as zero. With a zero weight sum every
/// share is `0` and the whole total is reported as unallocated.
pub fn allocate(total: f64, weights: &[f64]) -> Allocation {
    let clean: Vec<f64> = weights
        .iter()
        .map(|w| if w.is_finite() && *w > 0.0 { *w } else { 0.0 })
        .collect();
    let sum: f64 = clean.iter().sum();

    if sum <= 0.0 {
        return Allocation {
            shares: vec![0.0; clean.len()],
            unallocated: total,
            guard: Some(Guard::ZeroDenominatorAttribution),
        };
    }

    Allocation {
        shares: clean.iter().map(|w| w / sum * total).collect(),
        unallocated: 0.0,
        guard: None,
    }
}

/// A shared total and the metric its shares are weighted by.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePool {
    pub name: &'static str,
    pub total: f64,
    pub weight: Metric,
}

/// One entity's shares of a bucket's pools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub bucket: Bucket,
    pub entity: EntityKey,
    /// Share per pool name.
    pub shares: BTreeMap<String, f64>,
}

impl AttributionRecord {
    pub fn share(&self, pool: &str) -> f64 {
        self.shares.get(pool).copied().unwrap_or(0.0)
    }
}

/// Attribution of every pool of one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketAttribution {
    pub records: Vec<AttributionRecord>,
    /// Unallocated remainder per pool, only for pools that hit the guard.
    pub unallocated: BTreeMap<String, f64>,
    pub guards: Vec<Guard>,
}

/// Allocate each pool across `contributors`, all of which belong to `bucket`.
pub fn attribute_bucket(
    bucket: Bucket,
    pools: &[ResourcePool],
    contributors: &[&MetricRecord],
) -> BucketAttribution {
    let mut records: Vec<AttributionRecord> = contributors
        .iter()
        .map(|r| AttributionRecord {
            bucket,
            entity: r.entity.clone(),
            shares: BTreeMap::new(),
        })
        .collect();
    let mut unallocated = BTreeMap::new();
    let mut guards = Vec::new();

    for pool in pools {
        let weights: Vec<f64> = contributors
            .iter()
            .map(|r| pool.weight.value(&r.metrics))
            .collect();
        let allocation = allocate(pool.total, &weights);
        if let Some(guard) = allocation.guard {
            debug!(
                bucket = %bucket,
                pool = pool.name,
                total = pool.total,
                guard = guard.as_str(),
                "bucket total left unallocated"
            );
            unallocated.insert(pool.name.to_string(), allocation.unallocated);
            guards.push(guard);
        }
        for (record, share) in records.iter_mut().zip(allocation.shares) {
            record.shares.insert(pool.name.to_string(), share);
        }
    }

    BucketAttribution {
        records,
        unallocated,
        guards,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::UsageMetrics;
    use chrono::NaiveDate;

    fn bucket() -> Bucket {
        Bucket::Hour(NaiveDate::from_ymd_opt(2025, 8, 18).unwrap(), 9)
    }

    fn contributor(user: &str, execution_time: f64, query_count: u64) -> MetricRecord {
        MetricRecord {
            bucket: bucket(),
            entity: EntityKey {
                user: Some(user.into()),
                warehouse: Some("WH".into()),
                ..Default::default()
            },
            metrics: UsageMetrics {
                execution_time,
                query_count,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_allocate_by_weight() {
        let a = allocate(100.0, &[30.0, 70.0]);
        assert!((a.shares[0] - 30.0).abs() < 1e-9);
        assert!((a.shares[1] - 70.0).abs() < 1e-9);
        assert_eq!(a.unallocated, 0.0);
        assert!(a.guard.is_none());
    }

    #[test]
    fn test_zero_weights_leave_total_unallocated() {
        let a = allocate(100.0, &[0.0, 0.0]);
        assert_eq!(a.shares, vec![0.0, 0.0]);
        assert_eq!(a.unallocated, 100.0);
        assert_eq!(a.guard, Some(Guard::ZeroDenominatorAttribution));

        let empty = allocate(5.0, &[]);
        assert!(empty.shares.is_empty());
        assert_eq!(empty.unallocated, 5.0);
    }

    #[test]
    fn test_conservation_with_awkward_weights() {
        let weights = [1.0 / 3.0, 2.0 / 7.0, 1e-6, 12345.678, 0.1];
        let total = 97.31;
        let a = allocate(total, &weights);
        let sum: f64 = a.shares.iter().sum();
        assert!((sum - total).abs() < 1e-9);
    }

    #[test]
    fn test_negative_weight_counts_as_zero() {
        let a = allocate(10.0, &[-5.0, 5.0, f64::NAN]);
        assert_eq!(a.shares, vec![0.0, 10.0, 0.0]);
    }

    #[test]
    fn test_pools_use_their_own_weight() {
        let u1 = contributor("U1", 30.0, 9);
        let u2 = contributor("U2", 70.0, 1);
        let pools = [
            ResourcePool { name: "compute", total: 100.0, weight: Metric::ExecutionTime },
            ResourcePool { name: "cloud_services", total: 10.0, weight: Metric::QueryCount },
        ];
        let out = attribute_bucket(bucket(), &pools, &[&u1, &u2]);

        assert!((out.records[0].share("compute") - 30.0).abs() < 1e-9);
        assert!((out.records[1].share("compute") - 70.0).abs() < 1e-9);
        assert!((out.records[0].share("cloud_services") - 9.0).abs() < 1e-9);
        assert!((out.records[1].share("cloud_services") - 1.0).abs() < 1e-9);
        assert!(out.guards.is_empty());
    }

    #[test]
    fn test_guard_is_per_pool() {
        let u1 = contributor("U1", 0.0, 4);
        let pools = [
            ResourcePool { name: "compute", total: 100.0, weight: Metric::ExecutionTime },
            ResourcePool { name: "cloud_services", total: 10.0, weight: Metric::QueryCount },
        ];
        let out = attribute_bucket(bucket(), &pools, &[&u1]);
        assert_eq!(out.records[0].share("compute"), 0.0);
        assert_eq!(out.records[0].share("cloud_services"), 10.0);
        assert_eq!(out.unallocated.get("compute"), Some(&100.0));
        assert_eq!(out.guards, vec![Guard::ZeroDenominatorAttribution]);
    }
}
