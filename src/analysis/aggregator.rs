use crate::entity::{Dimension, EntityKey, Grouping};
use crate::event::{Event, EventKind};
use crate::metrics::UsageMetrics;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum AggregateError {
    #[error("missing required dimension '{dimension}'")]
    MissingDimension { dimension: Dimension },

    #[error("invalid value {value} for '{field}' on {entity}")]
    InvalidMetric {
        entity: String,
        field: &'static str,
        value: f64,
    },
}

/// A closed time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Day(NaiveDate),
    Hour(NaiveDate, u8),
}

impl Bucket {
    pub fn date(&self) -> NaiveDate {
        match *self {
            Bucket::Day(d) | Bucket::Hour(d, _) => d,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bucket::Day(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Bucket::Hour(d, h) => write!(f, "{}T{:02}:00", d.format("%Y-%m-%d"), h),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Day,
    Hour,
}

/// Working hours in UTC, `[start, end)`. Queries outside count as off-hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessHours {
    pub start: u8,
    pub end: u8,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self { start: 8, end: 18 }
    }
}

impl BusinessHours {
    pub fn contains(&self, hour: u8) -> bool {
        hour >= self.start && hour < self.end
    }
}

/// Metrics of one entity in one bucket (the daily metric record when the
/// bucket is a day).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub bucket: Bucket,
    pub entity: EntityKey,
    pub metrics: UsageMetrics,
}

/// Output of one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    /// One record per (bucket, entity), ordered by bucket then entity.
    pub records: Vec<MetricRecord>,
    /// Events excluded for a missing required dimension, per dimension.
    pub excluded: BTreeMap<Dimension, usize>,
}

impl Aggregation {
    pub fn excluded_total(&self) -> usize {
        self.excluded.values().sum()
    }
}

/// Groups raw events into per-entity, per-bucket [`MetricRecord`]s.
#[derive(Debug, Clone)]
pub struct Aggregator {
    grouping: Grouping,
    granularity: Granularity,
    kinds: &'static [EventKind],
    business_hours: BusinessHours,
}

impl Aggregator {
    pub fn new(grouping: Grouping) -> Self {
        Self {
            grouping,
            granularity: Granularity::Day,
            kinds: &[],
            business_hours: BusinessHours::default(),
        }
    }

    /// Only fold events of these kinds. Empty means all kinds.
    pub fn kinds(mut self, kinds: &'static [EventKind]) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn hourly(mut self) -> Self {
        self.granularity = Granularity::Hour;
        self
    }

    pub fn business_hours(mut self, hours: BusinessHours) -> Self {
        self.business_hours = hours;
        self
    }

    /// Aggregate a closed bucket's events.
    ///
    /// Folding follows input order, so the same events in the same order give
    /// bit-identical records. An invalid metric value fails the whole pass.
    pub fn aggregate<'a, I>(&self, events: I) -> Result<Aggregation, AggregateError>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        let mut groups: BTreeMap<(Bucket, EntityKey), UsageMetrics> = BTreeMap::new();
        let mut excluded: BTreeMap<Dimension, usize> = BTreeMap::new();

        for event in events {
            if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
                continue;
            }
            let entity = match event.keys.project(&self.grouping) {
                Ok(key) => key,
                Err(dimension) => {
                    debug!(
                        grouping = self.grouping.name,
                        error = %AggregateError::MissingDimension { dimension },
                        "event excluded from grouping"
                    );
                    *excluded.entry(dimension).or_default() += 1;
                    continue;
                }
            };
            let bucket = match self.granularity {
                Granularity::Day => Bucket::Day(event.date()),
                Granularity::Hour => Bucket::Hour(event.date(), event.hour()),
            };
            let label = entity.to_string();
            let slot = groups.entry((bucket, entity)).or_default();
            fold_event(slot, event, &self.business_hours).map_err(|(field, value)| {
                AggregateError::InvalidMetric {
                    entity: label,
                    field,
                    value,
                }
            })?;
        }

        Ok(Aggregation {
            records: groups
                .into_iter()
                .map(|((bucket, entity), metrics)| MetricRecord {
                    bucket,
                    entity,
                    metrics,
                })
                .collect(),
            excluded,
        })
    }
}

/// `None` is the identity; negative or non-finite values are rejected.
fn amount(field: &'static str, value: Option<f64>) -> Result<f64, (&'static str, f64)> {
    match value {
        None => Ok(0.0),
        Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
        Some(v) => Err((field, v)),
    }
}

/// Add to a running sum; a sum that overflows to infinity is rejected.
fn add(field: &'static str, sum: &mut f64, value: f64) -> Result<(), (&'static str, f64)> {
    *sum += value;
    if sum.is_finite() {
        Ok(())
    } else {
        Err((field, *sum))
    }
}

fn fold_event(
    m: &mut UsageMetrics,
    event: &Event,
    hours: &BusinessHours,
) -> Result<(), (&'static str, f64)> {
    let em = &event.metrics;
    let execution_time = amount("execution_time", em.execution_time)?;
    let bytes_scanned = amount("bytes_scanned", em.bytes_scanned)?;
    let bytes_written = amount("bytes_written", em.bytes_written)?;
    let rows_inserted = amount("rows_inserted", em.rows_inserted)?;
    let rows_updated = amount("rows_updated", em.rows_updated)?;
    let rows_deleted = amount("rows_deleted", em.rows_deleted)?;
    let credits_compute = amount("credits_compute", em.credits_compute)?;
    let credits_cloud = amount("credits_cloud_services", em.credits_cloud_services)?;

    m.event_count += 1;
    add("execution_time", &mut m.execution_time, execution_time)?;
    add("bytes_scanned", &mut m.bytes_scanned, bytes_scanned)?;
    add("bytes_written", &mut m.bytes_written, bytes_written)?;
    add("rows_inserted", &mut m.rows_inserted, rows_inserted)?;
    add("rows_updated", &mut m.rows_updated, rows_updated)?;
    add("rows_deleted", &mut m.rows_deleted, rows_deleted)?;
    add("credits_compute", &mut m.credits_compute, credits_compute)?;
    add("credits_cloud_services", &mut m.credits_cloud_services, credits_cloud)?;

    match event.kind {
        EventKind::Query => {
            m.query_count += 1;
            if event.is_write() {
                m.write_query_count += 1;
            }
            if event.failed() {
                m.error_count += 1;
            }
            if !hours.contains(event.hour()) {
                m.off_hours_query_count += 1;
            }
        }
        EventKind::Login => {
            m.login_count += 1;
            if event.failed() {
                m.failed_login_count += 1;
            } else if event.has_second_factor() {
                m.mfa_login_count += 1;
            } else if event.is_password_first_factor() {
                m.password_only_login_count += 1;
            }
        }
        EventKind::Metering => {}
    }

    if let Some(user) = event.keys.get(Dimension::User) {
        m.users.insert(user.to_string());
    }
    if let Some(db) = event.keys.get(Dimension::Database) {
        m.databases.insert(db.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetrics;

    fn query(ts: &str, user: &str, role: Option<&str>, db: &str, exec: Option<f64>) -> Event {
        Event {
            timestamp: ts.parse().unwrap(),
            kind: EventKind::Query,
            keys: EntityKey {
                user: Some(user.into()),
                role: role.map(String::from),
                warehouse: Some("WH".into()),
                database: Some(db.into()),
                schema: None,
            },
            metrics: EventMetrics {
                query_type: Some("SELECT".into()),
                execution_time: exec,
                ..Default::default()
            },
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 18).unwrap()
    }

    #[test]
    fn test_missing_role_excluded_only_where_required() {
        let events = vec![
            query("2025-08-18T09:00:00Z", "ALICE", Some("ANALYST"), "SALES", Some(10.0)),
            query("2025-08-18T10:00:00Z", "BOB", None, "SALES", Some(5.0)),
        ];

        let by_role = Aggregator::new(Grouping::CONSUMPTION)
            .aggregate(&events)
            .unwrap();
        assert_eq!(by_role.records.len(), 1);
        assert_eq!(by_role.excluded.get(&Dimension::Role), Some(&1));

        let by_user = Aggregator::new(Grouping::USER_LOGINS)
            .kinds(&[EventKind::Query])
            .aggregate(&events)
            .unwrap();
        assert_eq!(by_user.records.len(), 2);
        assert_eq!(by_user.excluded_total(), 0);
    }

    #[test]
    fn test_null_metrics_sum_as_zero() {
        let events = vec![
            query("2025-08-18T09:00:00Z", "ALICE", Some("ANALYST"), "SALES", None),
            query("2025-08-18T09:30:00Z", "ALICE", Some("ANALYST"), "SALES", Some(7.5)),
        ];
        let agg = Aggregator::new(Grouping::BEHAVIOR).aggregate(&events).unwrap();
        assert_eq!(agg.records.len(), 1);
        let m = &agg.records[0].metrics;
        assert_eq!(m.query_count, 2);
        assert_eq!(m.execution_time, 7.5);
        assert_eq!(agg.records[0].bucket, Bucket::Day(day()));
    }

    #[test]
    fn test_distinct_counts_are_exact() {
        let events = vec![
            query("2025-08-18T09:00:00Z", "ALICE", Some("ANALYST"), "SALES", None),
            query("2025-08-18T09:10:00Z", "BOB", Some("ANALYST"), "SALES", None),
            query("2025-08-18T09:20:00Z", "ALICE", Some("ANALYST"), "HR", None),
        ];
        let agg = Aggregator::new(Grouping::CONSUMPTION).aggregate(&events).unwrap();
        let m = &agg.records[0].metrics;
        assert_eq!(m.users.len(), 2);
        assert_eq!(m.databases.len(), 2);
    }

    #[test]
    fn test_reaggregation_is_identical() {
        let events: Vec<Event> = (0..50)
            .map(|i| {
                query(
                    "2025-08-18T09:00:00Z",
                    if i % 3 == 0 { "ALICE" } else { "BOB" },
                    Some("ANALYST"),
                    "SALES",
                    Some(0.1 * i as f64),
                )
            })
            .collect();
        let agg = Aggregator::new(Grouping::BEHAVIOR);
        let first = agg.aggregate(&events).unwrap();
        let second = agg.aggregate(&events).unwrap();
        assert_eq!(first, second);
        for (a, b) in first.records.iter().zip(&second.records) {
            assert_eq!(
                a.metrics.execution_time.to_bits(),
                b.metrics.execution_time.to_bits()
            );
        }
    }

    #[test]
    fn test_negative_metric_fails_the_pass() {
        let events = vec![query(
            "2025-08-18T09:00:00Z",
            "ALICE",
            Some("ANALYST"),
            "SALES",
            Some(-3.0),
        )];
        let err = Aggregator::new(Grouping::BEHAVIOR)
            .aggregate(&events)
            .unwrap_err();
        assert!(matches!(
            err,
            AggregateError::InvalidMetric { field: "execution_time", .. }
        ));
    }

    #[test]
    fn test_overflowing_sum_fails_the_pass() {
        let mut events = vec![
            query("2025-08-18T09:00:00Z", "ALICE", Some("ANALYST"), "SALES", None),
            query("2025-08-18T09:05:00Z", "ALICE", Some("ANALYST"), "SALES", None),
        ];
        for e in &mut events {
            e.metrics.bytes_scanned = Some(1e308);
        }
        let err = Aggregator::new(Grouping::BEHAVIOR)
            .aggregate(&events)
            .unwrap_err();
        match err {
            AggregateError::InvalidMetric { entity, field, value } => {
                assert_eq!(field, "bytes_scanned");
                assert_eq!(entity, "user=ALICE,role=ANALYST");
                assert!(value.is_infinite());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_hourly_buckets_and_off_hours() {
        let events = vec![
            query("2025-08-18T06:00:00Z", "ALICE", Some("ANALYST"), "SALES", None),
            query("2025-08-18T06:59:00Z", "ALICE", Some("ANALYST"), "SALES", None),
            query("2025-08-18T09:00:00Z", "ALICE", Some("ANALYST"), "SALES", None),
        ];
        let hourly = Aggregator::new(Grouping::BEHAVIOR)
            .hourly()
            .aggregate(&events)
            .unwrap();
        assert_eq!(hourly.records.len(), 2);
        assert_eq!(hourly.records[0].bucket, Bucket::Hour(day(), 6));
        assert_eq!(hourly.records[0].bucket.to_string(), "2025-08-18T06:00");

        let daily = Aggregator::new(Grouping::BEHAVIOR).aggregate(&events).unwrap();
        assert_eq!(daily.records[0].metrics.off_hours_query_count, 2);
    }

    #[test]
    fn test_login_classification() {
        let mut ok_mfa = query("2025-08-18T09:00:00Z", "ALICE", None, "SALES", None);
        ok_mfa.kind = EventKind::Login;
        ok_mfa.metrics.auth_first_factor = Some("PASSWORD".into());
        ok_mfa.metrics.auth_second_factor = Some("DUO".into());
        ok_mfa.metrics.success = Some(true);

        let mut pw_only = ok_mfa.clone();
        pw_only.metrics.auth_second_factor = None;

        let mut failed = pw_only.clone();
        failed.metrics.success = Some(false);

        let events = vec![ok_mfa, pw_only, failed];
        let agg = Aggregator::new(Grouping::USER_LOGINS)
            .kinds(&[EventKind::Login])
            .aggregate(&events)
            .unwrap();
        let m = &agg.records[0].metrics;
        assert_eq!(m.login_count, 3);
        assert_eq!(m.mfa_login_count, 1);
        assert_eq!(m.password_only_login_count, 1);
        assert_eq!(m.failed_login_count, 1);
        assert_eq!(m.query_count, 0);
    }
}
