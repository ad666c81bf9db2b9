//! Aggregated usage metrics and the named metrics derived from them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Summed and counted metrics of one entity within one bucket.
///
/// Missing event fields contribute `0` to the sums. Distinct sets are exact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageMetrics {
    pub event_count: u64,
    pub query_count: u64,
    pub write_query_count: u64,
    pub error_count: u64,
    pub off_hours_query_count: u64,
    pub execution_time: f64,
    pub bytes_scanned: f64,
    pub bytes_written: f64,
    pub rows_inserted: f64,
    pub rows_updated: f64,
    pub rows_deleted: f64,
    pub credits_compute: f64,
    pub credits_cloud_services: f64,
    pub login_count: u64,
    pub failed_login_count: u64,
    pub mfa_login_count: u64,
    pub password_only_login_count: u64,
    pub users: BTreeSet<String>,
    pub databases: BTreeSet<String>,
}

impl UsageMetrics {
    /// Fold another bucket's metrics into this one.
    pub fn merge(&mut self, other: &UsageMetrics) {
        self.event_count += other.event_count;
        self.query_count += other.query_count;
        self.write_query_count += other.write_query_count;
        self.error_count += other.error_count;
        self.off_hours_query_count += other.off_hours_query_count;
        self.execution_time += other.execution_time;
        self.bytes_scanned += other.bytes_scanned;
        self.bytes_written += other.bytes_written;
        self.rows_inserted += other.rows_inserted;
        self.rows_updated += other.rows_updated;
        self.rows_deleted += other.rows_deleted;
        self.credits_compute += other.credits_compute;
        self.credits_cloud_services += other.credits_cloud_services;
        self.login_count += other.login_count;
        self.failed_login_count += other.failed_login_count;
        self.mfa_login_count += other.mfa_login_count;
        self.password_only_login_count += other.password_only_login_count;
        self.users.extend(other.users.iter().cloned());
        self.databases.extend(other.databases.iter().cloned());
    }

    pub fn average_execution_time(&self) -> f64 {
        if self.query_count == 0 {
            0.0
        } else {
            self.execution_time / self.query_count as f64
        }
    }
}

/// How a metric is judged for anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Event counts, scored by z-score against the baseline.
    Count,
    /// Volumes and costs, scored by ratio to the 7-day moving average.
    Volume,
}

/// A named numeric metric of [`UsageMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    QueryCount,
    WriteQueryCount,
    ErrorCount,
    ExecutionTime,
    BytesScanned,
    BytesWritten,
    RowsInserted,
    RowsUpdated,
    RowsDeleted,
    CreditsCompute,
    CreditsCloudServices,
    TotalCredits,
    LoginCount,
    FailedLoginCount,
    ActiveUsers,
    DatabasesAccessed,
}

impl Metric {
    pub const ALL: [Metric; 16] = [
        Metric::QueryCount,
        Metric::WriteQueryCount,
        Metric::ErrorCount,
        Metric::ExecutionTime,
        Metric::BytesScanned,
        Metric::BytesWritten,
        Metric::RowsInserted,
        Metric::RowsUpdated,
        Metric::RowsDeleted,
        Metric::CreditsCompute,
        Metric::CreditsCloudServices,
        Metric::TotalCredits,
        Metric::LoginCount,
        Metric::FailedLoginCount,
        Metric::ActiveUsers,
        Metric::DatabasesAccessed,
    ];

    pub fn value(self, m: &UsageMetrics) -> f64 {
        match self {
            Metric::QueryCount => m.query_count as f64,
            Metric::WriteQueryCount => m.write_query_count as f64,
            Metric::ErrorCount => m.error_count as f64,
            Metric::ExecutionTime => m.execution_time,
            Metric::BytesScanned => m.bytes_scanned,
            Metric::BytesWritten => m.bytes_written,
            Metric::RowsInserted => m.rows_inserted,
            Metric::RowsUpdated => m.rows_updated,
            Metric::RowsDeleted => m.rows_deleted,
            Metric::CreditsCompute => m.credits_compute,
            Metric::CreditsCloudServices => m.credits_cloud_services,
            Metric::TotalCredits => m.credits_compute + m.credits_cloud_services,
            Metric::LoginCount => m.login_count as f64,
            Metric::FailedLoginCount => m.failed_login_count as f64,
            Metric::ActiveUsers => m.users.len() as f64,
            Metric::DatabasesAccessed => m.databases.len() as f64,
        }
    }

    pub fn kind(self) -> MetricKind {
        match self {
            Metric::QueryCount
            | Metric::WriteQueryCount
            | Metric::ErrorCount
            | Metric::LoginCount
            | Metric::FailedLoginCount
            | Metric::ActiveUsers
            | Metric::DatabasesAccessed => MetricKind::Count,
            _ => MetricKind::Volume,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::QueryCount => "query_count",
            Metric::WriteQueryCount => "write_query_count",
            Metric::ErrorCount => "error_count",
            Metric::ExecutionTime => "execution_time",
            Metric::BytesScanned => "bytes_scanned",
            Metric::BytesWritten => "bytes_written",
            Metric::RowsInserted => "rows_inserted",
            Metric::RowsUpdated => "rows_updated",
            Metric::RowsDeleted => "rows_deleted",
            Metric::CreditsCompute => "credits_compute",
            Metric::CreditsCloudServices => "credits_cloud_services",
            Metric::TotalCredits => "total_credits",
            Metric::LoginCount => "login_count",
            Metric::FailedLoginCount => "failed_login_count",
            Metric::ActiveUsers => "active_users",
            Metric::DatabasesAccessed => "databases_accessed",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown metric: {s}"))
    }
}
