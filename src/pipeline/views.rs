//! Materialization rows and the builders that derive them from one day's
//! aggregates, trends and scores.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use rusqlite::types::Value;
use serde::Serialize;

use crate::analysis::aggregator::MetricRecord;
use crate::analysis::trend::{pct_change, ChangeConvention, TrendRecord};
use crate::analysis::{Bucket, BusinessHours};
use crate::attribution::contribution::{Contribution, RiskLevel};
use crate::attribution::{attribute_bucket, ResourcePool};
use crate::config::CostConfig;
use crate::detect::anomaly::AnomalyRecord;
use crate::detect::pattern::{
    self, ActivitySignals, PatternContext, PatternType, TimeClass, PATTERN_RISK_RULES,
    PATTERN_RULES,
};
use crate::detect::security::{RoleSecurity, SecurityRisk, UserSecurity};
use crate::detect::{BehaviorClass, RecommendationTier};
use crate::entity::EntityKey;
use crate::error::Guard;
use crate::metrics::{Metric, UsageMetrics};
use crate::storage::derived::{int, opt_real, opt_text, text, Materialized};
use crate::storage::schema::{self, View};

pub const COMPUTE_POOL: &str = "compute";
pub const CLOUD_SERVICES_POOL: &str = "cloud_services";

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

fn day(d: NaiveDate) -> Value {
    text(d.to_string())
}

fn label(entity_value: &Option<String>) -> String {
    entity_value.clone().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Write activity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteActivityRow {
    pub date: NaiveDate,
    pub role: String,
    pub database: String,
    pub write_queries: u64,
    pub rows_inserted: f64,
    pub rows_updated: f64,
    pub rows_deleted: f64,
    pub bytes_written: f64,
    /// Growth convention: `0` without a previous positive value.
    pub rows_inserted_growth_pct: f64,
}

impl Materialized for WriteActivityRow {
    fn view() -> &'static View {
        &schema::DAILY_WRITE_ACTIVITY
    }

    fn values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            day(self.date),
            text(self.role.as_str()),
            text(self.database.as_str()),
            int(self.write_queries),
            Value::Real(self.rows_inserted),
            Value::Real(self.rows_updated),
            Value::Real(self.rows_deleted),
            Value::Real(self.bytes_written),
            Value::Real(self.rows_inserted_growth_pct),
        ])
    }
}

pub fn write_activity_rows<'a>(
    records: &[MetricRecord],
    trend: impl Fn(&MetricRecord) -> Option<&'a TrendRecord>,
) -> Vec<WriteActivityRow> {
    records
        .iter()
        .map(|r| {
            let m = &r.metrics;
            let lag1 = trend(r).and_then(|t| t.lag1);
            WriteActivityRow {
                date: r.bucket.date(),
                role: label(&r.entity.role),
                database: label(&r.entity.database),
                write_queries: m.write_query_count,
                rows_inserted: m.rows_inserted,
                rows_updated: m.rows_updated,
                rows_deleted: m.rows_deleted,
                bytes_written: m.bytes_written,
                rows_inserted_growth_pct: pct_change(m.rows_inserted, lag1, ChangeConvention::Growth)
                    .unwrap_or(0.0),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Role write summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleWriteSummaryRow {
    pub date: NaiveDate,
    pub role: String,
    pub window_start: NaiveDate,
    pub databases: u64,
    pub write_queries: u64,
    pub rows_inserted: f64,
    pub rows_updated: f64,
    pub rows_deleted: f64,
    pub bytes_written: f64,
    pub rank: u64,
}

impl Materialized for RoleWriteSummaryRow {
    fn view() -> &'static View {
        &schema::ROLE_WRITE_SUMMARY
    }

    fn values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            day(self.date),
            text(self.role.as_str()),
            day(self.window_start),
            int(self.databases),
            int(self.write_queries),
            Value::Real(self.rows_inserted),
            Value::Real(self.rows_updated),
            Value::Real(self.rows_deleted),
            Value::Real(self.bytes_written),
            int(self.rank),
        ])
    }
}

/// Seven-day rollup per role ending at `as_of`, ranked by rows inserted
/// (descending) with ties broken by role name.
pub fn role_write_summary<'a>(
    as_of: NaiveDate,
    records: impl IntoIterator<Item = &'a MetricRecord>,
) -> Vec<RoleWriteSummaryRow> {
    let window_start = as_of - Duration::days(6);
    let mut by_role: BTreeMap<String, UsageMetrics> = BTreeMap::new();
    for r in records {
        let date = r.bucket.date();
        if date < window_start || date > as_of {
            continue;
        }
        let Some(role) = r.entity.role.clone() else {
            continue;
        };
        let slot = by_role.entry(role).or_default();
        slot.merge(&r.metrics);
        if let Some(db) = &r.entity.database {
            slot.databases.insert(db.clone());
        }
    }

    let mut rows: Vec<RoleWriteSummaryRow> = by_role
        .into_iter()
        .map(|(role, m)| RoleWriteSummaryRow {
            date: as_of,
            role,
            window_start,
            databases: m.databases.len() as u64,
            write_queries: m.write_query_count,
            rows_inserted: m.rows_inserted,
            rows_updated: m.rows_updated,
            rows_deleted: m.rows_deleted,
            bytes_written: m.bytes_written,
            rank: 0,
        })
        .collect();
    rows.sort_by(|a, b| {
        b.rows_inserted
            .total_cmp(&a.rows_inserted)
            .then_with(|| a.role.cmp(&b.role))
    });
    for (i, row) in rows.iter_mut().enumerate() {
        row.rank = i as u64 + 1;
    }
    rows
}

// ---------------------------------------------------------------------------
// Consumption
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumptionRow {
    pub date: NaiveDate,
    pub role: String,
    pub total_queries: u64,
    pub gb_scanned: f64,
    pub active_users: u64,
    pub databases_accessed: u64,
    pub avg_execution_time: f64,
    pub credits: f64,
    pub credits_avg7: f64,
    /// Cost convention: `None` without a previous positive value.
    pub credits_dod_pct: Option<f64>,
}

impl Materialized for ConsumptionRow {
    fn view() -> &'static View {
        &schema::DAILY_CONSUMPTION
    }

    fn values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            day(self.date),
            text(self.role.as_str()),
            int(self.total_queries),
            Value::Real(self.gb_scanned),
            int(self.active_users),
            int(self.databases_accessed),
            Value::Real(self.avg_execution_time),
            Value::Real(self.credits),
            Value::Real(self.credits_avg7),
            opt_real(self.credits_dod_pct),
        ])
    }
}

pub fn consumption_rows<'a>(
    records: &[MetricRecord],
    trend: impl Fn(&MetricRecord) -> Option<&'a TrendRecord>,
) -> Vec<ConsumptionRow> {
    records
        .iter()
        .map(|r| {
            let m = &r.metrics;
            let credits = Metric::TotalCredits.value(m);
            let t = trend(r);
            ConsumptionRow {
                date: r.bucket.date(),
                role: label(&r.entity.role),
                total_queries: m.query_count,
                gb_scanned: m.bytes_scanned / BYTES_PER_GB,
                active_users: m.users.len() as u64,
                databases_accessed: m.databases.len() as u64,
                avg_execution_time: m.average_execution_time(),
                credits,
                credits_avg7: t.map(|t| t.avg7).unwrap_or(credits),
                credits_dod_pct: pct_change(credits, t.and_then(|t| t.lag1), ChangeConvention::Cost),
            }
        })
        .collect()
}

/// Attributed credits per role, written into the day's consumption records.
pub fn apply_role_credits(consumption: &mut [MetricRecord], cost: &[CostAttributionRow]) {
    let mut by_role: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
    for row in cost {
        if let Some(role) = row.role.as_deref() {
            let slot = by_role.entry(role).or_default();
            slot.0 += row.compute_credits;
            slot.1 += row.cloud_services_credits;
        }
    }
    for record in consumption.iter_mut() {
        let (compute, cloud) = record
            .entity
            .role
            .as_deref()
            .and_then(|role| by_role.get(role).copied())
            .unwrap_or_default();
        record.metrics.credits_compute = compute;
        record.metrics.credits_cloud_services = cloud;
    }
}

// ---------------------------------------------------------------------------
// Cost attribution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostAttributionRow {
    pub date: NaiveDate,
    pub hour: u8,
    pub warehouse: String,
    pub user: String,
    pub role: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub query_count: u64,
    pub execution_time: f64,
    pub compute_credits: f64,
    pub cloud_services_credits: f64,
    pub total_credits: f64,
    pub cost: f64,
}

impl Materialized for CostAttributionRow {
    fn view() -> &'static View {
        &schema::COST_ATTRIBUTION
    }

    fn values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            day(self.date),
            int(u64::from(self.hour)),
            text(self.warehouse.as_str()),
            text(self.user.as_str()),
            opt_text(self.role.as_deref()),
            opt_text(self.database.as_deref()),
            opt_text(self.schema.as_deref()),
            int(self.query_count),
            Value::Real(self.execution_time),
            Value::Real(self.compute_credits),
            Value::Real(self.cloud_services_credits),
            Value::Real(self.total_credits),
            Value::Real(self.cost),
        ])
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostAttribution {
    pub rows: Vec<CostAttributionRow>,
    /// Metered credits no query could carry, summed over the day.
    pub unallocated_credits: f64,
    pub guards: Vec<Guard>,
}

/// Split each warehouse-hour's metered credits across the queries run in it.
///
/// `metering` is hourly per warehouse, `queries` hourly per cost entity.
/// Compute and cloud-service credits use their own configured weights.
pub fn cost_attribution(
    metering: &[MetricRecord],
    queries: &[MetricRecord],
    cost: &CostConfig,
) -> CostAttribution {
    let mut buckets: BTreeMap<(Bucket, String), (Option<&UsageMetrics>, Vec<&MetricRecord>)> =
        BTreeMap::new();
    for m in metering {
        if let Some(wh) = &m.entity.warehouse {
            buckets.entry((m.bucket, wh.clone())).or_default().0 = Some(&m.metrics);
        }
    }
    for q in queries {
        if let Some(wh) = &q.entity.warehouse {
            buckets.entry((q.bucket, wh.clone())).or_default().1.push(q);
        }
    }

    let mut out = CostAttribution::default();
    for ((bucket, warehouse), (metered, contributors)) in buckets {
        let (compute, cloud) = metered
            .map(|m| (m.credits_compute, m.credits_cloud_services))
            .unwrap_or_default();
        let pools = [
            ResourcePool { name: COMPUTE_POOL, total: compute, weight: cost.compute_weight },
            ResourcePool {
                name: CLOUD_SERVICES_POOL,
                total: cloud,
                weight: cost.cloud_services_weight,
            },
        ];
        let attribution = attribute_bucket(bucket, &pools, &contributors);
        out.unallocated_credits += attribution.unallocated.values().sum::<f64>();
        out.guards.extend(attribution.guards);

        let hour = match bucket {
            Bucket::Hour(_, h) => h,
            Bucket::Day(_) => 0,
        };
        for (record, share) in contributors.iter().zip(&attribution.records) {
            let compute_credits = share.share(COMPUTE_POOL);
            let cloud_services_credits = share.share(CLOUD_SERVICES_POOL);
            let total_credits = compute_credits + cloud_services_credits;
            out.rows.push(CostAttributionRow {
                date: bucket.date(),
                hour,
                warehouse: warehouse.clone(),
                user: label(&record.entity.user),
                role: record.entity.role.clone(),
                database: record.entity.database.clone(),
                schema: record.entity.schema.clone(),
                query_count: record.metrics.query_count,
                execution_time: record.metrics.execution_time,
                compute_credits,
                cloud_services_credits,
                total_credits,
                cost: total_credits * cost.credit_price,
            });
        }
    }
    out
}

// ---------------------------------------------------------------------------
// User behavior profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BehaviorProfileRow {
    pub anomaly: AnomalyRecord,
    pub off_hours_queries: u64,
}

impl Materialized for BehaviorProfileRow {
    fn view() -> &'static View {
        &schema::USER_BEHAVIOR_PROFILE
    }

    fn values(&self) -> Result<Vec<Value>> {
        let a = &self.anomaly;
        Ok(vec![
            day(a.date),
            text(label(&a.entity.user)),
            text(label(&a.entity.role)),
            text(a.metric.as_str()),
            Value::Real(a.value),
            opt_real(a.trend.lag1),
            opt_real(a.trend.lag7),
            Value::Real(a.trend.avg7),
            Value::Real(a.trend.avg30),
            int(a.baseline.sample_count),
            Value::Real(a.baseline.mean),
            Value::Real(a.baseline.std_dev),
            Value::Real(a.baseline.p95),
            Value::Real(a.z_score),
            text(a.classification()),
            text(a.tier.label()),
            opt_real(a.deviation_from_mean_pct),
            opt_real(a.deviation_from_avg7_pct),
            int(self.off_hours_queries),
            opt_text(a.guard.map(Guard::as_str)),
        ])
    }
}

// ---------------------------------------------------------------------------
// Anomaly attribution
// ---------------------------------------------------------------------------

impl Materialized for Contribution {
    fn view() -> &'static View {
        &schema::ANOMALY_ATTRIBUTION
    }

    fn values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            day(self.date),
            text(self.metric.as_str()),
            text(label(&self.entity.user)),
            text(label(&self.entity.role)),
            opt_text(self.warehouse.as_deref()),
            Value::Real(self.value),
            Value::Real(self.contribution_pct),
            text(self.level.label()),
            int(self.error_count),
            int(self.query_count),
            Value::Real(self.attributed_excess),
            text(self.risk.label()),
            text(self.behavior_pattern.label()),
            text(self.recommended_action()),
        ])
    }
}

/// Name each contributor's main warehouse: the one that ran most of the
/// user's execution time that day, ties broken by name.
pub fn attach_warehouses(contributions: &mut [Contribution], cost_entities: &[MetricRecord]) {
    let mut time: BTreeMap<(&str, Option<&str>), BTreeMap<&str, f64>> = BTreeMap::new();
    for r in cost_entities {
        let (Some(user), Some(wh)) = (r.entity.user.as_deref(), r.entity.warehouse.as_deref())
        else {
            continue;
        };
        *time
            .entry((user, r.entity.role.as_deref()))
            .or_default()
            .entry(wh)
            .or_default() += r.metrics.execution_time;
    }

    for c in contributions.iter_mut() {
        let Some(user) = c.entity.user.as_deref() else {
            continue;
        };
        c.warehouse = time
            .get(&(user, c.entity.role.as_deref()))
            .and_then(|by_wh| {
                by_wh
                    .iter()
                    .max_by(|a, b| a.1.total_cmp(b.1).then_with(|| b.0.cmp(a.0)))
            })
            .map(|(wh, _)| (*wh).to_string());
    }
}

// ---------------------------------------------------------------------------
// Behavioral patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BehaviorPatternRow {
    pub date: NaiveDate,
    pub user: String,
    pub role: String,
    pub hour: u8,
    pub query_count: u64,
    pub error_count: u64,
    pub execution_time: f64,
    pub time_class: TimeClass,
    pub behavior: BehaviorClass,
    pub pattern: PatternType,
    pub risk: RiskLevel,
}

impl Materialized for BehaviorPatternRow {
    fn view() -> &'static View {
        &schema::BEHAVIORAL_PATTERNS
    }

    fn values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            day(self.date),
            text(self.user.as_str()),
            text(self.role.as_str()),
            int(u64::from(self.hour)),
            int(self.query_count),
            int(self.error_count),
            Value::Real(self.execution_time),
            text(self.time_class.label()),
            text(self.behavior.label()),
            text(self.pattern.label()),
            text(self.risk.label()),
            text(pattern::recommended_action(self.risk, self.pattern)),
        ])
    }
}

/// One row per user-hour of query activity.
///
/// `hourly` and `daily` are the same day's behavior records at hour and day
/// granularity; `behavior` gives the classification of the user's whole day.
pub fn behavioral_patterns(
    hourly: &[MetricRecord],
    daily: &[MetricRecord],
    hours: &BusinessHours,
    behavior: impl Fn(&EntityKey) -> BehaviorClass,
) -> Vec<BehaviorPatternRow> {
    let day_queries: BTreeMap<&EntityKey, u64> = daily
        .iter()
        .map(|r| (&r.entity, r.metrics.query_count))
        .collect();

    hourly
        .iter()
        .filter_map(|r| {
            let Bucket::Hour(date, hour) = r.bucket else {
                return None;
            };
            let m = &r.metrics;
            let total = day_queries.get(&r.entity).copied().unwrap_or(m.query_count);
            let pattern = PATTERN_RULES.classify(&ActivitySignals::hourly(m, total));
            let behavior = behavior(&r.entity);
            Some(BehaviorPatternRow {
                date,
                user: label(&r.entity.user),
                role: label(&r.entity.role),
                hour,
                query_count: m.query_count,
                error_count: m.error_count,
                execution_time: m.execution_time,
                time_class: if hours.contains(hour) {
                    TimeClass::BusinessHours
                } else {
                    TimeClass::OffHours
                },
                behavior,
                pattern,
                risk: PATTERN_RISK_RULES.classify(&PatternContext { pattern, behavior }),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Security
// ---------------------------------------------------------------------------

impl Materialized for UserSecurity {
    fn view() -> &'static View {
        &schema::USER_SECURITY
    }

    fn values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            day(self.date),
            text(self.user.as_str()),
            int(self.logins),
            int(self.failed_logins),
            int(self.mfa_logins),
            int(self.password_only_logins),
            text(self.mfa_status.label()),
            text(self.risk.label()),
        ])
    }
}

impl Materialized for RoleSecurity {
    fn view() -> &'static View {
        &schema::ROLE_SECURITY
    }

    fn values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            day(self.date),
            text(self.role.as_str()),
            int(self.active_users),
            int(self.mfa_compliant_users),
            Value::Real(self.compliance_pct),
            int(self.failed_logins),
            text(self.status.label()),
        ])
    }
}

// ---------------------------------------------------------------------------
// Recommendations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendationRow {
    pub date: NaiveDate,
    pub user: String,
    pub kind: &'static str,
    pub priority: &'static str,
    pub issue: String,
    pub actions: &'static str,
}

impl Materialized for RecommendationRow {
    fn view() -> &'static View {
        &schema::RECOMMENDATIONS
    }

    fn values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            day(self.date),
            text(self.user.as_str()),
            text(self.kind),
            text(self.priority),
            text(self.issue.as_str()),
            text(self.actions),
        ])
    }
}

fn behavior_actions(tier: RecommendationTier) -> &'static str {
    match tier {
        RecommendationTier::Urgent => {
            "Review the user's activity now and confirm the workload is authorized"
        }
        RecommendationTier::High => "Review recent queries with the user and verify the change",
        RecommendationTier::Medium | RecommendationTier::Low => {
            "Monitor the metric over the coming days"
        }
    }
}

/// Recommendations for a day, in a fixed order: behavior anomalies, anomaly
/// contributors, then login security.
pub fn recommendations(
    date: NaiveDate,
    profiles: &[BehaviorProfileRow],
    contributions: &[Contribution],
    users: &[UserSecurity],
) -> Vec<RecommendationRow> {
    let mut out = Vec::new();

    for p in profiles {
        let a = &p.anomaly;
        if a.tier < RecommendationTier::Medium {
            continue;
        }
        out.push(RecommendationRow {
            date,
            user: label(&a.entity.user),
            kind: "Behavioral Anomaly",
            priority: a.tier.priority(),
            issue: format!(
                "{} is {} ({:.1} vs mean {:.1}, z = {:.2})",
                a.metric,
                a.classification(),
                a.value,
                a.baseline.mean,
                a.z_score
            ),
            actions: behavior_actions(a.tier),
        });
    }

    for c in contributions {
        if c.risk < RiskLevel::High {
            continue;
        }
        out.push(RecommendationRow {
            date,
            user: label(&c.entity.user),
            kind: "Anomaly Contributor",
            priority: RecommendationTier::High.priority(),
            issue: format!(
                "{}: {:.1}% of anomalous {} with {} errors",
                c.risk.label(),
                c.contribution_pct,
                c.metric,
                c.error_count
            ),
            actions: "Investigate the workload behind the spike and the failing queries",
        });
    }

    for u in users {
        let (priority, actions) = match u.risk {
            SecurityRisk::High => (
                RecommendationTier::High.priority(),
                "Review failed login sources and enforce MFA",
            ),
            SecurityRisk::Medium => (
                RecommendationTier::Medium.priority(),
                "Move the user to MFA-based authentication",
            ),
            SecurityRisk::Low => continue,
        };
        out.push(RecommendationRow {
            date,
            user: u.user.clone(),
            kind: "Security Risk",
            priority,
            issue: format!(
                "{}: {} failed logins, {}",
                u.risk.label(),
                u.failed_logins,
                u.mfa_status.label()
            ),
            actions,
        });
    }

    out
}
