//! The recompute itself.
//!
//! A run works in three phases. Each day of the range is aggregated on its own
//! blocking task. Entity baselines and trends then run in chunks, one arena
//! per chunk. Finally the buckets are committed one at a time in date order,
//! and the first failed bucket halts the rest of the run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::aggregator::MetricRecord;
use crate::analysis::stats::{insert_sorted, percentile};
use crate::analysis::trend::compute_trends;
use crate::analysis::{Aggregator, BaselineArena, BaselineRecord};
use crate::attribution::contribution::{contributions, Contribution, ForecastBound};
use crate::config::Config;
use crate::detect::anomaly::score;
use crate::detect::BehaviorClass;
use crate::detect::security::{assess_roles, assess_users, RoleSecurity, UserSecurity};
use crate::entity::{EntityKey, Grouping};
use crate::error::PipelineError;
use crate::event::{Event, EventKind, EventSource};
use crate::metrics::Metric;
use crate::scheduler::history::{self, HistoryEntry, RunStatus};
use crate::storage::derived::{
    commit_bucket, latest_snapshots, load_history, GroupedRecord, Snapshot, TableRows,
};
use crate::storage::events::forecast_bounds_for_day;
use crate::storage::Pool;

use super::views::{self, BehaviorProfileRow, CostAttribution};
use super::{
    BucketRange, BucketReport, EntityDay, RunSummary, Settings, BASELINE_QUANTILE,
    CONSUMPTION_TREND_METRIC, PATTERN_METRIC, WRITE_TREND_METRIC,
};

/// Prior days kept per entity for trend windows (30 days with the current one).
const TREND_HISTORY: usize = 29;

const QUERIES: &[EventKind] = &[EventKind::Query];
const LOGINS: &[EventKind] = &[EventKind::Login];
const METERING: &[EventKind] = &[EventKind::Metering];

type DayKey = (&'static str, NaiveDate, EntityKey, Metric);

/// Everything derived from one day's events alone.
#[derive(Debug, Default)]
struct DayAggregates {
    behavior: Vec<MetricRecord>,
    behavior_hourly: Vec<MetricRecord>,
    write: Vec<MetricRecord>,
    consumption: Vec<MetricRecord>,
    cost: CostAttribution,
    contributions: Vec<Contribution>,
    users: Vec<UserSecurity>,
    roles: Vec<RoleSecurity>,
    excluded: usize,
}

fn aggregate_day(
    events: &[Event],
    bounds: &[ForecastBound],
    settings: &Settings,
) -> Result<DayAggregates> {
    let hours = settings.business_hours;
    let by = |grouping: Grouping, kinds: &'static [EventKind]| {
        Aggregator::new(grouping).kinds(kinds).business_hours(hours)
    };

    let behavior = by(Grouping::BEHAVIOR, QUERIES).aggregate(events)?;
    let behavior_hourly = by(Grouping::BEHAVIOR, QUERIES).hourly().aggregate(events)?;
    let write =
        by(Grouping::WRITE_ACTIVITY, QUERIES).aggregate(events.iter().filter(|e| e.is_write()))?;
    let mut consumption = by(Grouping::CONSUMPTION, QUERIES).aggregate(events)?;
    let cost_entities = by(Grouping::COST_ENTITY, QUERIES).hourly().aggregate(events)?;
    let metering = by(Grouping::WAREHOUSE, METERING).hourly().aggregate(events)?;
    let user_logins = by(Grouping::USER_LOGINS, LOGINS).aggregate(events)?;
    let role_logins = by(Grouping::ROLE_LOGINS, LOGINS).aggregate(events)?;

    let cost = views::cost_attribution(&metering.records, &cost_entities.records, &settings.cost);
    views::apply_role_credits(&mut consumption.records, &cost.rows);

    let excluded = [
        &behavior,
        &write,
        &consumption,
        &cost_entities,
        &metering,
        &user_logins,
        &role_logins,
    ]
    .iter()
    .map(|a| a.excluded_total())
    .sum();

    let mut day_contributions: Vec<Contribution> = bounds
        .iter()
        .flat_map(|b| contributions(b, &behavior.records))
        .collect();
    views::attach_warehouses(&mut day_contributions, &cost_entities.records);

    Ok(DayAggregates {
        contributions: day_contributions,
        users: assess_users(&user_logins.records),
        roles: assess_roles(&role_logins.records),
        behavior: behavior.records,
        behavior_hourly: behavior_hourly.records,
        write: write.records,
        consumption: consumption.records,
        cost,
        excluded,
    })
}

fn load_day(
    source: &dyn EventSource,
    pool: &Pool,
    date: NaiveDate,
    settings: &Settings,
) -> Result<DayAggregates> {
    let events = source
        .events_for_day(date)
        .with_context(|| format!("failed to read events for {date}"))?;
    let bounds = {
        let conn = pool.get().context("Failed to get DB connection")?;
        forecast_bounds_for_day(&conn, date)?
    };
    let day = aggregate_day(&events, &bounds, settings)
        .with_context(|| format!("aggregation of {date} failed"))?;
    debug!(bucket = %date, events = events.len(), excluded = day.excluded, "day aggregated");
    Ok(day)
}

// ---------------------------------------------------------------------------
// Entity jobs
// ---------------------------------------------------------------------------

/// One entity of one grouping across the run.
struct EntityJob {
    grouping: &'static Grouping,
    entity: EntityKey,
    /// Stored days before the range, oldest first.
    history: Vec<MetricRecord>,
    /// Days of the range, oldest first.
    current: Vec<MetricRecord>,
    metrics: Vec<Metric>,
    /// Baselined and scored, not only trended.
    scored: bool,
    seeds: Vec<BaselineRecord>,
}

#[derive(Default)]
struct JobOutput {
    days: Vec<(DayKey, EntityDay)>,
    snapshots: Vec<BaselineRecord>,
    failures: Vec<(NaiveDate, String)>,
}

impl EntityJob {
    fn run(self, arena: &mut BaselineArena) -> JobOutput {
        let mut out = JobOutput::default();
        let Some(first_day) = self.current.first().map(|r| r.bucket.date()) else {
            return out;
        };
        let h = self.history.len();
        let last_history = self.history.last().map(|r| r.bucket.date());

        for &metric in &self.metrics {
            let series: Vec<(NaiveDate, f64)> = self
                .history
                .iter()
                .chain(&self.current)
                .map(|r| (r.bucket.date(), metric.value(&r.metrics)))
                .collect();
            let trends = match compute_trends(&series) {
                Ok(t) => t,
                Err(e) => {
                    out.failures.push((first_day, format!("{}: {e}", self.entity)));
                    continue;
                }
            };

            if !self.scored {
                for t in &trends[h..] {
                    out.days.push((
                        (self.grouping.name, t.date, self.entity.clone(), metric),
                        EntityDay { trend: *t, anomaly: None },
                    ));
                }
                continue;
            }

            // Reuse the stored snapshot only if it covers exactly the history.
            let seed = self.seeds.iter().find(|s| {
                s.metric == metric
                    && s.stats.count() as usize == h
                    && s.last_date == last_history
            });
            match seed {
                Some(s) => arena.seed(s.clone()),
                None => {
                    arena.seed(BaselineRecord::new(self.entity.clone(), metric));
                    let refold = series[..h]
                        .iter()
                        .try_for_each(|(d, v)| arena.update(&self.entity, metric, *d, *v).map(|_| ()));
                    if let Err(e) = refold {
                        out.failures.push((first_day, e.to_string()));
                        continue;
                    }
                }
            }

            let mut sorted: Vec<f64> = series[..h].iter().map(|(_, v)| *v).collect();
            sorted.sort_by(f64::total_cmp);

            for t in &trends[h..] {
                let record = match arena.update(&self.entity, metric, t.date, t.value) {
                    Ok(r) => r,
                    Err(e) => {
                        out.failures.push((t.date, e.to_string()));
                        break;
                    }
                };
                insert_sorted(&mut sorted, t.value);
                let baseline = record.baseline(percentile(&sorted, BASELINE_QUANTILE));
                out.snapshots.push(record.clone());
                out.days.push((
                    (self.grouping.name, t.date, self.entity.clone(), metric),
                    EntityDay {
                        trend: *t,
                        anomaly: Some(score(&self.entity, metric, baseline, *t)),
                    },
                ));
            }
        }
        out
    }
}

fn group_current<'a>(
    days: impl Iterator<Item = &'a [MetricRecord]>,
) -> BTreeMap<EntityKey, Vec<MetricRecord>> {
    let mut out: BTreeMap<EntityKey, Vec<MetricRecord>> = BTreeMap::new();
    for records in days {
        for r in records {
            out.entry(r.entity.clone()).or_default().push(r.clone());
        }
    }
    out
}

/// Stored state the run starts from.
struct Prior {
    behavior: BTreeMap<EntityKey, Vec<MetricRecord>>,
    write: BTreeMap<EntityKey, Vec<MetricRecord>>,
    consumption: BTreeMap<EntityKey, Vec<MetricRecord>>,
    snapshots: Vec<BaselineRecord>,
}

fn load_prior(pool: &Pool, start: NaiveDate) -> Result<Prior> {
    let conn = pool.get().context("Failed to get DB connection")?;
    Ok(Prior {
        behavior: load_history(&conn, &Grouping::BEHAVIOR, start, None)?,
        write: load_history(&conn, &Grouping::WRITE_ACTIVITY, start, Some(TREND_HISTORY))?,
        consumption: load_history(&conn, &Grouping::CONSUMPTION, start, Some(TREND_HISTORY))?,
        snapshots: latest_snapshots(&conn, &Grouping::BEHAVIOR, start)?,
    })
}

fn build_jobs(
    prior: &mut Prior,
    days: &BTreeMap<NaiveDate, DayAggregates>,
    settings: &Settings,
) -> Vec<EntityJob> {
    let mut seeds: HashMap<EntityKey, Vec<BaselineRecord>> = HashMap::new();
    for s in prior.snapshots.drain(..) {
        seeds.entry(s.entity.clone()).or_default().push(s);
    }

    let mut jobs = Vec::new();
    let mut push = |grouping: &'static Grouping,
                    history: &BTreeMap<EntityKey, Vec<MetricRecord>>,
                    current: BTreeMap<EntityKey, Vec<MetricRecord>>,
                    metrics: &[Metric],
                    scored: bool| {
        for (entity, current) in current {
            jobs.push(EntityJob {
                grouping,
                history: history.get(&entity).cloned().unwrap_or_default(),
                seeds: if scored { seeds.remove(&entity).unwrap_or_default() } else { Vec::new() },
                entity,
                current,
                metrics: metrics.to_vec(),
                scored,
            });
        }
    };

    push(
        &Grouping::BEHAVIOR,
        &prior.behavior,
        group_current(days.values().map(|d| d.behavior.as_slice())),
        settings.profile_metrics.as_slice(),
        true,
    );
    push(
        &Grouping::WRITE_ACTIVITY,
        &prior.write,
        group_current(days.values().map(|d| d.write.as_slice())),
        &[WRITE_TREND_METRIC][..],
        false,
    );
    push(
        &Grouping::CONSUMPTION,
        &prior.consumption,
        group_current(days.values().map(|d| d.consumption.as_slice())),
        &[CONSUMPTION_TREND_METRIC][..],
        false,
    );
    jobs
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// Inputs of the commit phase.
struct CommitPlan {
    run_id: String,
    range: BucketRange,
    settings: Arc<Settings>,
    days: BTreeMap<NaiveDate, DayAggregates>,
    day_errors: BTreeMap<NaiveDate, String>,
    entity_days: BTreeMap<DayKey, EntityDay>,
    snapshots: BTreeMap<NaiveDate, Vec<BaselineRecord>>,
    entity_failures: BTreeMap<NaiveDate, Vec<String>>,
    /// Stored and current write records, for the trailing summary.
    write_window: Vec<MetricRecord>,
}

impl CommitPlan {
    fn tables(
        &self,
        date: NaiveDate,
        day: &DayAggregates,
        report: &mut BucketReport,
    ) -> Result<Vec<TableRows>> {
        let trend = move |grouping: &'static Grouping, metric: Metric| {
            move |r: &MetricRecord| {
                self.entity_days
                    .get(&(grouping.name, date, r.entity.clone(), metric))
                    .map(|d| &d.trend)
            }
        };

        let daily: Vec<GroupedRecord<'_>> = [
            (&Grouping::BEHAVIOR, &day.behavior),
            (&Grouping::WRITE_ACTIVITY, &day.write),
            (&Grouping::CONSUMPTION, &day.consumption),
        ]
        .into_iter()
        .flat_map(|(grouping, records)| {
            records.iter().map(move |record| GroupedRecord { grouping, record })
        })
        .collect();

        let snapshots: Vec<Snapshot<'_>> = self
            .snapshots
            .get(&date)
            .into_iter()
            .flatten()
            .map(|record| Snapshot { grouping: &Grouping::BEHAVIOR, record })
            .collect();

        let profiles: Vec<BehaviorProfileRow> = day
            .behavior
            .iter()
            .flat_map(|r| {
                self.settings.profile_metrics.iter().filter_map(move |&metric| {
                    let key = (Grouping::BEHAVIOR.name, date, r.entity.clone(), metric);
                    let anomaly = self.entity_days.get(&key)?.anomaly.clone()?;
                    Some(BehaviorProfileRow {
                        anomaly,
                        off_hours_queries: r.metrics.off_hours_query_count,
                    })
                })
            })
            .collect();

        report.excluded_events = day.excluded;
        report.count_guards(profiles.iter().filter_map(|p| p.anomaly.guard.as_ref()));
        report.count_guards(day.contributions.iter().filter_map(|c| c.guard.as_ref()));
        report.count_guards(&day.cost.guards);

        let recommendations =
            views::recommendations(date, &profiles, &day.contributions, &day.users);

        let patterns = views::behavioral_patterns(
            &day.behavior_hourly,
            &day.behavior,
            &self.settings.business_hours,
            |entity| {
                let key = (Grouping::BEHAVIOR.name, date, entity.clone(), PATTERN_METRIC);
                self.entity_days
                    .get(&key)
                    .and_then(|d| d.anomaly.as_ref())
                    .map_or(BehaviorClass::Normal, |a| a.behavior)
            },
        );

        Ok(vec![
            TableRows::of(&daily)?,
            TableRows::of(&snapshots)?,
            TableRows::of(&views::write_activity_rows(
                &day.write,
                trend(&Grouping::WRITE_ACTIVITY, WRITE_TREND_METRIC),
            ))?,
            TableRows::of(&views::role_write_summary(date, &self.write_window))?,
            TableRows::of(&views::consumption_rows(
                &day.consumption,
                trend(&Grouping::CONSUMPTION, CONSUMPTION_TREND_METRIC),
            ))?,
            TableRows::of(&day.cost.rows)?,
            TableRows::of(&profiles)?,
            TableRows::of(&patterns)?,
            TableRows::of(&day.contributions)?,
            TableRows::of(&day.users)?,
            TableRows::of(&day.roles)?,
            TableRows::of(&recommendations)?,
        ])
    }

    /// Commit each bucket in date order. Only a ledger write failure is
    /// returned as an error; bucket failures are reported.
    fn execute(self, pool: &Pool) -> Result<Vec<BucketReport>> {
        let mut conn = pool.get().context("Failed to get DB connection")?;
        let mut reports = Vec::new();
        let mut halted: Option<NaiveDate> = None;

        for date in self.range.days() {
            let started_at = Utc::now();
            let mut report = BucketReport::new(date, RunStatus::Success);

            if let Some(failed) = halted {
                let err = PipelineError::UpstreamBucketFailed { bucket: date, failed };
                warn!(bucket = %date, failed_bucket = %failed, "bucket skipped");
                report.status = RunStatus::Skipped;
                report.error = Some(err.to_string());
            } else {
                let failures: Vec<String> = match (self.day_errors.get(&date), self.days.get(&date)) {
                    (Some(e), _) => vec![e.clone()],
                    (None, Some(_)) => self.entity_failures.get(&date).cloned().unwrap_or_default(),
                    (None, None) => vec!["bucket was not aggregated".to_string()],
                };

                let outcome = if failures.is_empty() {
                    self.days
                        .get(&date)
                        .context("bucket was not aggregated")
                        .and_then(|day| {
                            let tables = self.tables(date, day, &mut report)?;
                            commit_bucket(&mut conn, date, &tables)
                        })
                        .map_err(|e| format!("{e:#}"))
                } else {
                    Err(PipelineError::PartialBucketFailure { bucket: date, failures }.to_string())
                };

                match outcome {
                    Ok(rows) => {
                        report.rows_written = rows;
                        info!(
                            bucket = %date,
                            rows,
                            excluded = report.excluded_events,
                            degenerate_baselines = report.degenerate_baselines,
                            zero_denominator = report.zero_denominator_attributions,
                            "bucket committed"
                        );
                    }
                    Err(detail) => {
                        error!(bucket = %date, error = %detail, "bucket failed; previous rows kept");
                        report.status = RunStatus::Failed;
                        report.error = Some(detail);
                        halted = Some(date);
                    }
                }
            }

            history::record(
                &conn,
                &HistoryEntry {
                    run_id: self.run_id.clone(),
                    bucket: date,
                    status: report.status,
                    detail: report.error.clone(),
                    started_at,
                    finished_at: Utc::now(),
                },
            )?;
            reports.push(report);
        }
        Ok(reports)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Recomputes every materialization for a range of closed day buckets.
#[derive(Clone)]
pub struct Pipeline {
    pool: Pool,
    source: Arc<dyn EventSource>,
    settings: Arc<Settings>,
}

impl Pipeline {
    pub fn new(pool: Pool, source: Arc<dyn EventSource>, config: &Config) -> Self {
        Self::with_settings(pool, source, Settings::from(config))
    }

    pub fn with_settings(pool: Pool, source: Arc<dyn EventSource>, settings: Settings) -> Self {
        Self {
            pool,
            source,
            settings: Arc::new(settings),
        }
    }

    /// Recompute `range`. Re-running a range overwrites its rows.
    pub async fn recompute(&self, range: BucketRange) -> Result<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        let workers = self.settings.workers.max(1);
        info!(run_id = %run_id, start = %range.start, end = %range.end, workers, "recompute started");

        // Phase 1: per-day aggregation.
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut set = JoinSet::new();
        for date in range.days() {
            let permit = semaphore.clone().acquire_owned().await?;
            let source = self.source.clone();
            let pool = self.pool.clone();
            let settings = self.settings.clone();
            set.spawn_blocking(move || {
                let _permit = permit;
                (date, load_day(source.as_ref(), &pool, date, &settings))
            });
        }

        let mut days = BTreeMap::new();
        let mut day_errors = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            let (date, result) = joined.context("aggregation task panicked")?;
            match result {
                Ok(day) => {
                    days.insert(date, day);
                }
                Err(e) => {
                    day_errors.insert(date, format!("{e:#}"));
                }
            }
        }

        // Days at or after the first failure are never committed.
        if let Some(&first_failed) = day_errors.keys().next() {
            days.retain(|d, _| *d < first_failed);
        }

        // Phase 2: baselines, trends and scores per entity.
        let pool = self.pool.clone();
        let start = range.start;
        let mut prior = tokio::task::spawn_blocking(move || load_prior(&pool, start))
            .await
            .context("history task panicked")??;

        let mut write_window: Vec<MetricRecord> = prior.write.values().flatten().cloned().collect();
        write_window.extend(days.values().flat_map(|d| d.write.iter().cloned()));

        let jobs = build_jobs(&mut prior, &days, &self.settings);
        let job_count = jobs.len();
        let chunk_size = job_count.div_ceil(workers).max(1);
        let mut chunks: Vec<Vec<EntityJob>> = Vec::new();
        let mut jobs = jobs.into_iter().peekable();
        while jobs.peek().is_some() {
            chunks.push(jobs.by_ref().take(chunk_size).collect());
        }

        let mut set = JoinSet::new();
        for chunk in chunks {
            set.spawn_blocking(move || {
                let mut arena = BaselineArena::new();
                chunk
                    .into_iter()
                    .map(|job| job.run(&mut arena))
                    .collect::<Vec<_>>()
            });
        }

        let mut entity_days = BTreeMap::new();
        let mut snapshots: BTreeMap<NaiveDate, Vec<BaselineRecord>> = BTreeMap::new();
        let mut entity_failures: BTreeMap<NaiveDate, Vec<String>> = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            for output in joined.context("entity task panicked")? {
                entity_days.extend(output.days);
                for s in output.snapshots {
                    if let Some(d) = s.last_date {
                        snapshots.entry(d).or_default().push(s);
                    }
                }
                for (d, failure) in output.failures {
                    entity_failures.entry(d).or_default().push(failure);
                }
            }
        }
        // Chunks finish in any order; keep snapshot rows deterministic.
        for list in snapshots.values_mut() {
            list.sort_by(|a, b| (&a.entity, a.metric).cmp(&(&b.entity, b.metric)));
        }
        debug!(run_id = %run_id, entities = job_count, "entity jobs finished");

        // Phase 3: ordered commits.
        let plan = CommitPlan {
            run_id: run_id.clone(),
            range,
            settings: self.settings.clone(),
            days,
            day_errors,
            entity_days,
            snapshots,
            entity_failures,
            write_window,
        };
        let pool = self.pool.clone();
        let buckets = tokio::task::spawn_blocking(move || plan.execute(&pool))
            .await
            .context("commit task panicked")??;

        let summary = RunSummary { run_id, range, buckets };
        info!(
            run_id = %summary.run_id,
            succeeded = summary.count(RunStatus::Success),
            failed = summary.count(RunStatus::Failed),
            skipped = summary.count(RunStatus::Skipped),
            "recompute finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventMetrics, MemoryEventSource};
    use crate::storage::derived::read_view;
    use crate::storage::open_pool;
    use crate::storage::schema;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, day).unwrap()
    }

    fn query(day: u32, hour: u32, user: &str, execution_time: f64) -> Event {
        Event {
            timestamp: format!("2025-08-{day:02}T{hour:02}:00:00Z").parse().unwrap(),
            kind: EventKind::Query,
            keys: EntityKey {
                user: Some(user.into()),
                role: Some("ANALYST".into()),
                warehouse: Some("WH".into()),
                database: Some("SALES".into()),
                schema: None,
            },
            metrics: EventMetrics {
                execution_time: Some(execution_time),
                ..Default::default()
            },
        }
    }

    fn metering(day: u32, hour: u32, credits: f64) -> Event {
        Event {
            timestamp: format!("2025-08-{day:02}T{hour:02}:30:00Z").parse().unwrap(),
            kind: EventKind::Metering,
            keys: EntityKey {
                warehouse: Some("WH".into()),
                ..Default::default()
            },
            metrics: EventMetrics {
                credits_compute: Some(credits),
                ..Default::default()
            },
        }
    }

    /// One to three queries a day for `days` days, with hourly metering.
    fn workload(days: u32) -> Vec<Event> {
        let mut events = Vec::new();
        for day in 1..=days {
            for q in 0..(day % 3 + 1) {
                events.push(query(day, 9 + q, "ALICE", 10.0 * f64::from(q + 1)));
            }
            events.push(query(day, 10, "BOB", 30.0));
            events.push(metering(day, 9, 2.0));
            events.push(metering(day, 10, 4.0));
        }
        events
    }

    fn pipeline(pool: &Pool, events: Vec<Event>) -> Pipeline {
        let settings = Settings { workers: 2, ..Settings::default() };
        Pipeline::with_settings(pool.clone(), Arc::new(MemoryEventSource::new(events)), settings)
    }

    fn rows(pool: &Pool, view: &schema::View, from: u32, to: u32) -> Vec<serde_json::Value> {
        read_view(&pool.get().unwrap(), view, d(from), d(to)).unwrap()
    }

    #[tokio::test]
    async fn test_recompute_commits_every_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).unwrap();
        let summary = pipeline(&pool, workload(3))
            .recompute(BucketRange::new(d(1), d(3)).unwrap())
            .await
            .unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.buckets.len(), 3);
        let consumption = rows(&pool, &schema::DAILY_CONSUMPTION, 1, 3);
        assert_eq!(consumption.len(), 3);
        // All six metered credits land on the one role.
        assert!((consumption[0]["credits"].as_f64().unwrap() - 6.0).abs() < 1e-9);
        assert!(consumption[0]["credits_dod_pct"].is_null());
        assert!(consumption[1]["credits_dod_pct"].as_f64().unwrap().abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rerun_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).unwrap();
        let p = pipeline(&pool, workload(3));
        let range = BucketRange::new(d(1), d(3)).unwrap();

        p.recompute(range).await.unwrap();
        let first = rows(&pool, &schema::USER_BEHAVIOR_PROFILE, 1, 3);
        p.recompute(range).await.unwrap();
        let second = rows(&pool, &schema::USER_BEHAVIOR_PROFILE, 1, 3);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_incremental_run_matches_full_run() {
        let dir = tempfile::tempdir().unwrap();
        let full = open_pool(&dir.path().join("full.db")).unwrap();
        let stepped = open_pool(&dir.path().join("stepped.db")).unwrap();

        pipeline(&full, workload(6))
            .recompute(BucketRange::new(d(1), d(6)).unwrap())
            .await
            .unwrap();

        let p = pipeline(&stepped, workload(6));
        p.recompute(BucketRange::new(d(1), d(4)).unwrap()).await.unwrap();
        p.recompute(BucketRange::single(d(5))).await.unwrap();
        p.recompute(BucketRange::single(d(6))).await.unwrap();

        let a = rows(&full, &schema::USER_BEHAVIOR_PROFILE, 6, 6);
        let b = rows(&stepped, &schema::USER_BEHAVIOR_PROFILE, 6, 6);
        assert!(!a.is_empty());
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x["baseline_count"], y["baseline_count"]);
            let (zx, zy) = (x["z_score"].as_f64().unwrap(), y["z_score"].as_f64().unwrap());
            assert!((zx - zy).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_failed_bucket_halts_and_keeps_previous_rows() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).unwrap();
        let range = BucketRange::new(d(1), d(3)).unwrap();
        pipeline(&pool, workload(3)).recompute(range).await.unwrap();
        let before = rows(&pool, &schema::DAILY_CONSUMPTION, 2, 3);

        let mut events = workload(3);
        events.push(query(2, 11, "ALICE", -5.0));
        let summary = pipeline(&pool, events).recompute(range).await.unwrap();

        let statuses: Vec<_> = summary.buckets.iter().map(|b| b.status).collect();
        assert_eq!(
            statuses,
            vec![RunStatus::Success, RunStatus::Failed, RunStatus::Skipped]
        );
        assert_eq!(summary.first_failure().map(|b| b.bucket), Some(d(2)));
        assert_eq!(rows(&pool, &schema::DAILY_CONSUMPTION, 2, 3), before);

        let ledger = history::recent(&pool.get().unwrap(), 3).unwrap();
        assert!(ledger.iter().all(|e| e.run_id == summary.run_id));
    }

    #[test]
    fn test_idle_hour_guard_counted() {
        let events = vec![metering(1, 3, 5.0)];
        let day = aggregate_day(&events, &[], &Settings::default()).unwrap();
        assert!(day.cost.rows.is_empty());
        assert_eq!(day.cost.unallocated_credits, 5.0);
        assert!(!day.cost.guards.is_empty());
    }

    #[test]
    fn test_missing_dimension_counted_as_excluded() {
        let mut event = query(1, 9, "ALICE", 1.0);
        event.keys.role = None;
        let day = aggregate_day(&[event], &[], &Settings::default()).unwrap();
        assert!(day.behavior.is_empty());
        assert!(day.excluded > 0);
    }
}
