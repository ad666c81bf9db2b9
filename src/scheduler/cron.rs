use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use crate::config::ScheduleConfig;
use crate::pipeline::BucketRange;

/// When recomputes fire and which closed days each one covers.
#[derive(Debug, Clone)]
pub struct Scheduler {
    schedule: CronSchedule,
    lookback_days: u32,
}

/// One upcoming scheduled run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRun {
    pub at: DateTime<Utc>,
    pub range: BucketRange,
}

impl Scheduler {
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        let schedule = CronSchedule::from_str(&config.cron)
            .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", config.cron, e))?;
        Ok(Self {
            schedule,
            lookback_days: config.lookback_days.max(1),
        })
    }

    /// First fire time strictly after `now`.
    pub fn next_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }

    /// Day buckets a run firing at `at` recomputes.
    pub fn due_range(&self, at: DateTime<Utc>) -> BucketRange {
        BucketRange::trailing(at.date_naive(), self.lookback_days)
    }

    /// Runs that fire within `hours` of `now`.
    /// This is strictly a dry-run preview, nothing is executed.
    pub fn preview(&self, now: DateTime<Utc>, hours: u64) -> Vec<PlannedRun> {
        let end = now + Duration::hours(hours as i64);
        self.schedule
            .after(&now)
            .take_while(|at| *at <= end)
            .map(|at| PlannedRun {
                at,
                range: self.due_range(at),
            })
            .collect()
    }
}
