//! Execution history of bucket recomputes (the `bucket_runs` ledger).

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Outcome of one bucket within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Success,
    /// Not committed; the bucket's previous derived rows are still in place.
    Failed,
    /// Not attempted because an earlier bucket of the run failed.
    Skipped,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "skipped" => Ok(RunStatus::Skipped),
            other => anyhow::bail!("unknown run status '{other}'"),
        }
    }
}

/// A record of one bucket's recompute.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub run_id: String,
    pub bucket: NaiveDate,
    pub status: RunStatus,
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub fn record(conn: &Connection, entry: &HistoryEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO bucket_runs (run_id, bucket, status, detail, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.run_id,
            entry.bucket.to_string(),
            entry.status.to_string(),
            entry.detail,
            entry.started_at.to_rfc3339(),
            entry.finished_at.to_rfc3339(),
        ],
    )
    .context("Failed to record bucket run")?;
    Ok(())
}

/// Most recent entries first.
pub fn recent(conn: &Connection, limit: usize) -> Result<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, bucket, status, detail, started_at, finished_at
         FROM bucket_runs ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (run_id, bucket, status, detail, started_at, finished_at) = row?;
        entries.push(HistoryEntry {
            run_id,
            bucket: crate::storage::events::parse_date(&bucket)?,
            status: status.parse()?,
            detail,
            started_at: DateTime::parse_from_rfc3339(&started_at)?.with_timezone(&Utc),
            finished_at: DateTime::parse_from_rfc3339(&finished_at)?.with_timezone(&Utc),
        });
    }
    Ok(entries)
}
