//! SQLite-backed event log and upstream forecast bounds.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::attribution::contribution::ForecastBound;
use crate::event::{Event, EventSource};
use crate::metrics::Metric;
use crate::storage::Pool;

/// Fixed-width timestamp so text order equals time order.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Append events to the log in one transaction. Returns the number written.
pub fn append_events(pool: &Pool, events: &[Event]) -> Result<usize> {
    let mut conn = pool.get().context("Failed to get DB connection")?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO events (ts, day, kind, payload_json) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for event in events {
            stmt.execute(params![
                event.timestamp.format(TS_FORMAT).to_string(),
                event.date().to_string(),
                event.kind.as_str(),
                serde_json::to_string(event)?,
            ])?;
        }
    }
    tx.commit()?;
    info!(count = events.len(), "events appended");
    Ok(events.len())
}

/// First and last day present in the log.
pub fn event_day_range(pool: &Pool) -> Result<Option<(NaiveDate, NaiveDate)>> {
    let conn = pool.get()?;
    let row: Option<(Option<String>, Option<String>)> = conn
        .query_row("SELECT MIN(day), MAX(day) FROM events", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .optional()?;
    match row {
        Some((Some(first), Some(last))) => Ok(Some((parse_date(&first)?, parse_date(&last)?))),
        _ => Ok(None),
    }
}

/// Reads one day of the log per call, each on its own pooled connection.
#[derive(Clone)]
pub struct SqliteEventSource {
    pool: Pool,
}

impl SqliteEventSource {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl EventSource for SqliteEventSource {
    fn events_for_day(&self, date: NaiveDate) -> Result<Vec<Event>> {
        let conn = self.pool.get().context("Failed to get DB connection")?;
        let mut stmt =
            conn.prepare("SELECT id, payload_json FROM events WHERE day = ?1 ORDER BY ts, id")?;
        let rows = stmt.query_map([date.to_string()], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, payload) = row?;
            let event: Event = serde_json::from_str(&payload)
                .with_context(|| format!("corrupt event payload (id {id})"))?;
            events.push(event);
        }
        debug!(bucket = %date, count = events.len(), "events loaded");
        Ok(events)
    }
}

/// Insert or replace forecast bounds keyed by (date, metric).
pub fn import_forecast_bounds(pool: &Pool, bounds: &[ForecastBound]) -> Result<usize> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO forecast_bounds
                 (date, metric, actual, lower_bound, upper_bound, is_anomaly)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for b in bounds {
            stmt.execute(params![
                b.date.to_string(),
                b.metric.as_str(),
                b.actual,
                b.lower_bound,
                b.upper_bound,
                b.is_anomaly,
            ])?;
        }
    }
    tx.commit()?;
    info!(count = bounds.len(), "forecast bounds imported");
    Ok(bounds.len())
}

pub fn forecast_bounds_for_day(conn: &Connection, date: NaiveDate) -> Result<Vec<ForecastBound>> {
    let mut stmt = conn.prepare(
        "SELECT metric, actual, lower_bound, upper_bound, is_anomaly
         FROM forecast_bounds WHERE date = ?1 ORDER BY metric",
    )?;
    let rows = stmt.query_map([date.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, bool>(4)?,
        ))
    })?;

    let mut bounds = Vec::new();
    for row in rows {
        let (metric, actual, lower_bound, upper_bound, is_anomaly) = row?;
        let metric: Metric = metric.parse().map_err(anyhow::Error::msg)?;
        bounds.push(ForecastBound {
            date,
            metric,
            actual,
            lower_bound,
            upper_bound,
            is_anomaly,
        });
    }
    Ok(bounds)
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityKey;
    use crate::event::{EventKind, EventMetrics};
    use crate::storage::open_pool;

    fn event(ts: &str, user: &str) -> Event {
        Event {
            timestamp: ts.parse().unwrap(),
            kind: EventKind::Query,
            keys: EntityKey {
                user: Some(user.into()),
                ..Default::default()
            },
            metrics: EventMetrics {
                execution_time: Some(1.0),
                ..Default::default()
            },
        }
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, day).unwrap()
    }

    #[test]
    fn test_events_read_back_in_log_order() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).unwrap();
        append_events(
            &pool,
            &[
                event("2025-08-18T10:00:00Z", "B"),
                event("2025-08-18T09:00:00.5Z", "A"),
                // Same instant as the first: log position breaks the tie.
                event("2025-08-18T10:00:00Z", "C"),
                event("2025-08-19T00:00:00Z", "D"),
            ],
        )
        .unwrap();

        let source = SqliteEventSource::new(pool.clone());
        let day = source.events_for_day(d(18)).unwrap();
        let users: Vec<_> = day.iter().map(|e| e.keys.user.clone().unwrap()).collect();
        assert_eq!(users, vec!["A", "B", "C"]);
        assert_eq!(event_day_range(&pool).unwrap(), Some((d(18), d(19))));
    }

    #[test]
    fn test_empty_log_has_no_range() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).unwrap();
        assert_eq!(event_day_range(&pool).unwrap(), None);
    }

    #[test]
    fn test_forecast_bounds_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.db")).unwrap();
        let mut bound = ForecastBound {
            date: d(18),
            metric: Metric::ExecutionTime,
            actual: 100.0,
            lower_bound: 10.0,
            upper_bound: 60.0,
            is_anomaly: true,
        };
        import_forecast_bounds(&pool, &[bound.clone()]).unwrap();
        bound.actual = 120.0;
        import_forecast_bounds(&pool, &[bound.clone()]).unwrap();

        let conn = pool.get().unwrap();
        let loaded = forecast_bounds_for_day(&conn, d(18)).unwrap();
        assert_eq!(loaded, vec![bound]);
        assert!(forecast_bounds_for_day(&conn, d(19)).unwrap().is_empty());
    }
}
