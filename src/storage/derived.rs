//! Derived record store: atomic per-bucket commits and read access.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::analysis::aggregator::MetricRecord;
use crate::analysis::stats::{BaselineRecord, RunningStats};
use crate::analysis::Bucket;
use crate::entity::{EntityKey, Grouping};
use crate::metrics::{Metric, UsageMetrics};
use crate::storage::events::parse_date;
use crate::storage::schema::{self, View};

/// A row type stored in one [`View`].
pub trait Materialized {
    fn view() -> &'static View;

    /// Column values in the order of `view().columns`.
    fn values(&self) -> Result<Vec<Value>>;
}

/// Rows bound for one table.
#[derive(Debug, Clone)]
pub struct TableRows {
    pub view: &'static View,
    pub rows: Vec<Vec<Value>>,
}

impl TableRows {
    pub fn of<T: Materialized>(rows: &[T]) -> Result<Self> {
        let view = T::view();
        let rows = rows
            .iter()
            .map(Materialized::values)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("failed to encode a {} row", view.name))?;
        Ok(Self { view, rows })
    }
}

pub(crate) fn int(v: u64) -> Value {
    Value::Integer(v as i64)
}

pub(crate) fn text(v: impl Into<String>) -> Value {
    Value::Text(v.into())
}

pub(crate) fn opt_text(v: Option<&str>) -> Value {
    v.map(text).unwrap_or(Value::Null)
}

pub(crate) fn opt_real(v: Option<f64>) -> Value {
    v.map(Value::Real).unwrap_or(Value::Null)
}

/// A daily record as tracked history of a grouping.
pub struct GroupedRecord<'a> {
    pub grouping: &'static Grouping,
    pub record: &'a MetricRecord,
}

impl Materialized for GroupedRecord<'_> {
    fn view() -> &'static View {
        &schema::DAILY_METRICS
    }

    fn values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            text(self.record.bucket.date().to_string()),
            text(self.grouping.name),
            text(self.record.entity.to_storage_key()?),
            text(serde_json::to_string(&self.record.metrics)?),
        ])
    }
}

/// Baseline state after its last applied day.
pub struct Snapshot<'a> {
    pub grouping: &'static Grouping,
    pub record: &'a BaselineRecord,
}

impl Materialized for Snapshot<'_> {
    fn view() -> &'static View {
        &schema::BASELINE_SNAPSHOTS
    }

    fn values(&self) -> Result<Vec<Value>> {
        let r = self.record;
        Ok(vec![
            opt_text(r.last_date.map(|d| d.to_string()).as_deref()),
            text(self.grouping.name),
            text(r.entity.to_storage_key()?),
            text(r.metric.as_str()),
            int(r.stats.count()),
            Value::Real(r.stats.mean()),
            Value::Real(r.stats.m2()),
        ])
    }
}

/// Replace everything stored for `date` with `tables`, in one transaction.
///
/// Every day-keyed table is cleared for the date, including tables with no
/// rows this time, so a re-run overwrites and never appends.
pub fn commit_bucket(conn: &mut Connection, date: NaiveDate, tables: &[TableRows]) -> Result<usize> {
    let day = date.to_string();
    let tx = conn.transaction()?;
    for view in schema::VIEWS {
        tx.execute(&format!("DELETE FROM {} WHERE date = ?1", view.name), [&day])?;
    }

    let mut written = 0;
    for table in tables {
        let mut stmt = tx.prepare(&table.view.insert_sql())?;
        for row in &table.rows {
            stmt.execute(params_from_iter(row.iter()))
                .with_context(|| format!("insert into {} failed", table.view.name))?;
            written += 1;
        }
    }
    tx.commit()?;
    debug!(bucket = %date, rows = written, "bucket committed");
    Ok(written)
}

/// Daily history of `grouping` strictly before `before`, per entity in date
/// order. `per_entity` keeps only each entity's most recent records.
pub fn load_history(
    conn: &Connection,
    grouping: &Grouping,
    before: NaiveDate,
    per_entity: Option<usize>,
) -> Result<BTreeMap<EntityKey, Vec<MetricRecord>>> {
    let mut stmt = conn.prepare(
        "SELECT date, entity, metrics_json FROM (
             SELECT date, entity, metrics_json,
                    ROW_NUMBER() OVER (PARTITION BY entity ORDER BY date DESC) AS rn
             FROM daily_metrics WHERE \"grouping\" = ?1 AND date < ?2
         )
         WHERE ?3 IS NULL OR rn <= ?3
         ORDER BY entity, date",
    )?;
    let limit = per_entity.map(|n| n as i64);
    let rows = stmt.query_map(params![grouping.name, before.to_string(), limit], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut history: BTreeMap<EntityKey, Vec<MetricRecord>> = BTreeMap::new();
    for row in rows {
        let (date, entity, metrics) = row?;
        let entity = EntityKey::from_storage_key(&entity)
            .with_context(|| format!("corrupt entity key '{entity}'"))?;
        let metrics: UsageMetrics =
            serde_json::from_str(&metrics).context("corrupt daily metrics")?;
        history.entry(entity.clone()).or_default().push(MetricRecord {
            bucket: Bucket::Day(parse_date(&date)?),
            entity,
            metrics,
        });
    }
    Ok(history)
}

/// Most recent baseline snapshot of each (entity, metric) strictly before
/// `before`.
pub fn latest_snapshots(
    conn: &Connection,
    grouping: &Grouping,
    before: NaiveDate,
) -> Result<Vec<BaselineRecord>> {
    let mut stmt = conn.prepare(
        "SELECT s.entity, s.metric, s.date, s.count, s.mean, s.m2
         FROM baseline_snapshots s
         JOIN (
             SELECT entity, metric, MAX(date) AS last
             FROM baseline_snapshots WHERE \"grouping\" = ?1 AND date < ?2
             GROUP BY entity, metric
         ) m ON s.entity = m.entity AND s.metric = m.metric AND s.date = m.last
         WHERE s.\"grouping\" = ?1
         ORDER BY s.entity, s.metric",
    )?;
    let rows = stmt.query_map(params![grouping.name, before.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, f64>(4)?,
            row.get::<_, f64>(5)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (entity, metric, date, count, mean, m2) = row?;
        let metric: Metric = metric.parse().map_err(anyhow::Error::msg)?;
        out.push(BaselineRecord {
            entity: EntityKey::from_storage_key(&entity)
                .with_context(|| format!("corrupt entity key '{entity}'"))?,
            metric,
            stats: RunningStats::from_parts(count.max(0) as u64, mean, m2),
            last_date: Some(parse_date(&date)?),
        });
    }
    Ok(out)
}

fn json_value(v: ValueRef<'_>) -> serde_json::Value {
    match v {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => json!(String::from_utf8_lossy(t)),
        ValueRef::Blob(_) => serde_json::Value::Null,
    }
}

/// Rows of a materialization with `from <= date <= to`, as JSON objects.
pub fn read_view(
    conn: &Connection,
    view: &View,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<serde_json::Value>> {
    let names: Vec<&str> = view.column_names().collect();
    let quoted: Vec<String> = names.iter().map(|c| format!("\"{c}\"")).collect();
    let sql = format!(
        "SELECT {} FROM {} WHERE date BETWEEN ?1 AND ?2 ORDER BY date, rowid",
        quoted.join(", "),
        view.name
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([from.to_string(), to.to_string()])?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut obj = serde_json::Map::new();
        for (i, name) in names.iter().enumerate() {
            obj.insert((*name).to_string(), json_value(row.get_ref(i)?));
        }
        out.push(serde_json::Value::Object(obj));
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterializationInfo {
    pub name: String,
    pub version: u32,
    pub columns: Vec<String>,
}

pub fn list_materializations(conn: &Connection) -> Result<Vec<MaterializationInfo>> {
    let mut stmt =
        conn.prepare("SELECT name, version, columns_json FROM materializations ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u32>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (name, version, columns) = row?;
        out.push(MaterializationInfo {
            name,
            version,
            columns: serde_json::from_str(&columns).context("corrupt column list")?,
        });
    }
    Ok(out)
}
