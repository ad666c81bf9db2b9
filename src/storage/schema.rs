//! Database schema and migrations.
//!
//! Materialization tables are described by static [`View`]s: the same
//! descriptor creates the table, registers its version, and drives inserts
//! and reads, so a table can never drift from the rows written into it.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

pub const SCHEMA_VERSION: i64 = 1;

/// A derived table keyed by day.
#[derive(Debug)]
pub struct View {
    pub name: &'static str,
    pub version: u32,
    /// `(column, SQL type)`; the first column is always `date`.
    pub columns: &'static [(&'static str, &'static str)],
    /// Readable by external consumers.
    pub public: bool,
}

impl View {
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|(name, _)| *name)
    }

    fn create_sql(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|(name, ty)| format!("\"{name}\" {ty}"))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {name} ({cols});
             CREATE INDEX IF NOT EXISTS idx_{name}_date ON {name}(date);",
            name = self.name,
            cols = cols.join(", ")
        )
    }

    pub fn insert_sql(&self) -> String {
        let names: Vec<String> = self.column_names().map(|c| format!("\"{c}\"")).collect();
        let params: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.name,
            names.join(", "),
            params.join(", ")
        )
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Daily metric records of every tracked grouping; history for trends.
pub static DAILY_METRICS: View = View {
    name: "daily_metrics",
    version: 1,
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("grouping", "TEXT NOT NULL"),
        ("entity", "TEXT NOT NULL"),
        ("metrics_json", "TEXT NOT NULL"),
    ],
    public: false,
};

/// Welford state of each baselined (entity, metric) after each applied day.
pub static BASELINE_SNAPSHOTS: View = View {
    name: "baseline_snapshots",
    version: 1,
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("grouping", "TEXT NOT NULL"),
        ("entity", "TEXT NOT NULL"),
        ("metric", "TEXT NOT NULL"),
        ("count", "INTEGER NOT NULL"),
        ("mean", "REAL NOT NULL"),
        ("m2", "REAL NOT NULL"),
    ],
    public: false,
};

// ---------------------------------------------------------------------------
// Materializations
// ---------------------------------------------------------------------------

pub static DAILY_WRITE_ACTIVITY: View = View {
    name: "daily_write_activity",
    version: 1,
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("role", "TEXT NOT NULL"),
        ("database", "TEXT NOT NULL"),
        ("write_queries", "INTEGER NOT NULL"),
        ("rows_inserted", "REAL NOT NULL"),
        ("rows_updated", "REAL NOT NULL"),
        ("rows_deleted", "REAL NOT NULL"),
        ("bytes_written", "REAL NOT NULL"),
        ("rows_inserted_growth_pct", "REAL NOT NULL"),
    ],
    public: true,
};

pub static ROLE_WRITE_SUMMARY: View = View {
    name: "role_write_summary",
    version: 1,
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("role", "TEXT NOT NULL"),
        ("window_start", "TEXT NOT NULL"),
        ("databases", "INTEGER NOT NULL"),
        ("write_queries", "INTEGER NOT NULL"),
        ("rows_inserted", "REAL NOT NULL"),
        ("rows_updated", "REAL NOT NULL"),
        ("rows_deleted", "REAL NOT NULL"),
        ("bytes_written", "REAL NOT NULL"),
        ("rank", "INTEGER NOT NULL"),
    ],
    public: true,
};

pub static DAILY_CONSUMPTION: View = View {
    name: "daily_consumption",
    version: 1,
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("role", "TEXT NOT NULL"),
        ("total_queries", "INTEGER NOT NULL"),
        ("gb_scanned", "REAL NOT NULL"),
        ("active_users", "INTEGER NOT NULL"),
        ("databases_accessed", "INTEGER NOT NULL"),
        ("avg_execution_time", "REAL NOT NULL"),
        ("credits", "REAL NOT NULL"),
        ("credits_avg7", "REAL NOT NULL"),
        ("credits_dod_pct", "REAL"),
    ],
    public: true,
};

pub static COST_ATTRIBUTION: View = View {
    name: "cost_attribution",
    version: 1,
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("hour", "INTEGER NOT NULL"),
        ("warehouse", "TEXT NOT NULL"),
        ("user", "TEXT NOT NULL"),
        ("role", "TEXT"),
        ("database", "TEXT"),
        ("schema", "TEXT"),
        ("query_count", "INTEGER NOT NULL"),
        ("execution_time", "REAL NOT NULL"),
        ("compute_credits", "REAL NOT NULL"),
        ("cloud_services_credits", "REAL NOT NULL"),
        ("total_credits", "REAL NOT NULL"),
        ("cost", "REAL NOT NULL"),
    ],
    public: true,
};

pub static USER_BEHAVIOR_PROFILE: View = View {
    name: "user_behavior_profile",
    version: 1,
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("user", "TEXT NOT NULL"),
        ("role", "TEXT NOT NULL"),
        ("metric", "TEXT NOT NULL"),
        ("value", "REAL NOT NULL"),
        ("lag1", "REAL"),
        ("lag7", "REAL"),
        ("avg7", "REAL NOT NULL"),
        ("avg30", "REAL NOT NULL"),
        ("baseline_count", "INTEGER NOT NULL"),
        ("baseline_mean", "REAL NOT NULL"),
        ("baseline_stddev", "REAL NOT NULL"),
        ("baseline_p95", "REAL NOT NULL"),
        ("z_score", "REAL NOT NULL"),
        ("classification", "TEXT NOT NULL"),
        ("recommendation_tier", "TEXT NOT NULL"),
        ("deviation_from_mean_pct", "REAL"),
        ("deviation_from_avg7_pct", "REAL"),
        ("off_hours_queries", "INTEGER NOT NULL"),
        ("guard", "TEXT"),
    ],
    public: true,
};

/// One row per user and activity hour.
pub static BEHAVIORAL_PATTERNS: View = View {
    name: "behavioral_patterns",
    version: 1,
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("user", "TEXT NOT NULL"),
        ("role", "TEXT NOT NULL"),
        ("activity_hour", "INTEGER NOT NULL"),
        ("query_count", "INTEGER NOT NULL"),
        ("error_count", "INTEGER NOT NULL"),
        ("execution_time", "REAL NOT NULL"),
        ("time_classification", "TEXT NOT NULL"),
        ("behavior_classification", "TEXT NOT NULL"),
        ("pattern_type", "TEXT NOT NULL"),
        ("risk_level", "TEXT NOT NULL"),
        ("recommended_action", "TEXT NOT NULL"),
    ],
    public: true,
};

pub static ANOMALY_ATTRIBUTION: View = View {
    name: "anomaly_attribution",
    version: 2,
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("metric", "TEXT NOT NULL"),
        ("user", "TEXT NOT NULL"),
        ("role", "TEXT NOT NULL"),
        ("warehouse", "TEXT"),
        ("value", "REAL NOT NULL"),
        ("contribution_pct", "REAL NOT NULL"),
        ("contribution_level", "TEXT NOT NULL"),
        ("error_count", "INTEGER NOT NULL"),
        ("query_count", "INTEGER NOT NULL"),
        ("attributed_excess", "REAL NOT NULL"),
        ("risk_level", "TEXT NOT NULL"),
        ("behavior_pattern", "TEXT NOT NULL"),
        ("recommended_action", "TEXT NOT NULL"),
    ],
    public: true,
};

pub static USER_SECURITY: View = View {
    name: "user_security",
    version: 1,
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("user", "TEXT NOT NULL"),
        ("logins", "INTEGER NOT NULL"),
        ("failed_logins", "INTEGER NOT NULL"),
        ("mfa_logins", "INTEGER NOT NULL"),
        ("password_only_logins", "INTEGER NOT NULL"),
        ("mfa_status", "TEXT NOT NULL"),
        ("risk_level", "TEXT NOT NULL"),
    ],
    public: true,
};

pub static ROLE_SECURITY: View = View {
    name: "role_security",
    version: 1,
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("role", "TEXT NOT NULL"),
        ("active_users", "INTEGER NOT NULL"),
        ("mfa_compliant_users", "INTEGER NOT NULL"),
        ("compliance_pct", "REAL NOT NULL"),
        ("failed_logins", "INTEGER NOT NULL"),
        ("compliance_status", "TEXT NOT NULL"),
    ],
    public: true,
};

pub static RECOMMENDATIONS: View = View {
    name: "recommendations",
    version: 1,
    columns: &[
        ("date", "TEXT NOT NULL"),
        ("user", "TEXT NOT NULL"),
        ("kind", "TEXT NOT NULL"),
        ("priority", "TEXT NOT NULL"),
        ("issue", "TEXT NOT NULL"),
        ("actions", "TEXT NOT NULL"),
    ],
    public: true,
};

/// Every day-keyed table, in commit order.
pub static VIEWS: &[&View] = &[
    &DAILY_METRICS,
    &BASELINE_SNAPSHOTS,
    &DAILY_WRITE_ACTIVITY,
    &ROLE_WRITE_SUMMARY,
    &DAILY_CONSUMPTION,
    &COST_ATTRIBUTION,
    &USER_BEHAVIOR_PROFILE,
    &BEHAVIORAL_PATTERNS,
    &ANOMALY_ATTRIBUTION,
    &USER_SECURITY,
    &ROLE_SECURITY,
    &RECOMMENDATIONS,
];

/// Look up a consumer-readable materialization by name.
pub fn public_view(name: &str) -> Option<&'static View> {
    VIEWS.iter().copied().find(|v| v.public && v.name == name)
}

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY,
            ts TEXT NOT NULL,
            day TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_events_day ON events(day, ts, id);

        CREATE TABLE IF NOT EXISTS forecast_bounds (
            date TEXT NOT NULL,
            metric TEXT NOT NULL,
            actual REAL NOT NULL,
            lower_bound REAL NOT NULL,
            upper_bound REAL NOT NULL,
            is_anomaly INTEGER NOT NULL,
            imported_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (date, metric)
        );

        CREATE TABLE IF NOT EXISTS materializations (
            name TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            columns_json TEXT NOT NULL,
            registered_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS bucket_runs (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL,
            bucket TEXT NOT NULL,
            status TEXT NOT NULL,
            detail TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_bucket_runs_bucket ON bucket_runs(bucket);
        CREATE INDEX IF NOT EXISTS idx_bucket_runs_run ON bucket_runs(run_id);",
    )?;

    for view in VIEWS {
        // Derived rows are recomputable: a changed layout is rebuilt empty.
        if view.public {
            let registered: Option<u32> = conn
                .query_row(
                    "SELECT version FROM materializations WHERE name = ?1",
                    [view.name],
                    |row| row.get(0),
                )
                .optional()?;
            if registered.is_some_and(|v| v != view.version) {
                info!(
                    view = view.name,
                    from = registered,
                    to = view.version,
                    "materialization layout changed; table rebuilt, recompute to refill"
                );
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", view.name))?;
            }
        }
        conn.execute_batch(&view.create_sql())?;
        if view.public {
            let columns: Vec<&str> = view.column_names().collect();
            conn.execute(
                "INSERT INTO materializations (name, version, columns_json) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET version = excluded.version,
                     columns_json = excluded.columns_json",
                rusqlite::params![view.name, view.version, serde_json::to_string(&columns)?],
            )?;
        }
    }

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
