//! Usage events from the append-only event log.
//!
//! The log itself belongs to the source system. This module only defines the
//! event shape and the [`EventSource`] seam the pipeline reads through.

pub mod ingest;

use crate::entity::EntityKey;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Statement types that count as write activity.
const WRITE_QUERY_TYPES: &[&str] = &[
    "INSERT",
    "UPDATE",
    "DELETE",
    "MERGE",
    "COPY",
    "CREATE_TABLE_AS_SELECT",
    "TRUNCATE_TABLE",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Query,
    Login,
    /// Warehouse metering interval carrying the shared credit totals.
    Metering,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Query => "query",
            EventKind::Login => "login",
            EventKind::Metering => "metering",
        }
    }
}

/// Per-event measurements and attributes. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMetrics {
    pub query_type: Option<String>,
    /// Milliseconds.
    pub execution_time: Option<f64>,
    pub bytes_scanned: Option<f64>,
    pub bytes_written: Option<f64>,
    pub rows_inserted: Option<f64>,
    pub rows_updated: Option<f64>,
    pub rows_deleted: Option<f64>,
    pub credits_compute: Option<f64>,
    pub credits_cloud_services: Option<f64>,
    pub auth_first_factor: Option<String>,
    pub auth_second_factor: Option<String>,
    #[serde(alias = "success_flag")]
    pub success: Option<bool>,
    pub error_code: Option<String>,
    pub client_ip: Option<String>,
}

/// An immutable usage event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "event_type", default = "default_kind")]
    pub kind: EventKind,
    #[serde(flatten)]
    pub keys: EntityKey,
    #[serde(flatten)]
    pub metrics: EventMetrics,
}

fn default_kind() -> EventKind {
    EventKind::Query
}

impl Event {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn hour(&self) -> u8 {
        self.timestamp.hour() as u8
    }

    pub fn is_write(&self) -> bool {
        self.kind == EventKind::Query
            && self
                .metrics
                .query_type
                .as_deref()
                .map(|t| WRITE_QUERY_TYPES.contains(&t.to_ascii_uppercase().as_str()))
                .unwrap_or(false)
    }

    /// A failed query or login: explicit failure flag or any error code.
    pub fn failed(&self) -> bool {
        self.metrics.success == Some(false)
            || self
                .metrics
                .error_code
                .as_deref()
                .map(|c| !c.trim().is_empty())
                .unwrap_or(false)
    }

    pub fn has_second_factor(&self) -> bool {
        self.metrics
            .auth_second_factor
            .as_deref()
            .map(|f| !f.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn is_password_first_factor(&self) -> bool {
        self.metrics
            .auth_first_factor
            .as_deref()
            .map(|f| f.eq_ignore_ascii_case("PASSWORD"))
            .unwrap_or(false)
    }
}

/// Read access to the event log, one closed day at a time.
///
/// Implementations must return events ordered by timestamp and then by log
/// position, so repeated reads of the same day fold in the same order.
pub trait EventSource: Send + Sync {
    fn events_for_day(&self, date: NaiveDate) -> Result<Vec<Event>>;
}

/// An event log held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSource {
    events: Vec<Event>,
}

impl MemoryEventSource {
    pub fn new(mut events: Vec<Event>) -> Self {
        // Stable sort keeps log order for equal timestamps.
        events.sort_by_key(|e| e.timestamp);
        Self { events }
    }
}

impl EventSource for MemoryEventSource {
    fn events_for_day(&self, date: NaiveDate) -> Result<Vec<Event>> {
        Ok(self
            .events
            .iter()
            .filter(|e| e.date() == date)
            .cloned()
            .collect())
    }
}
