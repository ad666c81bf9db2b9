//! TOML configuration for usagewatch.
//!
//! Layered: an explicit `--config` path, then the `USAGEWATCH_CONFIG`
//! environment variable, then `/etc/usagewatch/usagewatch.toml`, then the
//! compiled-in defaults. Every section may be omitted.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analysis::BusinessHours;
use crate::metrics::Metric;

pub const CONFIG_ENV: &str = "USAGEWATCH_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/usagewatch/usagewatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// An explicit path must load. Without one, fall back through the
    /// environment variable, the system location, and the defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "USAGEWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        cron::Schedule::from_str(&self.schedule.cron)
            .map_err(|e| anyhow::anyhow!("invalid cron expression '{}': {}", self.schedule.cron, e))?;
        if self.schedule.lookback_days == 0 {
            bail!("schedule.lookback_days must be at least 1");
        }
        let hours = &self.analysis.business_hours;
        if hours.start >= hours.end || hours.end > 24 {
            bail!(
                "analysis.business_hours must satisfy start < end <= 24 (got {}..{})",
                hours.start,
                hours.end
            );
        }
        if self.analysis.workers == 0 {
            bail!("analysis.workers must be at least 1");
        }
        if !(self.cost.credit_price.is_finite() && self.cost.credit_price >= 0.0) {
            bail!("cost.credit_price must be a non-negative number");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding the event log and every materialization.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/usagewatch.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// 6-field cron expression (seconds first), evaluated in UTC.
    pub cron: String,
    /// Closed days recomputed on each scheduled run, ending yesterday.
    pub lookback_days: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 15 2 * * *".to_string(),
            lookback_days: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Metrics baselined and scored per user and role.
    pub profile_metrics: Vec<Metric>,
    /// Queries outside these UTC hours count as off-hours.
    pub business_hours: BusinessHours,
    /// Parallel blocking workers used by a recompute.
    pub workers: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            profile_metrics: vec![Metric::QueryCount, Metric::ExecutionTime, Metric::BytesScanned],
            business_hours: BusinessHours::default(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

// ---------------------------------------------------------------------------
// Cost
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Currency per credit.
    pub credit_price: f64,
    /// Weight used to split compute credits within a warehouse hour.
    pub compute_weight: Metric,
    /// Weight used to split cloud-service credits within a warehouse hour.
    pub cloud_services_weight: Metric,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            credit_price: 2.0,
            compute_weight: Metric::ExecutionTime,
            cloud_services_weight: Metric::QueryCount,
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8088".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
