//! Contribution of entities to a flagged anomalous day, and composite risk.

use crate::analysis::aggregator::MetricRecord;
use crate::analysis::rules::{Rule, RuleList};
use crate::attribution::allocate;
use crate::detect::pattern::{ActivitySignals, PatternType, PATTERN_RULES};
use crate::entity::EntityKey;
use crate::error::Guard;
use crate::metrics::Metric;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const HIGH_ERROR_COUNT: u64 = 10;
pub const MODERATE_ERROR_COUNT: u64 = 3;
pub const HIGH_QUERY_VOLUME: u64 = 1000;
pub const MAJOR_CONTRIBUTION_PCT: f64 = 30.0;
pub const DOMINANT_CONTRIBUTION_PCT: f64 = 50.0;
pub const MODERATE_CONTRIBUTION_PCT: f64 = 10.0;
pub const MINOR_CONTRIBUTION_PCT: f64 = 1.0;

/// Bounds produced by the upstream forecasting process for one day's metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastBound {
    pub date: NaiveDate,
    pub metric: Metric,
    pub actual: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub is_anomaly: bool,
}

impl ForecastBound {
    /// Amount above the upper bound, `0` when within bounds.
    pub fn excess(&self) -> f64 {
        (self.actual - self.upper_bound).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContributionLevel {
    Major,
    Moderate,
    Minor,
    Negligible,
}

impl ContributionLevel {
    pub fn label(self) -> &'static str {
        match self {
            ContributionLevel::Major => "Major",
            ContributionLevel::Moderate => "Moderate",
            ContributionLevel::Minor => "Minor",
            ContributionLevel::Negligible => "Negligible",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn label(self) -> &'static str {
        match self {
            RiskLevel::Critical => "Critical Risk",
            RiskLevel::High => "High Risk",
            RiskLevel::Medium => "Medium Risk",
            RiskLevel::Low => "Low Risk",
        }
    }
}

pub static CONTRIBUTION_RULES: RuleList<f64, ContributionLevel> = RuleList {
    rules: &[
        Rule { label: ContributionLevel::Major, when: |p: &f64| *p > MAJOR_CONTRIBUTION_PCT },
        Rule { label: ContributionLevel::Moderate, when: |p: &f64| *p > MODERATE_CONTRIBUTION_PCT },
        Rule { label: ContributionLevel::Minor, when: |p: &f64| *p > MINOR_CONTRIBUTION_PCT },
    ],
    otherwise: ContributionLevel::Negligible,
};

/// Inputs of the composite risk table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskSignals {
    pub contribution_pct: f64,
    pub error_count: u64,
    pub query_count: u64,
}

impl RiskSignals {
    fn high_contribution(&self) -> bool {
        self.contribution_pct > MAJOR_CONTRIBUTION_PCT
    }

    fn high_errors(&self) -> bool {
        self.error_count > HIGH_ERROR_COUNT
    }
}

/// Evaluated top to bottom; the first match decides.
pub static RISK_RULES: RuleList<RiskSignals, RiskLevel> = RuleList {
    rules: &[
        Rule {
            label: RiskLevel::Critical,
            when: |s: &RiskSignals| s.high_contribution() && s.high_errors(),
        },
        Rule { label: RiskLevel::High, when: |s: &RiskSignals| s.high_errors() },
        Rule {
            label: RiskLevel::High,
            when: |s: &RiskSignals| s.query_count > HIGH_QUERY_VOLUME && s.high_contribution(),
        },
        Rule {
            label: RiskLevel::High,
            when: |s: &RiskSignals| s.contribution_pct > DOMINANT_CONTRIBUTION_PCT,
        },
        Rule {
            label: RiskLevel::Medium,
            when: |s: &RiskSignals| s.contribution_pct > MODERATE_CONTRIBUTION_PCT,
        },
        Rule {
            label: RiskLevel::Medium,
            when: |s: &RiskSignals| s.error_count > MODERATE_ERROR_COUNT,
        },
    ],
    otherwise: RiskLevel::Low,
};

/// `value / total * 100`; a non-positive total yields `0` with a guard.
pub fn contribution_pct(value: f64, total: f64) -> (f64, Option<Guard>) {
    if total > 0.0 {
        (value / total * 100.0, None)
    } else {
        (0.0, Some(Guard::ZeroDenominatorAttribution))
    }
}

/// One entity's part in an anomalous day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub date: NaiveDate,
    pub metric: Metric,
    pub entity: EntityKey,
    pub value: f64,
    pub contribution_pct: f64,
    pub level: ContributionLevel,
    pub error_count: u64,
    pub query_count: u64,
    /// Share of the excess above the forecast upper bound.
    pub attributed_excess: f64,
    pub risk: RiskLevel,
    /// The contributor's day as a whole.
    pub behavior_pattern: PatternType,
    /// Warehouse with most of the contributor's execution time that day.
    pub warehouse: Option<String>,
    pub guard: Option<Guard>,
}

impl Contribution {
    pub fn recommended_action(&self) -> &'static str {
        match self.risk {
            RiskLevel::Critical => {
                "Throttle or suspend the workload now and review its failing queries"
            }
            RiskLevel::High => "Investigate the workload behind the spike with the user",
            RiskLevel::Medium => "Review the user's query patterns",
            RiskLevel::Low => "Monitor",
        }
    }
}

/// Break a flagged day down over the day's entity records.
///
/// The contribution denominator is the bound's `actual` total. The excess over
/// the upper bound is allocated by the same metric. Unflagged bounds yield
/// nothing.
pub fn contributions(bound: &ForecastBound, records: &[MetricRecord]) -> Vec<Contribution> {
    if !bound.is_anomaly {
        return Vec::new();
    }

    let day: Vec<&MetricRecord> = records
        .iter()
        .filter(|r| r.bucket.date() == bound.date)
        .collect();
    let values: Vec<f64> = day.iter().map(|r| bound.metric.value(&r.metrics)).collect();
    let excess = allocate(bound.excess(), &values);

    day.iter()
        .zip(values)
        .zip(excess.shares)
        .map(|((record, value), attributed_excess)| {
            let (pct, guard) = contribution_pct(value, bound.actual);
            let signals = RiskSignals {
                contribution_pct: pct,
                error_count: record.metrics.error_count,
                query_count: record.metrics.query_count,
            };
            Contribution {
                date: bound.date,
                metric: bound.metric,
                entity: record.entity.clone(),
                value,
                contribution_pct: pct,
                level: CONTRIBUTION_RULES.classify(&pct),
                error_count: signals.error_count,
                query_count: signals.query_count,
                attributed_excess,
                risk: RISK_RULES.classify(&signals),
                behavior_pattern: PATTERN_RULES.classify(&ActivitySignals::daily(&record.metrics)),
                warehouse: None,
                guard: guard.or(excess.guard),
            }
        })
        .collect()
}
