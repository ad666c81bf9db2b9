//! Activity patterns of a user within a day or one of its hours, and the
//! risk of an hourly pattern given the day's behavior classification.

use crate::analysis::rules::{Rule, RuleList};
use crate::attribution::contribution::{RiskLevel, HIGH_QUERY_VOLUME, MODERATE_ERROR_COUNT};
use crate::detect::BehaviorClass;
use crate::metrics::UsageMetrics;
use serde::{Deserialize, Serialize};

/// Fewest queries in a day for one hour of it to count as a burst.
pub const BURST_MIN_QUERIES: u64 = 10;
/// Share of the day's queries above which an hour is a burst.
pub const BURST_SHARE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeClass {
    BusinessHours,
    OffHours,
}

impl TimeClass {
    pub fn label(self) -> &'static str {
        match self {
            TimeClass::BusinessHours => "Business Hours",
            TimeClass::OffHours => "Off Hours",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternType {
    ErrorProne,
    OffHours,
    HighVolume,
    Burst,
    Regular,
}

impl PatternType {
    pub fn label(self) -> &'static str {
        match self {
            PatternType::ErrorProne => "Error-Prone Activity",
            PatternType::OffHours => "Off-Hours Activity",
            PatternType::HighVolume => "High Volume",
            PatternType::Burst => "Concentrated Burst",
            PatternType::Regular => "Regular Activity",
        }
    }
}

/// Query counters a pattern is read from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivitySignals {
    pub queries: u64,
    pub errors: u64,
    pub off_hours_queries: u64,
    /// Share of the day's queries run in this hour; only set for an hour of a
    /// day with at least [`BURST_MIN_QUERIES`] queries.
    pub burst_share: Option<f64>,
}

impl ActivitySignals {
    /// Signals of a whole day.
    pub fn daily(m: &UsageMetrics) -> Self {
        Self {
            queries: m.query_count,
            errors: m.error_count,
            off_hours_queries: m.off_hours_query_count,
            burst_share: None,
        }
    }

    /// Signals of one hour of a day that had `day_queries` queries.
    pub fn hourly(m: &UsageMetrics, day_queries: u64) -> Self {
        Self {
            burst_share: (day_queries >= BURST_MIN_QUERIES)
                .then(|| m.query_count as f64 / day_queries as f64),
            ..Self::daily(m)
        }
    }
}

pub static PATTERN_RULES: RuleList<ActivitySignals, PatternType> = RuleList {
    rules: &[
        Rule {
            label: PatternType::ErrorProne,
            when: |s: &ActivitySignals| s.errors > MODERATE_ERROR_COUNT,
        },
        Rule {
            label: PatternType::OffHours,
            when: |s: &ActivitySignals| s.queries > 0 && 2 * s.off_hours_queries > s.queries,
        },
        Rule {
            label: PatternType::HighVolume,
            when: |s: &ActivitySignals| s.queries > HIGH_QUERY_VOLUME,
        },
        Rule {
            label: PatternType::Burst,
            when: |s: &ActivitySignals| s.burst_share.is_some_and(|p| p > BURST_SHARE),
        },
    ],
    otherwise: PatternType::Regular,
};

/// An hourly pattern next to the classification of the user's whole day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternContext {
    pub pattern: PatternType,
    pub behavior: BehaviorClass,
}

impl PatternContext {
    fn anomalous(&self) -> bool {
        matches!(
            self.behavior,
            BehaviorClass::HighlyAnomalous | BehaviorClass::Anomalous
        )
    }
}

pub static PATTERN_RISK_RULES: RuleList<PatternContext, RiskLevel> = RuleList {
    rules: &[
        Rule {
            label: RiskLevel::High,
            when: |c: &PatternContext| c.anomalous() && c.pattern == PatternType::OffHours,
        },
        Rule {
            label: RiskLevel::High,
            when: |c: &PatternContext| c.anomalous() && c.pattern == PatternType::ErrorProne,
        },
        Rule { label: RiskLevel::Medium, when: |c: &PatternContext| c.anomalous() },
        Rule {
            label: RiskLevel::Medium,
            when: |c: &PatternContext| c.pattern != PatternType::Regular,
        },
    ],
    otherwise: RiskLevel::Low,
};

/// Follow-up for an hourly pattern row.
pub fn recommended_action(risk: RiskLevel, pattern: PatternType) -> &'static str {
    match (risk, pattern) {
        (RiskLevel::Critical | RiskLevel::High, _) => {
            "Verify the activity with the user and review their access"
        }
        (_, PatternType::ErrorProne) => "Review the failing queries with the user",
        (_, PatternType::OffHours) => "Confirm the off-hours workload is scheduled and authorized",
        (_, PatternType::HighVolume | PatternType::Burst) => {
            "Consider moving the burst to a scheduled job or a dedicated warehouse"
        }
        (RiskLevel::Medium, PatternType::Regular) => {
            "Monitor the user's activity over the coming days"
        }
        (RiskLevel::Low, PatternType::Regular) => "No action needed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(queries: u64, errors: u64, off_hours: u64, share: Option<f64>) -> ActivitySignals {
        ActivitySignals {
            queries,
            errors,
            off_hours_queries: off_hours,
            burst_share: share,
        }
    }

    #[test]
    fn test_pattern_order() {
        // Errors win over everything else.
        assert_eq!(PATTERN_RULES.classify(&signals(5, 4, 5, None)), PatternType::ErrorProne);
        assert_eq!(PATTERN_RULES.classify(&signals(5, 3, 5, None)), PatternType::OffHours);
        // Exactly half off-hours is not an off-hours pattern.
        assert_eq!(PATTERN_RULES.classify(&signals(4, 0, 2, None)), PatternType::Regular);
        assert_eq!(PATTERN_RULES.classify(&signals(1001, 0, 0, None)), PatternType::HighVolume);
        assert_eq!(PATTERN_RULES.classify(&signals(6, 0, 0, Some(0.6))), PatternType::Burst);
        assert_eq!(PATTERN_RULES.classify(&signals(5, 0, 0, Some(0.5))), PatternType::Regular);
        assert_eq!(PATTERN_RULES.classify(&signals(0, 0, 0, None)), PatternType::Regular);
    }

    #[test]
    fn test_burst_needs_a_busy_day() {
        let hour = UsageMetrics { query_count: 6, ..Default::default() };
        assert_eq!(ActivitySignals::hourly(&hour, 9).burst_share, None);
        assert_eq!(ActivitySignals::hourly(&hour, 10).burst_share, Some(0.6));
        assert_eq!(ActivitySignals::daily(&hour).burst_share, None);
    }

    #[test]
    fn test_pattern_risk() {
        let ctx = |pattern, behavior| PatternContext { pattern, behavior };
        assert_eq!(
            PATTERN_RISK_RULES.classify(&ctx(PatternType::OffHours, BehaviorClass::Anomalous)),
            RiskLevel::High
        );
        assert_eq!(
            PATTERN_RISK_RULES.classify(&ctx(PatternType::ErrorProne, BehaviorClass::HighlyAnomalous)),
            RiskLevel::High
        );
        assert_eq!(
            PATTERN_RISK_RULES.classify(&ctx(PatternType::Regular, BehaviorClass::Anomalous)),
            RiskLevel::Medium
        );
        assert_eq!(
            PATTERN_RISK_RULES.classify(&ctx(PatternType::OffHours, BehaviorClass::Unusual)),
            RiskLevel::Medium
        );
        assert_eq!(
            PATTERN_RISK_RULES.classify(&ctx(PatternType::Regular, BehaviorClass::Unusual)),
            RiskLevel::Low
        );
    }

    #[test]
    fn test_actions() {
        assert_eq!(
            recommended_action(RiskLevel::Medium, PatternType::OffHours),
            "Confirm the off-hours workload is scheduled and authorized"
        );
        assert_eq!(recommended_action(RiskLevel::Low, PatternType::Regular), "No action needed");
        assert_eq!(
            recommended_action(RiskLevel::High, PatternType::Regular),
            "Verify the activity with the user and review their access"
        );
    }
}
