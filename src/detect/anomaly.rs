use crate::analysis::rules::{Rule, RuleList};
use crate::analysis::stats::Baseline;
use crate::analysis::trend::{deviation_pct, ChangeConvention, TrendRecord};
use crate::detect::{BehaviorClass, RatioClass, RecommendationTier};
use crate::entity::EntityKey;
use crate::error::Guard;
use crate::metrics::{Metric, MetricKind};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Absolute z-score tiers, highest first. Boundaries fall to the lower tier.
pub static Z_SCORE_RULES: RuleList<f64, BehaviorClass> = RuleList {
    rules: &[
        Rule { label: BehaviorClass::HighlyAnomalous, when: |z: &f64| z.abs() > 3.0 },
        Rule { label: BehaviorClass::Anomalous, when: |z: &f64| z.abs() > 2.0 },
        Rule { label: BehaviorClass::Unusual, when: |z: &f64| z.abs() > 1.0 },
    ],
    otherwise: BehaviorClass::Normal,
};

/// A value and its 7-day moving average.
#[derive(Debug, Clone, Copy)]
pub struct RatioInput {
    pub value: f64,
    pub avg7: f64,
}

/// Multiplicative tiers against the moving average, highest first.
pub static RATIO_RULES: RuleList<RatioInput, RatioClass> = RuleList {
    rules: &[
        Rule { label: RatioClass::Extreme, when: |r: &RatioInput| r.value > 3.0 * r.avg7 },
        Rule { label: RatioClass::Significant, when: |r: &RatioInput| r.value > 2.0 * r.avg7 },
        Rule { label: RatioClass::Moderate, when: |r: &RatioInput| r.value > 1.5 * r.avg7 },
        Rule {
            label: RatioClass::SignificantDecrease,
            when: |r: &RatioInput| r.value < 0.5 * r.avg7,
        },
    ],
    otherwise: RatioClass::Normal,
};

/// `(x - mean) / std_dev`, or `0` with a guard when the spread is zero.
pub fn z_score(value: f64, baseline: &Baseline) -> (f64, Option<Guard>) {
    if baseline.std_dev > 0.0 {
        ((value - baseline.mean) / baseline.std_dev, None)
    } else {
        (0.0, Some(Guard::DegenerateBaseline))
    }
}

pub fn classify_z(z: f64) -> BehaviorClass {
    Z_SCORE_RULES.classify(&z)
}

/// Ratio tier; a non-positive average has no ratio and classifies as normal.
pub fn classify_ratio(value: f64, avg7: f64) -> (RatioClass, Option<Guard>) {
    if avg7 > 0.0 {
        (RATIO_RULES.classify(&RatioInput { value, avg7 }), None)
    } else {
        (RatioClass::Normal, Some(Guard::DegenerateBaseline))
    }
}

/// Score of one metric of one entity on one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub entity: EntityKey,
    pub date: NaiveDate,
    pub metric: Metric,
    pub value: f64,
    pub baseline: Baseline,
    pub trend: TrendRecord,
    pub z_score: f64,
    pub behavior: BehaviorClass,
    pub ratio: RatioClass,
    /// Deviation from the baseline mean; `None` when the mean is zero.
    pub deviation_from_mean_pct: Option<f64>,
    /// Deviation from the 7-day average; `None` when the average is zero.
    pub deviation_from_avg7_pct: Option<f64>,
    pub tier: RecommendationTier,
    /// Guard of the classification that decided the tier.
    pub guard: Option<Guard>,
}

impl AnomalyRecord {
    /// Label of the classification that applies to the metric's kind.
    pub fn classification(&self) -> &'static str {
        match self.metric.kind() {
            MetricKind::Count => self.behavior.label(),
            MetricKind::Volume => self.ratio.label(),
        }
    }
}

/// Combine a day's value with its baseline and trend.
///
/// Count metrics are tiered by z-score, volume metrics by the ratio to their
/// 7-day average; both classifications are kept on the record.
pub fn score(
    entity: &EntityKey,
    metric: Metric,
    baseline: Baseline,
    trend: TrendRecord,
) -> AnomalyRecord {
    let value = trend.value;
    let (z, z_guard) = z_score(value, &baseline);
    let behavior = classify_z(z);
    let (ratio, ratio_guard) = classify_ratio(value, trend.avg7);

    let (tier, guard) = match metric.kind() {
        MetricKind::Count => (behavior.tier(), z_guard),
        MetricKind::Volume => (ratio.tier(), ratio_guard),
    };

    AnomalyRecord {
        entity: entity.clone(),
        date: trend.date,
        metric,
        value,
        baseline,
        trend,
        z_score: z,
        behavior,
        ratio,
        deviation_from_mean_pct: deviation_pct(value, baseline.mean, ChangeConvention::Cost),
        deviation_from_avg7_pct: deviation_pct(value, trend.avg7, ChangeConvention::Cost),
        tier,
        guard,
    }
}
