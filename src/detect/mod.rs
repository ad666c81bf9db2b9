//! Anomaly scoring and compliance classification.

pub mod anomaly;
pub mod pattern;
pub mod security;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Z-score tier of a count metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BehaviorClass {
    HighlyAnomalous,
    Anomalous,
    Unusual,
    Normal,
}

/// Ratio-to-moving-average tier of a volume or cost metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatioClass {
    Extreme,
    Significant,
    Moderate,
    SignificantDecrease,
    Normal,
}

/// Recommendation urgency. Ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecommendationTier {
    Low,
    Medium,
    High,
    Urgent,
}

impl BehaviorClass {
    pub fn label(self) -> &'static str {
        match self {
            BehaviorClass::HighlyAnomalous => "Highly Anomalous",
            BehaviorClass::Anomalous => "Anomalous",
            BehaviorClass::Unusual => "Unusual",
            BehaviorClass::Normal => "Normal",
        }
    }

    pub fn tier(self) -> RecommendationTier {
        match self {
            BehaviorClass::HighlyAnomalous => RecommendationTier::Urgent,
            BehaviorClass::Anomalous => RecommendationTier::High,
            BehaviorClass::Unusual => RecommendationTier::Medium,
            BehaviorClass::Normal => RecommendationTier::Low,
        }
    }
}

impl RatioClass {
    pub fn label(self) -> &'static str {
        match self {
            RatioClass::Extreme => "Extreme",
            RatioClass::Significant => "Significant",
            RatioClass::Moderate => "Moderate",
            RatioClass::SignificantDecrease => "Significant Decrease",
            RatioClass::Normal => "Normal",
        }
    }

    pub fn tier(self) -> RecommendationTier {
        match self {
            RatioClass::Extreme => RecommendationTier::Urgent,
            RatioClass::Significant => RecommendationTier::High,
            RatioClass::Moderate => RecommendationTier::Medium,
            RatioClass::SignificantDecrease => RecommendationTier::Medium,
            RatioClass::Normal => RecommendationTier::Low,
        }
    }
}

impl RecommendationTier {
    pub fn label(self) -> &'static str {
        match self {
            RecommendationTier::Urgent => "URGENT",
            RecommendationTier::High => "HIGH",
            RecommendationTier::Medium => "MEDIUM",
            RecommendationTier::Low => "LOW",
        }
    }

    /// Priority bucket shown on recommendation rows.
    pub fn priority(self) -> &'static str {
        match self {
            RecommendationTier::Urgent | RecommendationTier::High => "High Priority",
            RecommendationTier::Medium => "Medium Priority",
            RecommendationTier::Low => "Low Priority",
        }
    }
}

impl fmt::Display for BehaviorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl fmt::Display for RatioClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl fmt::Display for RecommendationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
