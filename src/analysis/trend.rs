//! Lagged values, moving averages and percent-change helpers.
//!
//! Two "no signal" conventions exist and both are kept on purpose:
//! growth views (write activity) report `0.0` when there is no previous value,
//! cost views (consumption, credits) report `None`. Call sites pick one with
//! [`ChangeConvention`]; the two must not be unified.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TrendError {
    #[error("series not strictly increasing: {current} follows {previous}")]
    NotIncreasing {
        previous: NaiveDate,
        current: NaiveDate,
    },
}

/// Trend values of one entity at one position of its ordered series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendRecord {
    pub date: NaiveDate,
    pub value: f64,
    pub lag1: Option<f64>,
    pub lag7: Option<f64>,
    pub avg7: f64,
    pub avg30: f64,
}

/// Mean of the trailing `window` values ending at `i` (inclusive).
fn trailing_mean(values: &[f64], i: usize, window: usize) -> f64 {
    let start = (i + 1).saturating_sub(window);
    let slice = &values[start..=i];
    slice.iter().sum::<f64>() / slice.len() as f64
}

/// Compute trend records for a series ordered by strictly increasing date.
///
/// Lags and windows are positional: a gap in activity is not a zero day.
/// Densify the series first with [`densify`] when calendar semantics are wanted.
pub fn compute_trends(series: &[(NaiveDate, f64)]) -> Result<Vec<TrendRecord>, TrendError> {
    for pair in series.windows(2) {
        if pair[1].0 <= pair[0].0 {
            return Err(TrendError::NotIncreasing {
                previous: pair[0].0,
                current: pair[1].0,
            });
        }
    }

    let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
    Ok(series
        .iter()
        .enumerate()
        .map(|(i, &(date, value))| TrendRecord {
            date,
            value,
            lag1: i.checked_sub(1).map(|j| values[j]),
            lag7: i.checked_sub(7).map(|j| values[j]),
            avg7: trailing_mean(&values, i, 7),
            avg30: trailing_mean(&values, i, 30),
        })
        .collect())
}

/// Zero-fill every missing day of `[start, end]`. Values outside are dropped.
pub fn densify(series: &[(NaiveDate, f64)], start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, f64)> {
    let mut out = Vec::new();
    let mut it = series.iter().filter(|(d, _)| *d >= start && *d <= end).peekable();
    let mut day = start;
    while day <= end {
        let value = match it.peek() {
            Some(&&(d, v)) if d == day => {
                it.next();
                v
            }
            _ => 0.0,
        };
        out.push((day, value));
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    out
}

/// Which "no signal" value a call site reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeConvention {
    /// No signal is `Some(0.0)`.
    Growth,
    /// No signal is `None`.
    Cost,
}

impl ChangeConvention {
    fn no_signal(self) -> Option<f64> {
        match self {
            ChangeConvention::Growth => Some(0.0),
            ChangeConvention::Cost => None,
        }
    }
}

/// `(curr - prev) / prev * 100`, defined only for `prev > 0`.
pub fn pct_change(curr: f64, prev: Option<f64>, convention: ChangeConvention) -> Option<f64> {
    match prev {
        Some(p) if p > 0.0 => Some((curr - p) / p * 100.0),
        _ => convention.no_signal(),
    }
}

/// `(curr - avg) / avg * 100`, defined only for `avg > 0`.
pub fn deviation_pct(curr: f64, avg: f64, convention: ChangeConvention) -> Option<f64> {
    if avg > 0.0 {
        Some((curr - avg) / avg * 100.0)
    } else {
        convention.no_signal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(n: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 1).unwrap() + chrono::Duration::days(n)
    }

    fn series(values: &[f64]) -> Vec<(NaiveDate, f64)> {
        values.iter().enumerate().map(|(i, v)| (d(i as i64), *v)).collect()
    }

    #[test]
    fn test_lags_and_short_windows() {
        let trends = compute_trends(&series(&[2.0, 4.0, 6.0])).unwrap();
        assert_eq!(trends[0].lag1, None);
        assert_eq!(trends[0].avg7, 2.0);
        assert_eq!(trends[1].lag1, Some(2.0));
        assert_eq!(trends[2].avg7, 4.0);
        assert_eq!(trends[2].avg30, 4.0);
        assert!(trends.iter().all(|t| t.lag7.is_none()));
    }

    #[test]
    fn test_lag7_and_full_window() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        let trends = compute_trends(&series(&values)).unwrap();
        assert_eq!(trends[7].lag7, Some(1.0));
        assert_eq!(trends[9].lag7, Some(3.0));
        // days 4..=10
        assert_eq!(trends[9].avg7, 7.0);
        assert_eq!(trends[9].avg30, 5.5);
    }

    #[test]
    fn test_sliding_window_changes_by_new_minus_dropped_over_seven() {
        let values = [3.0, 9.0, 1.0, 4.0, 7.0, 2.0, 8.0, 15.0, 6.0];
        let trends = compute_trends(&series(&values)).unwrap();
        for i in 7..values.len() {
            let expected = (values[i] - values[i - 7]) / 7.0;
            let delta = trends[i].avg7 - trends[i - 1].avg7;
            assert!((delta - expected).abs() < 1e-12, "position {i}");
        }
    }

    #[test]
    fn test_rejects_unordered_series() {
        let s = vec![(d(1), 1.0), (d(1), 2.0)];
        assert!(matches!(compute_trends(&s), Err(TrendError::NotIncreasing { .. })));
        let s = vec![(d(2), 1.0), (d(1), 2.0)];
        assert!(compute_trends(&s).is_err());
    }

    #[test]
    fn test_gaps_are_not_zero_filled_unless_densified() {
        let sparse = vec![(d(0), 10.0), (d(3), 20.0)];
        let trends = compute_trends(&sparse).unwrap();
        assert_eq!(trends[1].lag1, Some(10.0));
        assert_eq!(trends[1].avg7, 15.0);

        let dense = densify(&sparse, d(0), d(3));
        assert_eq!(dense.len(), 4);
        assert_eq!(dense[1], (d(1), 0.0));
        let trends = compute_trends(&dense).unwrap();
        assert_eq!(trends[3].lag1, Some(0.0));
        assert_eq!(trends[3].avg7, 7.5);
    }

    #[test]
    fn test_pct_change_conventions() {
        assert_eq!(pct_change(150.0, Some(100.0), ChangeConvention::Cost), Some(50.0));
        assert_eq!(pct_change(150.0, Some(0.0), ChangeConvention::Growth), Some(0.0));
        assert_eq!(pct_change(150.0, None, ChangeConvention::Growth), Some(0.0));
        assert_eq!(pct_change(150.0, Some(0.0), ChangeConvention::Cost), None);
        assert_eq!(pct_change(150.0, None, ChangeConvention::Cost), None);
        assert_eq!(deviation_pct(5.0, 10.0, ChangeConvention::Cost), Some(-50.0));
        assert_eq!(deviation_pct(5.0, 0.0, ChangeConvention::Cost), None);
        assert_eq!(deviation_pct(5.0, 0.0, ChangeConvention::Growth), Some(0.0));
    }
}
