//! Age-weighted compaction.
//!
//! Once a series nears its point budget, points are grouped into runs of
//! the same calendar day and each run is block-averaged down to the share
//! of the budget its age is granted by the [`Distribution`]. Recent days
//! keep fine resolution, older days get coarser, and anything older than
//! the distribution covers is dropped.
//!
//! Configuration contract: a zero budget or an empty distribution is not
//! rejected here; it simply retains nothing. Validation happens when the
//! configuration is loaded.

use chrono::{DateTime, Datelike, Local, TimeZone};
use serde::{Deserialize, Serialize};

use super::Point;

/// Milliseconds in a day.
pub const DAY_MS: i64 = 86_400_000;

/// Default per-day budget shares, index 0 = today.
pub const DEFAULT_DISTRIBUTION: [f64; 8] = [40.0, 25.0, 10.0, 5.0, 5.0, 5.0, 5.0, 5.0];

/// Percentage of the point budget granted to each day of age.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Distribution(Vec<f64>);

impl Distribution {
    pub fn new(percentages: Vec<f64>) -> Self {
        Self(percentages)
    }

    /// Number of days covered, i.e. the retention window in days.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Share of the budget for data `age_days` old, if the table covers it.
    pub fn percent(&self, age_days: usize) -> Option<f64> {
        self.0.get(age_days).copied()
    }

    pub fn percentages(&self) -> &[f64] {
        &self.0
    }

    /// Sum of all shares.
    pub fn total(&self) -> f64 {
        self.0.iter().sum()
    }

    /// Retention window in milliseconds.
    pub fn max_age_ms(&self) -> i64 {
        i64::try_from(self.0.len())
            .unwrap_or(i64::MAX)
            .saturating_mul(DAY_MS)
    }
}

impl Default for Distribution {
    fn default() -> Self {
        Self(DEFAULT_DISTRIBUTION.to_vec())
    }
}

/// Clock used to decide which calendar day a timestamp belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayBoundary {
    #[default]
    Utc,
    Local,
}

impl DayBoundary {
    /// Day of the month (1-31) of `ms`; 0 when the timestamp is out of range.
    pub fn day_of_month(self, ms: i64) -> u32 {
        match self {
            Self::Utc => DateTime::from_timestamp_millis(ms).map_or(0, |dt| dt.day()),
            Self::Local => Local
                .timestamp_millis_opt(ms)
                .earliest()
                .map_or(0, |dt| dt.day()),
        }
    }
}

/// Point budget and age distribution applied to every series.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionPolicy {
    /// Maximum live points per series.
    pub budget: usize,
    pub distribution: Distribution,
    pub day_boundary: DayBoundary,
}

impl RetentionPolicy {
    pub fn new(budget: usize, distribution: Distribution) -> Self {
        Self {
            budget,
            distribution,
            day_boundary: DayBoundary::Utc,
        }
    }

    pub fn with_day_boundary(mut self, day_boundary: DayBoundary) -> Self {
        self.day_boundary = day_boundary;
        self
    }

    /// Compaction is a no-op while `len < budget - 1`.
    pub fn should_compact(&self, len: usize) -> bool {
        len >= self.budget.saturating_sub(1)
    }

    /// Number of samples a day-run of the given age may keep.
    ///
    /// `None` when the run has aged out of the distribution.
    pub fn target_for_age(&self, age_days: usize) -> Option<f64> {
        if age_days > self.distribution.len() {
            return None;
        }
        let percent = self.distribution.percent(age_days)?;
        Some(self.budget as f64 / 100.0 * percent)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(1000, Distribution::default())
    }
}

/// Rewrites `points` according to `policy` as seen at `now`.
///
/// Points older than the retention window are dropped, the rest are split
/// into runs of consecutive points sharing a day-of-month, and each run is
/// block-averaged to its age's target. Runs are emitted oldest first.
///
/// Only the day-of-month is compared, so two runs exactly a month apart
/// with nothing in between would merge. That needs a retention window of
/// four weeks or more and a month-long gap in sampling.
pub fn resample(points: &[Point], now: i64, policy: &RetentionPolicy) -> Vec<Point> {
    let cutoff = now.saturating_sub(policy.distribution.max_age_ms());
    let live: Vec<Point> = points.iter().copied().filter(|p| p.x >= cutoff).collect();

    let mut out = Vec::with_capacity(live.len().min(policy.budget));
    let mut run_start = 0;
    let mut run_day = live
        .first()
        .map(|p| policy.day_boundary.day_of_month(p.x));

    for (i, point) in live.iter().enumerate().skip(1) {
        let day = policy.day_boundary.day_of_month(point.x);
        if Some(day) != run_day {
            resample_day(&live[run_start..i], now, policy, &mut out);
            run_start = i;
            run_day = Some(day);
        }
    }

    if run_start < live.len() {
        resample_day(&live[run_start..], now, policy, &mut out);
    }

    out
}

fn resample_day(day: &[Point], now: i64, policy: &RetentionPolicy, out: &mut Vec<Point>) {
    let Some(last) = day.last() else {
        return;
    };

    // Future-dated runs (clock skew) count as today.
    let age_days = now.saturating_sub(last.x).div_euclid(DAY_MS).max(0);
    let Ok(age_days) = usize::try_from(age_days) else {
        return;
    };

    let Some(target) = policy.target_for_age(age_days) else {
        return;
    };

    block_average(day, target, out);
}

/// Replaces consecutive windows of `ceil(len / target)` points with their
/// mean `x` and mean `y`. The last window may be shorter.
///
/// A non-positive target keeps nothing.
pub fn block_average(points: &[Point], target: f64, out: &mut Vec<Point>) {
    if points.is_empty() || !(target > 0.0) {
        return;
    }

    let window = (points.len() as f64 / target).ceil();
    let window = if window >= 1.0 {
        // Saturating float-to-int cast; a window longer than the slice
        // just yields one chunk.
        window as usize
    } else {
        1
    };

    for chunk in points.chunks(window) {
        out.push(mean(chunk));
    }
}

fn mean(chunk: &[Point]) -> Point {
    let count = chunk.len().max(1);
    let x_sum: i128 = chunk.iter().map(|p| i128::from(p.x)).sum();
    let y_sum: f64 = chunk.iter().map(|p| p.y).sum();

    let x = i64::try_from(x_sum / count as i128).unwrap_or(i64::MAX);
    Point::new(x, y_sum / count as f64)
}
