//! Bounded metric series for chart rendering.
//!
//! A [`Series`] holds integer-valued samples appended through the
//! dedup-append rule and is shrunk by the age-weighted compactor in
//! [`compact`] once it approaches its point budget.

pub mod compact;

use serde::{Deserialize, Serialize};

pub use self::compact::{DayBoundary, Distribution, RetentionPolicy, DAY_MS};

/// A single chart point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Milliseconds since the Unix epoch.
    pub x: i64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: i64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Ordered points of one metric of one entity.
///
/// Serialises as a plain `[{x, y}, ...]` array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Series {
    points: Vec<Point>,
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    /// Builds a series from already ordered points.
    pub fn from_points(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&Point> {
        self.points.last()
    }

    /// Appends `raw` at `timestamp`, truncated toward zero.
    ///
    /// When the two newest points already hold the truncated value the
    /// newest point is stretched to `timestamp` instead of growing the
    /// series, so a flat metric costs two points regardless of duration.
    /// Non-finite input is stored as `0`.
    pub fn append(&mut self, raw: f64, timestamp: i64) {
        let value = truncate(raw);

        if let [.., before_last, last] = self.points.as_mut_slice() {
            if before_last.y == value && last.y == value {
                last.x = timestamp;
                return;
            }
        }

        self.points.push(Point::new(timestamp, value));
    }

    /// Runs the age-weighted compactor over this series in place.
    ///
    /// Returns `true` when the budget threshold was reached and the
    /// series was rewritten.
    pub fn compact(&mut self, now: i64, policy: &RetentionPolicy) -> bool {
        if !policy.should_compact(self.points.len()) {
            return false;
        }

        self.points = compact::resample(&self.points, now, policy);
        true
    }
}

fn truncate(raw: f64) -> f64 {
    if raw.is_finite() {
        // Adding 0.0 folds -0.0 into 0.0 so it serialises as `0.0`.
        raw.trunc() + 0.0
    } else {
        0.0
    }
}
