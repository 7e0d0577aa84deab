use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Half-open time range `[start, end)` of versions eligible in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CompactionWindow {
    /// The window of `length` that ends `minimum_age` before `now`.
    pub fn ending_before(now: DateTime<Utc>, minimum_age: Duration, length: Duration) -> Self {
        let end = now - minimum_age;
        Self {
            start: end - length,
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

impl std::fmt::Display for CompactionWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}
