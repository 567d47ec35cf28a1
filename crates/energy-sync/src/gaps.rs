//! Missing stretches in a regular time grid.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use energy_core::TimeRange;
use serde::Serialize;

/// A run of consecutive missing grid points, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub missing: usize,
    #[serde(skip)]
    pub step: Duration,
}

impl Gap {
    /// Covered time, counting each missing point as one full step.
    pub fn span(&self) -> Duration {
        self.end - self.start + self.step
    }

    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start,
            end: self.end,
        }
    }
}

/// Diff `expected` against `existing` and group the holes.
pub fn find_gaps(
    expected: &[DateTime<Utc>],
    existing: &[DateTime<Utc>],
    step: Duration,
) -> Vec<Gap> {
    let present: BTreeSet<_> = existing.iter().copied().collect();
    let mut missing: Vec<_> = expected
        .iter()
        .copied()
        .filter(|ts| !present.contains(ts))
        .collect();
    missing.sort();
    missing.dedup();

    let mut gaps: Vec<Gap> = Vec::new();
    for ts in missing {
        match gaps.last_mut() {
            Some(gap) if ts - gap.end == step => {
                gap.end = ts;
                gap.missing += 1;
            }
            _ => gaps.push(Gap {
                start: ts,
                end: ts,
                missing: 1,
                step,
            }),
        }
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).single().unwrap() + Duration::hours(h)
    }

    #[test]
    fn three_hour_hole_is_one_gap_of_three_hours() {
        let range = TimeRange::new(hour(0), hour(9)).unwrap();
        let expected = range.expected_grid(Duration::hours(1));
        let existing: Vec<_> = (0..=9).filter(|h| !(4..=6).contains(h)).map(hour).collect();

        let gaps = find_gaps(&expected, &existing, Duration::hours(1));
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start, hour(4));
        assert_eq!(gaps[0].end, hour(6));
        assert_eq!(gaps[0].missing, 3);
        assert_eq!(gaps[0].span(), Duration::hours(3));
    }

    #[test]
    fn separate_holes_stay_separate() {
        let expected: Vec<_> = (0..6).map(hour).collect();
        let existing = vec![hour(0), hour(2), hour(3)];
        let gaps = find_gaps(&expected, &existing, Duration::hours(1));
        assert_eq!(gaps.len(), 2);
        assert_eq!(gaps[0].range(), TimeRange::new(hour(1), hour(1)).unwrap());
        assert_eq!(gaps[1].span(), Duration::hours(2));
    }

    #[test]
    fn complete_grid_has_no_gaps() {
        let expected: Vec<_> = (0..4).map(hour).collect();
        assert!(find_gaps(&expected, &expected, Duration::hours(1)).is_empty());
    }
}
