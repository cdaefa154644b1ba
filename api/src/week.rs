use chrono::{Datelike, NaiveDate, Utc};
use std::fmt;

/// The logical key of a weekly backup: ISO week-numbering year and ISO week.
///
/// The year is the ISO week-year, not the calendar year, so the days at the
/// edges of December and January land in the same key as the rest of their
/// week (2024-12-30 is week 1 of 2025).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WeekKey {
    pub year: i32,
    pub week: u32,
}

impl WeekKey {
    pub fn of(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    pub fn current() -> Self {
        Self::of(Utc::now().date_naive())
    }

    pub fn week_i32(self) -> i32 {
        self.week as i32
    }
}

impl fmt::Display for WeekKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}
