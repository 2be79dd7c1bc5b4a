//! Extraction date windows
//!
//! A load always covers a closed range of calendar days. The range is derived
//! from the CLI selection relative to "today": lifetime and lookback windows
//! end yesterday, since the current day is still accumulating in every
//! provider.

use crate::error::{CommonError, Result};
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// Date format used on the command line and in every raw table
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Closed range of days `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// How the caller asked for the window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeSelection {
    /// From the source's lifetime start up to yesterday
    Lifetime,
    /// The last N complete days
    Lookback(u32),
    /// Explicit start, with end defaulting to yesterday
    Explicit {
        start: NaiveDate,
        end: Option<NaiveDate>,
    },
    /// Nothing requested; the default lookback applies
    Default,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(CommonError::InvalidRange {
                start: start.format(DATE_FORMAT).to_string(),
                end: end.format(DATE_FORMAT).to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// Resolve a selection against `today`.
    pub fn resolve(
        selection: &RangeSelection,
        lifetime_start: NaiveDate,
        default_lookback: u32,
        today: NaiveDate,
    ) -> Result<Self> {
        let yesterday = today
            .pred_opt()
            .ok_or_else(|| CommonError::config("today has no previous day"))?;

        match selection {
            RangeSelection::Lifetime => Self::new(lifetime_start, yesterday),
            RangeSelection::Lookback(days) => Self::lookback(*days, yesterday),
            RangeSelection::Explicit { start, end } => Self::new(*start, end.unwrap_or(yesterday)),
            RangeSelection::Default => Self::lookback(default_lookback, yesterday),
        }
    }

    fn lookback(days: u32, yesterday: NaiveDate) -> Result<Self> {
        if days == 0 {
            return Err(CommonError::config("lookback days must be at least 1"));
        }
        let start = yesterday
            .checked_sub_days(Days::new(u64::from(days - 1)))
            .ok_or_else(|| CommonError::config(format!("lookback of {} days is out of range", days)))?;
        Self::new(start, yesterday)
    }

    /// Number of days covered, inclusive
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }
}

/// Parse a `YYYY-MM-DD` date
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|_| CommonError::InvalidDate(s.to_string()))
}
