use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;

const INDEX_BASE_YEAR: i32 = 1970;

/// An ISO-8601 week: weeks run Monday to Sunday and week 1 is the week
/// holding the year's first Thursday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "PeriodRepr", into = "PeriodRepr")]
pub struct Period {
    year: i32,
    week: u32,
}

#[derive(Serialize, Deserialize)]
struct PeriodRepr {
    year: i32,
    week: u32,
}

impl TryFrom<PeriodRepr> for Period {
    type Error = SyncError;

    fn try_from(repr: PeriodRepr) -> Result<Self, Self::Error> {
        Period::new(repr.year, repr.week)
    }
}

impl From<Period> for PeriodRepr {
    fn from(period: Period) -> Self {
        PeriodRepr {
            year: period.year,
            week: period.week,
        }
    }
}

/// Number of ISO weeks in `year`: 53 when Jan 1 is a Thursday, or when the
/// year is a leap year and Jan 1 is a Wednesday; 52 otherwise.
pub fn weeks_in_year(year: i32) -> u32 {
    let Some(jan_first) = NaiveDate::from_ymd_opt(year, 1, 1) else {
        return 52;
    };
    match jan_first.weekday() {
        Weekday::Thu => 53,
        Weekday::Wed if is_leap_year(year) => 53,
        _ => 52,
    }
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

impl Period {
    pub fn new(year: i32, week: u32) -> Result<Self, SyncError> {
        if NaiveDate::from_ymd_opt(year, 1, 1).is_none() {
            return Err(SyncError::Validation(format!("year {} is out of range", year)));
        }
        let max_week = weeks_in_year(year);
        if week == 0 || week > max_week {
            return Err(SyncError::Validation(format!(
                "week {} does not exist in {} (valid: 1..={})",
                week, year, max_week
            )));
        }
        Ok(Self { year, week })
    }

    /// The ISO week that contains `date`.
    pub fn containing(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn week(&self) -> u32 {
        self.week
    }

    pub fn monday(&self) -> Option<NaiveDate> {
        NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Mon)
    }

    /// Position of this week on a single linear axis, counted in weeks from
    /// week 1 of 1970. Differences between indices are week distances.
    pub fn linear_index(&self) -> i64 {
        let mut index: i64 = 0;
        if self.year >= INDEX_BASE_YEAR {
            for year in INDEX_BASE_YEAR..self.year {
                index += i64::from(weeks_in_year(year));
            }
        } else {
            for year in self.year..INDEX_BASE_YEAR {
                index -= i64::from(weeks_in_year(year));
            }
        }
        index + i64::from(self.week) - 1
    }

    /// Signed number of weeks to go from `self` to `other`.
    pub fn weeks_until(&self, other: &Period) -> i64 {
        other.linear_index() - self.linear_index()
    }

    /// Parses the label the roster portal shows above its week view,
    /// e.g. `"Rooster 2025 week 40"`.
    pub fn from_display_label(label: &str) -> Result<Self, SyncError> {
        static LABEL: OnceLock<Regex> = OnceLock::new();
        let re = LABEL.get_or_init(|| {
            Regex::new(r"(?i)(\d{4})\s+week\s+(\d{1,2})").expect("static regex")
        });
        let caps = re.captures(label).ok_or_else(|| {
            SyncError::Validation(format!("cannot read a week from label {:?}", label))
        })?;
        let year = caps[1]
            .parse::<i32>()
            .map_err(|e| SyncError::Validation(e.to_string()))?;
        let week = caps[2]
            .parse::<u32>()
            .map_err(|e| SyncError::Validation(e.to_string()))?;
        Period::new(year, week)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}

impl FromStr for Period {
    type Err = SyncError;

    /// Accepts `2025-W40`, `2025W40` and the portal label form `2025 week 40`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();
        if let Some((year, week)) = upper.split_once('W') {
            let year = year.trim_end_matches('-');
            if let (Ok(year), Ok(week)) = (year.parse::<i32>(), week.parse::<u32>()) {
                return Period::new(year, week);
            }
        }
        Period::from_display_label(trimmed)
    }
}
