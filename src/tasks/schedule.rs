use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;

use crate::errors::SyncError;

/// Days and hours during which the loop is allowed to check the inbox.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleWindow {
    days: Vec<Weekday>,
    start_hour: u32,
    end_hour: u32,
    timezone: Tz,
}

impl ScheduleWindow {
    /// `[start_hour, end_hour)` on each of `days`, local to `timezone`.
    pub fn new(days: Vec<Weekday>, start_hour: u32, end_hour: u32, timezone: Tz) -> Result<Self, SyncError> {
        if days.is_empty() {
            return Err(SyncError::Config("ACTIVE_DAYS names no days".to_string()));
        }
        if start_hour >= end_hour || end_hour > 24 {
            return Err(SyncError::Config(format!(
                "active hours {}..{} are not a valid range",
                start_hour, end_hour
            )));
        }
        Ok(Self {
            days,
            start_hour,
            end_hour,
            timezone,
        })
    }

    /// Every day, every hour.
    pub fn always(timezone: Tz) -> Self {
        Self {
            days: ALL_DAYS.to_vec(),
            start_hour: 0,
            end_hour: 24,
            timezone,
        }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone);
        self.days.contains(&local.weekday())
            && local.hour() >= self.start_hour
            && local.hour() < self.end_hour
    }
}

const ALL_DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// `"mon,tue,fri"` or `"monday, Friday"`.
pub fn parse_days(raw: &str) -> Result<Vec<Weekday>, SyncError> {
    let mut days = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let day = part
            .parse::<Weekday>()
            .map_err(|_| SyncError::Config(format!("unknown weekday {:?} in ACTIVE_DAYS", part)))?;
        if !days.contains(&day) {
            days.push(day);
        }
    }
    Ok(days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Amsterdam;

    fn weekdays() -> ScheduleWindow {
        ScheduleWindow::new(parse_days("mon,tue,wed,thu,fri").unwrap(), 8, 20, Amsterdam).unwrap()
    }

    #[test]
    fn hours_are_local_and_half_open() {
        let window = weekdays();
        // Monday 13 Oct 2025, CEST is UTC+2
        assert!(!window.contains(Utc.with_ymd_and_hms(2025, 10, 13, 5, 59, 0).unwrap()));
        assert!(window.contains(Utc.with_ymd_and_hms(2025, 10, 13, 6, 0, 0).unwrap()));
        assert!(window.contains(Utc.with_ymd_and_hms(2025, 10, 13, 17, 59, 0).unwrap()));
        assert!(!window.contains(Utc.with_ymd_and_hms(2025, 10, 13, 18, 0, 0).unwrap()));
    }

    #[test]
    fn weekends_are_skipped() {
        let saturday_noon = Utc.with_ymd_and_hms(2025, 10, 18, 10, 0, 0).unwrap();
        assert!(!weekdays().contains(saturday_noon));
        assert!(ScheduleWindow::always(Amsterdam).contains(saturday_noon));
    }

    #[test]
    fn day_names_are_forgiving() {
        assert_eq!(
            parse_days(" Monday, fri ,mon").unwrap(),
            vec![Weekday::Mon, Weekday::Fri]
        );
        assert!(parse_days("mon,someday").is_err());
    }

    #[test]
    fn rejects_empty_or_inverted_windows() {
        assert!(ScheduleWindow::new(vec![], 8, 20, Amsterdam).is_err());
        assert!(ScheduleWindow::new(vec![Weekday::Mon], 20, 8, Amsterdam).is_err());
        assert!(ScheduleWindow::new(vec![Weekday::Mon], 0, 25, Amsterdam).is_err());
    }
}
