//! Daily maintenance windows
//!
//! A source that resets at a predictable time of day should not be hammered
//! with reconnects while it is down. When a session loses its connection
//! inside the window, it waits for the configured resume time instead of
//! following its backoff schedule.

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceWindow {
    timezone: Tz,
    start: NaiveTime,
    end: NaiveTime,
    resume_at: NaiveTime,
}

impl MaintenanceWindow {
    pub fn new(timezone: Tz, start: NaiveTime, end: NaiveTime, resume_at: NaiveTime) -> Self {
        Self {
            timezone,
            start,
            end,
            resume_at,
        }
    }

    /// Build from an IANA timezone name and `HH:MM` times
    pub fn parse(timezone: &str, start: &str, end: &str, resume_at: &str) -> Result<Self> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| SessionError::InvalidMaintenance(format!("unknown timezone '{}'", timezone)))?;
        let time = |value: &str| {
            NaiveTime::parse_from_str(value, "%H:%M").map_err(|e| {
                SessionError::InvalidMaintenance(format!("invalid time '{}': {}", value, e))
            })
        };
        Ok(Self::new(tz, time(start)?, time(end)?, time(resume_at)?))
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// True when `now`, in the window's timezone, falls in `[start, end)`
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.timezone).time();
        if self.start <= self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }

    /// Next wall-clock occurrence of `resume_at` strictly after `now`
    pub fn resume_instant(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.with_timezone(&self.timezone).date_naive();
        (0..3)
            .filter_map(|offset| {
                let date = today + Duration::days(offset);
                self.localize(date.and_time(self.resume_at))
            })
            .find(|candidate| *candidate > now)
            .unwrap_or_else(|| now + Duration::days(1))
    }

    /// Resolve a local time, taking the earlier instant on a DST overlap and
    /// skipping forward an hour on a DST gap
    fn localize(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                self.timezone
                    .from_local_datetime(&(naive + Duration::hours(1)))
                    .earliest()
            })
            .map(|t| t.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ibkr_window() -> MaintenanceWindow {
        MaintenanceWindow::parse("America/New_York", "23:40", "01:00", "01:05").unwrap()
    }

    fn new_york(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> DateTime<Utc> {
        chrono_tz::America::New_York
            .with_ymd_and_hms(y, m, d, hh, mm, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_contains_wraps_midnight() {
        let window = ibkr_window();
        assert!(window.contains(new_york(2024, 1, 17, 23, 45)));
        assert!(window.contains(new_york(2024, 1, 18, 0, 30)));
        assert!(!window.contains(new_york(2024, 1, 18, 1, 0)));
        assert!(!window.contains(new_york(2024, 1, 17, 23, 39)));
        assert!(!window.contains(new_york(2024, 1, 17, 12, 0)));
    }

    #[test]
    fn test_contains_simple_window() {
        let window = MaintenanceWindow::parse("UTC", "02:00", "03:00", "03:10").unwrap();
        let at = |hh, mm| Utc.with_ymd_and_hms(2024, 3, 1, hh, mm, 0).unwrap();
        assert!(window.contains(at(2, 0)));
        assert!(window.contains(at(2, 59)));
        assert!(!window.contains(at(3, 0)));
    }

    #[test]
    fn test_resume_is_next_day_before_midnight() {
        let window = ibkr_window();
        let resume = window.resume_instant(new_york(2024, 1, 17, 23, 45));
        assert_eq!(resume, new_york(2024, 1, 18, 1, 5));
    }

    #[test]
    fn test_resume_is_same_day_after_midnight() {
        let window = ibkr_window();
        let resume = window.resume_instant(new_york(2024, 1, 18, 0, 10));
        assert_eq!(resume, new_york(2024, 1, 18, 1, 5));
    }

    #[test]
    fn test_resume_across_dst_change() {
        // US clocks spring forward on 2024-03-10; 01:05 still exists that night
        let window = ibkr_window();
        let resume = window.resume_instant(new_york(2024, 3, 9, 23, 50));
        assert_eq!(resume, new_york(2024, 3, 10, 1, 5));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(MaintenanceWindow::parse("Nowhere/City", "23:40", "01:00", "01:05").is_err());
        assert!(MaintenanceWindow::parse("UTC", "25:00", "01:00", "01:05").is_err());
    }
}
