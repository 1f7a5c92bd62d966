//! Parsing and evaluation of the `HH:MM-HH:MM` UTC maintenance window.
//!
//! A window with `start < end` is a same-day interval; a window with
//! `start >= end` crosses midnight and is interpreted as
//! `[start, 24:00) ∪ [00:00, end)`. The window is half-open: `in_window`
//! is true at `start`, false at `end`. A zero-length window (`start ==
//! end`) is always false.

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};

use crate::error::MaintenanceWindowError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaintenanceWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl MaintenanceWindow {
    /// Parse `"HH:MM-HH:MM"` in UTC.
    pub fn parse(raw: &str) -> Result<Self, MaintenanceWindowError> {
        let (start_str, end_str) =
            raw.split_once('-')
                .ok_or_else(|| MaintenanceWindowError::InvalidFormat {
                    raw: raw.to_string(),
                })?;
        let start = parse_hhmm(start_str, raw)?;
        let end = parse_hhmm(end_str, raw)?;
        Ok(Self { start, end })
    }

    /// Whether `now` (UTC) falls inside the window.
    #[must_use]
    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        if self.start == self.end {
            return false;
        }
        let t = now.time();
        if self.start < self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }

    /// The next instant at or after `now` when the window opens.
    ///
    /// If already inside the window, returns `now`.
    #[must_use]
    pub fn next_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.in_window(now) {
            return now;
        }
        let today_start = now.date_naive().and_time(self.start).and_utc();
        if today_start > now {
            return today_start;
        }
        today_start + Duration::days(1)
    }

    /// Duration from `now` until the window next opens (zero if already in
    /// the window).
    #[must_use]
    pub fn time_until_window(&self, now: DateTime<Utc>) -> std::time::Duration {
        let next = self.next_window_start(now);
        let delta = next - now;
        delta.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

fn parse_hhmm(part: &str, raw: &str) -> Result<NaiveTime, MaintenanceWindowError> {
    let (h, m) = part
        .split_once(':')
        .ok_or_else(|| MaintenanceWindowError::InvalidFormat {
            raw: raw.to_string(),
        })?;
    let hour: u32 = h.parse().map_err(|_| MaintenanceWindowError::InvalidFormat {
        raw: raw.to_string(),
    })?;
    let minute: u32 = m.parse().map_err(|_| MaintenanceWindowError::InvalidFormat {
        raw: raw.to_string(),
    })?;
    // "24:00" is the canonical end-of-day sentinel.
    if hour == 24 && minute == 0 {
        return Ok(NaiveTime::from_hms_opt(23, 59, 59)
            .unwrap()
            .with_nanosecond(999_999_999)
            .unwrap());
    }
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| MaintenanceWindowError::OutOfRange {
        raw: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn same_day_window() {
        let w = MaintenanceWindow::parse("02:00-04:00").unwrap();
        assert!(w.in_window(at(2, 0)));
        assert!(w.in_window(at(3, 30)));
        assert!(!w.in_window(at(4, 0)));
        assert!(!w.in_window(at(1, 59)));
    }

    #[test]
    fn midnight_crossing_window() {
        let w = MaintenanceWindow::parse("22:00-02:00").unwrap();
        assert!(w.in_window(at(22, 0)));
        assert!(w.in_window(at(1, 59)));
        assert!(!w.in_window(at(2, 0)));
        assert!(!w.in_window(at(12, 0)));
    }

    #[test]
    fn zero_length_window_always_false() {
        let w = MaintenanceWindow::parse("02:00-02:00").unwrap();
        assert!(!w.in_window(at(2, 0)));
        assert!(!w.in_window(at(0, 0)));
        assert!(!w.in_window(at(23, 59)));
    }

    #[test]
    fn rejects_bad_format() {
        assert!(MaintenanceWindow::parse("0200-0400").is_err());
        assert!(MaintenanceWindow::parse("02:00").is_err());
        assert!(MaintenanceWindow::parse("25:00-04:00").is_err());
    }

    #[test]
    fn next_window_start_same_day() {
        let w = MaintenanceWindow::parse("02:00-04:00").unwrap();
        let next = w.next_window_start(at(0, 0));
        assert_eq!(next, at(2, 0));
    }

    #[test]
    fn next_window_start_rolls_to_tomorrow() {
        let w = MaintenanceWindow::parse("02:00-04:00").unwrap();
        let next = w.next_window_start(at(10, 0));
        assert_eq!(next.date_naive(), at(10, 0).date_naive().succ_opt().unwrap());
    }

    #[test]
    fn already_in_window_returns_now() {
        let w = MaintenanceWindow::parse("02:00-04:00").unwrap();
        let now = at(3, 0);
        assert_eq!(w.next_window_start(now), now);
    }
}
