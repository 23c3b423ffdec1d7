// dtctl - CLI for the Darktrace API
// Copyright (C) 2024 Mathias Uhl <mathiasuhl@gmx.de>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc};

/// Date format accepted on the command line.
pub const INPUT_DATE_FORMAT: &str = "%d-%m-%Y";
pub const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const RECORD_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl DateRange {
    pub fn contains(&self, moment: NaiveDateTime) -> bool {
        self.start <= moment && moment <= self.end
    }

    pub fn start_millis(&self) -> i64 {
        to_epoch_millis(self.start)
    }

    pub fn end_millis(&self) -> i64 {
        to_epoch_millis(self.end)
    }

    /// `starttime`/`endtime` query parameters in epoch milliseconds.
    pub fn query(&self) -> [(&'static str, String); 2] {
        [
            ("starttime", self.start_millis().to_string()),
            ("endtime", self.end_millis().to_string()),
        ]
    }
}

pub fn parse_input_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), INPUT_DATE_FORMAT)
        .map_err(|_| format!("`{raw}` is not a date in dd-mm-yyyy form"))
}

/// The end date is inclusive up to 23:59:59. Without a start date the range
/// reaches `days` back from `today`.
pub fn determine_date_range(
    days: u32,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<DateRange> {
    let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    let end_date = end.unwrap_or(today);
    let start_date = match start {
        Some(start) => start,
        None => today
            .checked_sub_days(Days::new(u64::from(days)))
            .ok_or_else(|| anyhow!("{days} days before {today} is outside the supported date range"))?,
    };
    Ok(DateRange {
        start: start_date.and_time(NaiveTime::MIN),
        end: end_date.and_time(end_of_day),
    })
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn to_epoch_millis(moment: NaiveDateTime) -> i64 {
    moment.and_utc().timestamp_millis()
}

pub fn from_epoch_millis(millis: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(millis).map(|d| d.naive_utc())
}

/// Formats a `time` field given in epoch milliseconds.
pub fn format_epoch_millis(millis: i64) -> String {
    from_epoch_millis(millis)
        .map(|d| d.format(DISPLAY_FORMAT).to_string())
        .unwrap_or_default()
}

pub fn parse_display(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), DISPLAY_FORMAT).ok()
}

pub fn utc_now_timestamp() -> String {
    Utc::now().format(RECORD_TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parses_day_month_year() {
        assert_eq!(parse_input_date("03-06-2019").unwrap(), date(2019, 6, 3));
        assert!(parse_input_date("2019-06-03").is_err());
    }

    #[test]
    fn test_range_defaults_to_days_before_today() {
        let range = determine_date_range(7, None, None, date(2019, 6, 10)).unwrap();
        assert_eq!(range.start, date(2019, 6, 3).and_hms_opt(0, 0, 0).unwrap());
        assert_eq!(range.end, date(2019, 6, 10).and_hms_opt(23, 59, 59).unwrap());
    }

    #[test]
    fn test_explicit_start_wins_over_days() {
        let range = determine_date_range(
            7,
            Some(date(2019, 1, 1)),
            Some(date(2019, 1, 2)),
            date(2019, 6, 10),
        )
        .unwrap();
        assert_eq!(range.start_millis(), 1_546_300_800_000);
        assert_eq!(range.end_millis(), 1_546_473_599_000);
        assert!(range.contains(date(2019, 1, 2).and_hms_opt(12, 0, 0).unwrap()));
        assert!(!range.contains(date(2019, 1, 3).and_hms_opt(0, 0, 0).unwrap()));
    }

    #[test]
    fn test_days_past_the_calendar_are_an_error() {
        let err = determine_date_range(u32::MAX, None, None, date(2019, 6, 10)).unwrap_err();
        assert!(err.to_string().contains("outside the supported date range"));

        let range = determine_date_range(0, None, None, date(2019, 6, 10)).unwrap();
        assert_eq!(range.start, date(2019, 6, 10).and_hms_opt(0, 0, 0).unwrap());
    }

    #[test]
    fn test_formats_epoch_millis() {
        assert_eq!(format_epoch_millis(1_559_573_892_000), "2019-06-03 14:58:12");
        assert_eq!(
            parse_display("2019-06-03 14:58:12").map(to_epoch_millis),
            Some(1_559_573_892_000)
        );
    }
}
