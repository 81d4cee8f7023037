use chrono::{NaiveDate, NaiveTime};

/// This is the standard way of converting a date to a file name in shiftwatch.
pub fn date_to_record_name(date: NaiveDate) -> String {
    date.format("%Y-%m-%d.json").to_string()
}

/// Half-open check for `[start, end)`. Windows that wrap past midnight are not supported, so
/// `start >= end` never contains anything.
pub fn within_time_range(time: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    start <= time && time < end
}
