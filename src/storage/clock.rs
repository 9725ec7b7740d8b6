use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

/// Seconds covered by one time slot.
pub const INTERVAL_SECS: u32 = 1;
pub const DAY_SECS: u32 = 86_400;
/// Slots per day.
pub const TIMEFRAMES: usize = DAY_SECS.div_ceil(INTERVAL_SECS) as usize;

/// Local calendar date, `YYYY-MM-DD`.
pub type DayKey = String;

pub fn day_key(date: NaiveDate) -> DayKey {
    date.format("%Y-%m-%d").to_string()
}

pub fn time_slot(time: NaiveTime) -> u32 {
    time.num_seconds_from_midnight() / INTERVAL_SECS
}

/// Start of a slot as a time of day; `None` past the end of the day.
pub fn slot_time(slot: u32) -> Option<NaiveTime> {
    let secs = slot.checked_mul(INTERVAL_SECS)?;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, 0)
}

pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

pub fn today() -> DayKey {
    day_key(now().date())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_bounds() {
        assert_eq!(TIMEFRAMES, 86_400);
        assert_eq!(time_slot(NaiveTime::MIN), 0);
        assert_eq!(time_slot(NaiveTime::from_hms_opt(12, 0, 0).unwrap()), 43_200);
        let last = NaiveTime::from_hms_opt(23, 59, 59).unwrap();
        assert_eq!(time_slot(last) as usize, TIMEFRAMES - 1);
    }

    #[test]
    fn test_slot_time() {
        assert_eq!(slot_time(3_661), NaiveTime::from_hms_opt(1, 1, 1));
        assert_eq!(slot_time(DAY_SECS), None);
    }

    #[test]
    fn test_day_key_format() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(day_key(date), "2024-03-07");
    }
}
