// Timestamp handling for Xbox 360 formats
// XTAF and STFS use the MS-DOS packed date/time pair, GPD files use Windows FILETIME

use chrono::{NaiveDate, NaiveDateTime};

/// Seconds between 1601-01-01 and 1970-01-01
const FILETIME_EPOCH_DIFF: i64 = 11_644_473_600;

/// Split a packed FAT date into (day, month, year)
/// Bits 0-4: day, 5-8: month, 9-15: years since 1980
pub fn fat_date(date: u16) -> (u32, u32, i32) {
    let day = (date & 0x001F) as u32;
    let month = ((date & 0x01E0) >> 5) as u32;
    let year = ((date & 0xFE00) >> 9) as i32 + 1980;
    (day, month, year)
}

/// Split a packed FAT time into (hours, minutes, seconds)
/// Bits 0-4: seconds / 2, 5-10: minutes, 11-15: hours
pub fn fat_time(time: u16) -> (u32, u32, u32) {
    let seconds = 2 * (time & 0x001F) as u32;
    let minutes = ((time & 0x07E0) >> 5) as u32;
    let hours = ((time & 0xF800) >> 11) as u32;
    (hours, minutes, seconds)
}

/// Decode a FAT date/time pair, `None` when the fields don't form a real date
pub fn fat_datetime(date: u16, time: u16) -> Option<NaiveDateTime> {
    let (day, month, year) = fat_date(date);
    let (hours, minutes, seconds) = fat_time(time);
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hours, minutes, seconds)
}

/// FAT date/time to Unix seconds, 0 for undecodable values
/// On-disk FAT times are treated as UTC
pub fn fat_datetime_to_unix(date: u16, time: u16) -> i64 {
    fat_datetime(date, time)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

/// Windows FILETIME (100ns ticks since 1601) to Unix seconds, clamped at 0
pub fn filetime_to_unix(filetime: i64) -> i64 {
    (filetime / 10_000_000 - FILETIME_EPOCH_DIFF).max(0)
}

/// Windows FILETIME to a UTC date/time, `None` for values before the Unix epoch
pub fn filetime_to_datetime(filetime: i64) -> Option<NaiveDateTime> {
    let secs = filetime_to_unix(filetime);
    if secs == 0 {
        return None;
    }
    chrono::DateTime::from_timestamp(secs, 0).map(|dt| dt.naive_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fat_date_fields() {
        // 0b0011001_1011_10110 is 22 Nov 2005
        assert_eq!(fat_date(0b0011_0011_0111_0110), (22, 11, 2005));
    }

    #[test]
    fn test_fat_time_fields() {
        // 14:30:58
        let packed = (14 << 11) | (30 << 5) | 29;
        assert_eq!(fat_time(packed), (14, 30, 58));
    }

    #[test]
    fn test_fat_datetime_to_unix() {
        // 2024-01-15 14:30:00 UTC
        let date = ((2024 - 1980) << 9) | (1 << 5) | 15;
        let time = (14 << 11) | (30 << 5);
        assert_eq!(fat_datetime_to_unix(date, time), 1_705_329_000);
    }

    #[test]
    fn test_invalid_fat_datetime() {
        // Month 0 and day 0 are not dates
        assert!(fat_datetime(0, 0).is_none());
        assert_eq!(fat_datetime_to_unix(0, 0), 0);
    }

    #[test]
    fn test_filetime_conversion() {
        // 2009-02-13 23:31:30 UTC
        let filetime = (1_234_567_890 + FILETIME_EPOCH_DIFF) * 10_000_000;
        assert_eq!(filetime_to_unix(filetime), 1_234_567_890);
        assert_eq!(
            filetime_to_datetime(filetime).unwrap().to_string(),
            "2009-02-13 23:31:30"
        );
        assert_eq!(filetime_to_unix(0), 0);
        assert!(filetime_to_datetime(0).is_none());
    }
}
