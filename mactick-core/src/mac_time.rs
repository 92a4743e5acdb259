//! Guest wall-clock value
//!
//! The classic Mac keeps local time as unsigned seconds since
//! 1904-01-01 00:00:00. It wraps in 2040; we truncate like the hardware.

use chrono::{Local, NaiveDateTime};

/// Seconds between 1904-01-01 and 1970-01-01
pub const MAC_EPOCH_OFFSET: i64 = 2_082_844_800;

/// Convert a local date/time to guest seconds.
pub fn mac_seconds(local: NaiveDateTime) -> u32 {
    (local.and_utc().timestamp() + MAC_EPOCH_OFFSET) as u32
}

/// Current local time in guest seconds.
pub fn mac_seconds_now() -> u32 {
    mac_seconds(Local::now().naive_local())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_unix_epoch() {
        let unix_epoch = NaiveDate::from_ymd_opt(1970, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(mac_seconds(unix_epoch) as i64, MAC_EPOCH_OFFSET);
    }

    #[test]
    fn test_mac_epoch_is_zero() {
        let mac_epoch = NaiveDate::from_ymd_opt(1904, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(mac_seconds(mac_epoch), 0);
        assert_eq!(mac_seconds(mac_epoch - chrono::Duration::seconds(1)), u32::MAX);
    }

    #[test]
    fn test_wraps_after_2040() {
        // 2040-02-06 06:28:16 is 2^32 seconds after the Mac epoch
        let wrap = NaiveDate::from_ymd_opt(2040, 2, 6)
            .unwrap()
            .and_hms_opt(6, 28, 16)
            .unwrap();
        assert_eq!(mac_seconds(wrap), 0);
    }

    #[test]
    fn test_now_is_past_2020() {
        let y2020 = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        // Valid until the 2040 wrap
        assert!(mac_seconds_now() > mac_seconds(y2020));
    }
}
