//! Data types for TIME_OF_DAY and TIME_DIFFERENCE values

use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeDelta};
use core::time::Duration;
use snafu::Snafu;

const MILLIS_PER_DAY: u64 = 86_400_000;

/// Only the lower 28 bits of the millisecond field are transmitted
const MS_MASK: u32 = 0x0FFF_FFFF;

/// Error creating a [`TimeOfDay`]
#[derive(Clone, Copy, Debug, Snafu)]
pub enum TimeCreateError {
    /// The provided time is before the 1984-01-01 epoch and cannot be represented
    PreEpoch,
    /// The provided time is too far into the future to be represented
    OutOfRange,
    /// The provided date does not exist
    InvalidDate,
}

/// An absolute time, as carried by the TIME message and TIME_OF_DAY objects
///
/// Stored as days since 1984-01-01 and milliseconds after midnight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay(TimeDifference);

impl TimeOfDay {
    /// Encoded size in bytes
    pub const SIZE: usize = 6;

    /// 1984-01-01 00:00:00
    pub const EPOCH: TimeOfDay = TimeOfDay(TimeDifference::ZERO);

    const CHRONO_EPOCH: NaiveDateTime = match NaiveDate::from_ymd_opt(1984, 1, 1) {
        Some(date) => date.and_time(chrono::NaiveTime::MIN),
        None => NaiveDateTime::MIN,
    };

    /// Create a new TimeOfDay from days since 1984-01-01 and milliseconds after midnight
    pub const fn new(days: u16, ms: u32) -> Self {
        Self(TimeDifference::new(days, ms))
    }

    /// Create a TimeOfDay from a calendar date and time
    pub fn from_ymd_hms_ms(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
        milli: u32,
    ) -> Result<Self, TimeCreateError> {
        let datetime = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_milli_opt(hour, min, sec, milli))
            .ok_or(TimeCreateError::InvalidDate)?;
        Self::from_chrono(datetime)
    }

    fn from_chrono(datetime: NaiveDateTime) -> Result<Self, TimeCreateError> {
        let delta = datetime - Self::CHRONO_EPOCH;
        let days = delta.num_days();
        let ms = (delta - TimeDelta::days(days)).num_milliseconds();
        if days < 0 {
            PreEpochSnafu.fail()
        } else if days > u16::MAX as i64 {
            OutOfRangeSnafu.fail()
        } else {
            Ok(Self::new(days as u16, ms as u32))
        }
    }

    /// Convert a [`std::time::SystemTime`] into a TimeOfDay
    #[cfg(feature = "std")]
    #[cfg_attr(docsrs, doc(cfg(feature = "std")))]
    pub fn from_system_time(time: std::time::SystemTime) -> Result<Self, TimeCreateError> {
        let since_unix = time
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map_err(|_| TimeCreateError::PreEpoch)?;
        let datetime = chrono::DateTime::from_timestamp_millis(since_unix.as_millis() as i64)
            .ok_or(TimeCreateError::OutOfRange)?
            .naive_utc();
        Self::from_chrono(datetime)
    }

    /// Decode from the 6-byte little endian wire format
    pub fn from_le_bytes(bytes: [u8; 6]) -> Self {
        Self(TimeDifference::from_le_bytes(bytes))
    }

    /// Encode to the 6-byte little endian wire format
    pub fn to_le_bytes(&self) -> [u8; 6] {
        self.0.to_le_bytes()
    }

    /// Get the date as (year, month, day)
    pub fn date_ymd(&self) -> (i32, u32, u32) {
        let date = Self::CHRONO_EPOCH + TimeDelta::days(self.0.days as i64);
        (date.year(), date.month(), date.day())
    }

    /// Days since 1984-01-01
    pub fn days(&self) -> u16 {
        self.0.days
    }

    /// Get the time of day as (hour, min, sec, millis)
    pub fn time_hmsm(&self) -> (u32, u32, u32, u32) {
        let ms = self.0.ms;
        let secs = ms / 1000;
        (secs / 3600, (secs / 60) % 60, secs % 60, ms % 1000)
    }

    /// Milliseconds after midnight
    pub fn time_millis(&self) -> u32 {
        self.0.ms
    }

    /// Total milliseconds since 1984-01-01
    pub fn total_millis(&self) -> u64 {
        self.0.total_millis()
    }
}

impl core::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (y, mo, d) = self.date_ymd();
        let (h, mi, s, ms) = self.time_hmsm();
        write!(f, "{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}.{ms:03}")
    }
}

/// A duration, as stored in TIME_DIFFERENCE objects
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeDifference {
    // Field order gives days-major ordering
    days: u16,
    ms: u32,
}

impl TimeDifference {
    /// Encoded size in bytes
    pub const SIZE: usize = 6;

    /// A zero time difference
    pub const ZERO: TimeDifference = TimeDifference { ms: 0, days: 0 };

    /// Create a new time difference
    pub const fn new(days: u16, ms: u32) -> Self {
        Self {
            ms: ms & MS_MASK,
            days,
        }
    }

    /// Decode from the 6-byte little endian wire format
    pub fn from_le_bytes(bytes: [u8; 6]) -> Self {
        let ms = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let days = u16::from_le_bytes([bytes[4], bytes[5]]);
        Self::new(days, ms)
    }

    /// Encode to the 6-byte little endian wire format
    pub fn to_le_bytes(&self) -> [u8; 6] {
        let mut bytes = [0; 6];
        bytes[0..4].copy_from_slice(&self.ms.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.days.to_le_bytes());
        bytes
    }

    /// Total milliseconds
    pub fn total_millis(&self) -> u64 {
        self.days as u64 * MILLIS_PER_DAY + self.ms as u64
    }

    /// Convert to a [`Duration`]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.total_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_of_day_from_calendar() {
        let t = TimeOfDay::from_ymd_hms_ms(1984, 1, 2, 1, 2, 3, 4).unwrap();
        assert_eq!(1, t.days());
        assert_eq!((1984, 1, 2), t.date_ymd());
        assert_eq!((1, 2, 3, 4), t.time_hmsm());
        assert_eq!(t, TimeOfDay::from_le_bytes(t.to_le_bytes()));
        assert!(TimeOfDay::from_ymd_hms_ms(1983, 12, 31, 0, 0, 0, 0).is_err());
    }

    #[test]
    fn system_time_conversion() {
        // 1984-01-01 is 5113 days after the unix epoch
        let t = std::time::SystemTime::UNIX_EPOCH
            + Duration::from_millis(5114 * MILLIS_PER_DAY + 1500);
        let tod = TimeOfDay::from_system_time(t).unwrap();
        assert_eq!(1, tod.days());
        assert_eq!(1500, tod.time_millis());
    }
}
