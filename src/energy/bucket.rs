//! Per-sample energy contributions and the keys of the buckets they land in.

use crate::measurement::PowerSample;
use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

/// Watt-seconds per kilowatt-hour.
pub const WATT_SECONDS_PER_KWH: f64 = 3600.0 * 1000.0;

/// Contribution of one 1 s sample to every bucket it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyDelta {
    /// Raw sample timestamp (minute watermark).
    pub timestamp: i64,
    /// Billed active power (W).
    pub total_active_power: f64,
    /// Active energy (kWh).
    pub active_energy: f64,
    /// Reactive energy (kvarh).
    pub reactive_energy: f64,
    /// `rate * active_energy`.
    pub cost: f64,
}

impl EnergyDelta {
    /// Integrate one sample over one second at `rate` per kWh.
    pub fn from_sample(sample: &PowerSample, rate: f64) -> Self {
        let total_active_power = sample.billed_active_power();
        let active_energy = total_active_power / WATT_SECONDS_PER_KWH;
        let reactive_energy = sample.billed_reactive_power() / WATT_SECONDS_PER_KWH;

        Self {
            timestamp: sample.timestamp,
            total_active_power,
            active_energy,
            reactive_energy,
            cost: rate * active_energy,
        }
    }

    /// Start of the minute containing this sample.
    pub fn minute_key(&self) -> i64 {
        minute_key(self.timestamp)
    }
}

/// `timestamp - timestamp mod 60`, floored for pre-epoch values too.
pub fn minute_key(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(60)
}

/// Calendar day bucket, in the local time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DayKey {
    /// Calendar year
    pub year: i32,
    /// 1-12
    pub month: u32,
    /// 1-31
    pub day: u32,
}

/// Calendar hour bucket, in the local time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HourKey {
    /// Calendar year
    pub year: i32,
    /// 1-12
    pub month: u32,
    /// 1-31
    pub day: u32,
    /// 0-23
    pub hour: u32,
}

impl HourKey {
    /// The day this hour belongs to.
    pub fn day(&self) -> DayKey {
        DayKey {
            year: self.year,
            month: self.month,
            day: self.day,
        }
    }

    /// Hour containing `timestamp` in zone `tz`.
    pub fn in_zone<Tz: TimeZone>(timestamp: i64, tz: &Tz) -> Option<Self> {
        let utc = DateTime::from_timestamp(timestamp, 0)?;
        let local = utc.with_timezone(tz);
        Some(Self {
            year: local.year(),
            month: local.month(),
            day: local.day(),
            hour: local.hour(),
        })
    }

    /// Hour containing `timestamp` in the host's local time zone.
    pub fn local(timestamp: i64) -> Option<Self> {
        Self::in_zone(timestamp, &Local)
    }
}

/// Stored state of one minute bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinuteBucket {
    /// First second of the minute.
    pub timestamp: i64,
    /// Highest sample timestamp already folded in.
    pub latest_second: i64,
    /// Samples folded in.
    pub second_count: i64,
    /// Active energy in kWh.
    pub active: f64,
    /// Reactive energy in kvarh.
    pub reactive: f64,
    /// Lowest total active power seen, in W.
    pub min_p: f64,
    /// Accumulated cost at the rate in force per sample.
    pub cost: f64,
}

/// Stored state of an hour or day bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergyTotals {
    /// Samples folded in.
    pub second_count: i64,
    /// Active energy in kWh.
    pub active: f64,
    /// Reactive energy in kvarh.
    pub reactive: f64,
    /// Lowest total active power seen, in W.
    pub min_p: f64,
    /// Accumulated cost.
    pub cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    #[test]
    fn test_delta_uses_two_phases() {
        let sample = PowerSample::new(
            1_700_000_041,
            [230.0, 230.0, 230.0],
            [2.0, 1.0, 5.0],
            [360.0, 180.0, 1000.0],
        );
        let delta = EnergyDelta::from_sample(&sample, 0.5);

        assert_eq!(delta.total_active_power, 540.0);
        assert!((delta.active_energy - 540.0 / 3_600_000.0).abs() < 1e-15);
        let q = sample.reactive_power[0] + sample.reactive_power[1];
        assert!((delta.reactive_energy - q / 3_600_000.0).abs() < 1e-15);
        assert!((delta.cost - 0.5 * delta.active_energy).abs() < 1e-15);
        assert_eq!(delta.minute_key(), 1_700_000_040);
    }

    #[test]
    fn test_minute_key() {
        assert_eq!(minute_key(1_700_000_040), 1_700_000_040);
        assert_eq!(minute_key(1_700_000_099), 1_700_000_040);
        assert_eq!(minute_key(-1), -60);
    }

    #[test]
    fn test_hour_key_follows_zone() {
        // 2024-03-07 23:30:00 UTC
        let ts = 1_709_854_200;
        let utc = HourKey::in_zone(ts, &Utc).unwrap();
        assert_eq!((utc.year, utc.month, utc.day, utc.hour), (2024, 3, 7, 23));

        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let local = HourKey::in_zone(ts, &plus_two).unwrap();
        assert_eq!((local.day, local.hour), (8, 1));
        assert_eq!(local.day(), DayKey { year: 2024, month: 3, day: 8 });
    }
}
