//! Minute, hour and day energy aggregates in SQLite.
//!
//! Every accepted sample contributes one [`EnergyDelta`] to three buckets. The
//! three upserts run in a single transaction so a sample is either folded into
//! all of them or into none.
//!
//! - **minute** (`energy_minutes`, keyed by the minute's first second): guarded by
//!   the `latest_second` watermark, re-applying a timestamp is a no-op
//! - **hour** (`energy_hours`) and **day** (`energy_days`), keyed by local
//!   calendar fields: no watermark, the acquisition loop's monotonic timestamp
//!   check guarantees each sample is recorded at most once
//!
//! A connection is opened per sample with a bounded busy timeout, so the query
//! layer can read the same database file concurrently.

pub mod bucket;

pub use bucket::{minute_key, DayKey, EnergyDelta, EnergyTotals, HourKey, MinuteBucket};

use crate::config::ConfigLookup;
use crate::error::{AppResult, DaqError};
use crate::measurement::PowerSample;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Setting holding the price of one kWh.
pub const RATE_KEY: &str = "kwh_rate";

/// Accepted range of the per-kWh rate.
pub const RATE_RANGE: (f64, f64) = (0.0, 10.0);

const ENERGY_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS energy_minutes (
    timestamp       INTEGER PRIMARY KEY,
    latest_second   INTEGER NOT NULL,
    second_count    INTEGER NOT NULL DEFAULT 1,
    active          REAL    NOT NULL,
    reactive        REAL    NOT NULL,
    min_p           REAL    NOT NULL,
    cost            REAL    NOT NULL
);
CREATE TABLE IF NOT EXISTS energy_hours (
    year            INTEGER NOT NULL,
    month           INTEGER NOT NULL,
    day             INTEGER NOT NULL,
    hour            INTEGER NOT NULL,
    second_count    INTEGER NOT NULL DEFAULT 1,
    active          REAL    NOT NULL,
    reactive        REAL    NOT NULL,
    min_p           REAL    NOT NULL,
    cost            REAL    NOT NULL,
    PRIMARY KEY (year, month, day, hour)
);
CREATE TABLE IF NOT EXISTS energy_days (
    year            INTEGER NOT NULL,
    month           INTEGER NOT NULL,
    day             INTEGER NOT NULL,
    second_count    INTEGER NOT NULL DEFAULT 1,
    active          REAL    NOT NULL,
    reactive        REAL    NOT NULL,
    min_p           REAL    NOT NULL,
    cost            REAL    NOT NULL,
    PRIMARY KEY (year, month, day)
);
";

const UPSERT_MINUTE: &str = "INSERT INTO energy_minutes(timestamp, latest_second, active, reactive, min_p, cost) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
     ON CONFLICT(timestamp) DO UPDATE SET \
         second_count = second_count + 1, \
         latest_second = excluded.latest_second, \
         active = active + excluded.active, \
         reactive = reactive + excluded.reactive, \
         min_p = min(min_p, excluded.min_p), \
         cost = cost + excluded.cost \
     WHERE latest_second < excluded.latest_second";

const UPSERT_HOUR: &str = "INSERT INTO energy_hours(year, month, day, hour, active, reactive, min_p, cost) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
     ON CONFLICT(year, month, day, hour) DO UPDATE SET \
         second_count = second_count + 1, \
         active = active + excluded.active, \
         reactive = reactive + excluded.reactive, \
         min_p = min(min_p, excluded.min_p), \
         cost = cost + excluded.cost";

const UPSERT_DAY: &str = "INSERT INTO energy_days(year, month, day, active, reactive, min_p, cost) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
     ON CONFLICT(year, month, day) DO UPDATE SET \
         second_count = second_count + 1, \
         active = active + excluded.active, \
         reactive = reactive + excluded.reactive, \
         min_p = min(min_p, excluded.min_p), \
         cost = cost + excluded.cost";

/// Folds accepted samples into the energy tables.
#[derive(Clone)]
pub struct EnergyAggregator {
    path: PathBuf,
    busy_timeout: Duration,
    lookup: Arc<dyn ConfigLookup>,
}

impl EnergyAggregator {
    /// Use the database at `path`, creating the energy tables if missing.
    pub fn open(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
        lookup: Arc<dyn ConfigLookup>,
    ) -> AppResult<Self> {
        let aggregator = Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
            lookup,
        };

        if let Some(parent) = aggregator.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = aggregator.connect()?;
        conn.execute_batch(ENERGY_SCHEMA)?;
        debug!(path = %aggregator.path.display(), "Energy tables ready");

        Ok(aggregator)
    }

    /// Database file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> AppResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    /// Record one accepted sample in its minute, hour and day buckets.
    ///
    /// The rate is looked up for every call. Hour and day keys use local time.
    pub fn record_sample(&self, sample: &PowerSample) -> AppResult<EnergyDelta> {
        let (min, max) = RATE_RANGE;
        let rate = self.lookup.lookup_f64(RATE_KEY, 0.0, min, max);
        let delta = EnergyDelta::from_sample(sample, rate);

        let hour = HourKey::local(sample.timestamp)
            .ok_or(DaqError::InvalidTimestamp(sample.timestamp))?;

        self.record_delta(&delta, hour)?;
        Ok(delta)
    }

    /// Apply `delta` to the minute bucket and to the given hour and its day.
    ///
    /// All three upserts commit together or not at all.
    pub fn record_delta(&self, delta: &EnergyDelta, hour: HourKey) -> AppResult<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        let minute_rows = tx.execute(
            UPSERT_MINUTE,
            params![
                delta.minute_key(),
                delta.timestamp,
                delta.active_energy,
                delta.reactive_energy,
                delta.total_active_power,
                delta.cost
            ],
        )?;

        tx.execute(
            UPSERT_HOUR,
            params![
                hour.year,
                hour.month,
                hour.day,
                hour.hour,
                delta.active_energy,
                delta.reactive_energy,
                delta.total_active_power,
                delta.cost
            ],
        )?;

        tx.execute(
            UPSERT_DAY,
            params![
                hour.year,
                hour.month,
                hour.day,
                delta.active_energy,
                delta.reactive_energy,
                delta.total_active_power,
                delta.cost
            ],
        )?;

        tx.commit()?;

        if minute_rows == 0 {
            debug!(timestamp = delta.timestamp, "Minute bucket already holds this second");
        }
        trace!(timestamp = delta.timestamp, active = delta.active_energy, "Energy recorded");
        Ok(())
    }

    /// Minute bucket starting at `minute` (a multiple of 60).
    pub fn minute_bucket(&self, minute: i64) -> AppResult<Option<MinuteBucket>> {
        let conn = self.connect()?;
        let bucket = conn
            .query_row(
                "SELECT timestamp, latest_second, second_count, active, reactive, min_p, cost \
                 FROM energy_minutes WHERE timestamp = ?1",
                params![minute],
                |row| {
                    Ok(MinuteBucket {
                        timestamp: row.get(0)?,
                        latest_second: row.get(1)?,
                        second_count: row.get(2)?,
                        active: row.get(3)?,
                        reactive: row.get(4)?,
                        min_p: row.get(5)?,
                        cost: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(bucket)
    }

    /// Totals of one local hour, `None` when no sample fell into it.
    pub fn hour_bucket(&self, key: HourKey) -> AppResult<Option<EnergyTotals>> {
        let conn = self.connect()?;
        let totals = conn
            .query_row(
                "SELECT second_count, active, reactive, min_p, cost FROM energy_hours \
                 WHERE year = ?1 AND month = ?2 AND day = ?3 AND hour = ?4",
                params![key.year, key.month, key.day, key.hour],
                totals_from_row,
            )
            .optional()?;
        Ok(totals)
    }

    /// Totals of one local day.
    pub fn day_bucket(&self, key: DayKey) -> AppResult<Option<EnergyTotals>> {
        let conn = self.connect()?;
        let totals = conn
            .query_row(
                "SELECT second_count, active, reactive, min_p, cost FROM energy_days \
                 WHERE year = ?1 AND month = ?2 AND day = ?3",
                params![key.year, key.month, key.day],
                totals_from_row,
            )
            .optional()?;
        Ok(totals)
    }
}

fn totals_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EnergyTotals> {
    Ok(EnergyTotals {
        second_count: row.get(0)?,
        active: row.get(1)?,
        reactive: row.get(2)?,
        min_p: row.get(3)?,
        cost: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn aggregator(dir: &tempfile::TempDir, rate: f64) -> EnergyAggregator {
        let mut settings = Settings::default();
        settings.set(RATE_KEY, rate);
        EnergyAggregator::open(
            dir.path().join("energy.db"),
            Duration::from_millis(1000),
            Arc::new(settings),
        )
        .unwrap()
    }

    fn sample(ts: i64, p0: f64, p1: f64) -> PowerSample {
        PowerSample::new(ts, [230.0, 230.0, 230.0], [2.0, 2.0, 2.0], [p0, p1, 50.0])
    }

    #[test]
    fn test_first_sample_creates_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let energy = aggregator(&dir, 0.2);
        let s = sample(1_700_000_045, 300.0, 100.0);

        let delta = energy.record_sample(&s).unwrap();

        let minute = energy.minute_bucket(1_700_000_040).unwrap().unwrap();
        assert_eq!(minute.second_count, 1);
        assert_eq!(minute.latest_second, 1_700_000_045);
        assert_eq!(minute.min_p, 400.0);
        assert!((minute.active - delta.active_energy).abs() < 1e-15);
        assert!((minute.cost - 0.2 * delta.active_energy).abs() < 1e-15);

        let hour = HourKey::local(s.timestamp).unwrap();
        let hour_totals = energy.hour_bucket(hour).unwrap().unwrap();
        let day_totals = energy.day_bucket(hour.day()).unwrap().unwrap();
        assert_eq!(hour_totals.second_count, 1);
        assert_eq!(day_totals.second_count, 1);
    }

    #[test]
    fn test_accumulates_and_tracks_min_power() {
        let dir = tempfile::tempdir().unwrap();
        let energy = aggregator(&dir, 0.0);

        let mut expected = 0.0;
        for (offset, (p0, p1)) in [(500.0, 100.0), (200.0, 50.0), (400.0, 400.0)]
            .into_iter()
            .enumerate()
        {
            let delta = energy
                .record_sample(&sample(1_700_000_040 + offset as i64, p0, p1))
                .unwrap();
            expected += delta.active_energy;
        }

        let minute = energy.minute_bucket(1_700_000_040).unwrap().unwrap();
        assert_eq!(minute.second_count, 3);
        assert_eq!(minute.min_p, 250.0);
        assert!((minute.active - expected).abs() < 1e-12);
        assert_eq!(minute.cost, 0.0);
    }

    #[test]
    fn test_minute_watermark_makes_replay_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let energy = aggregator(&dir, 1.0);
        let s = sample(1_700_000_050, 300.0, 300.0);

        energy.record_sample(&s).unwrap();
        let before = energy.minute_bucket(1_700_000_040).unwrap().unwrap();

        energy.record_sample(&s).unwrap();
        let after = energy.minute_bucket(1_700_000_040).unwrap().unwrap();
        assert_eq!(before, after);

        // Older second in the same minute is ignored as well
        energy.record_sample(&sample(1_700_000_041, 1.0, 1.0)).unwrap();
        let older = energy.minute_bucket(1_700_000_040).unwrap().unwrap();
        assert_eq!(before, older);
    }

    #[test]
    fn test_rate_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let energy = aggregator(&dir, 99.0);
        let delta = energy.record_sample(&sample(60, 1000.0, 0.0)).unwrap();
        assert!((delta.cost - 10.0 * delta.active_energy).abs() < 1e-15);
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let first = aggregator(&dir, 0.0);
        first.record_sample(&sample(120, 10.0, 10.0)).unwrap();

        let second = aggregator(&dir, 0.0);
        assert!(second.minute_bucket(120).unwrap().is_some());
        assert!(second.minute_bucket(180).unwrap().is_none());
    }

    #[test]
    fn test_failed_upsert_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let energy = aggregator(&dir, 0.0);

        // Break only the day table so the third upsert fails
        let conn = Connection::open(energy.path()).unwrap();
        conn.execute_batch("DROP TABLE energy_days").unwrap();
        drop(conn);

        let s = sample(1_700_000_100, 100.0, 100.0);
        assert!(energy.record_sample(&s).is_err());
        assert!(energy.minute_bucket(minute_key(s.timestamp)).unwrap().is_none());
        assert!(energy
            .hour_bucket(HourKey::local(s.timestamp).unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_timestamp_beyond_calendar_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let energy = aggregator(&dir, 0.0);

        let err = energy.record_sample(&sample(i64::MAX, 100.0, 100.0)).unwrap_err();
        assert!(matches!(err, DaqError::InvalidTimestamp(i64::MAX)));
        assert!(!err.is_fatal());
    }
}
