//! Startup import of previously written day files into the sample ring.
//!
//! Before the first device connection is accepted, the gateway rebuilds its
//! in-memory history from disk:
//!
//! 1. yesterday's file (UTC), keeping only rows inside the trailing 24 h window
//! 2. today's file, all rows
//!
//! Derived quantities are recomputed from the raw readings and every row must be
//! strictly newer than the last buffered sample. Malformed rows are counted and
//! skipped; a missing file is not an error.

use crate::data::day_file::day_file_name_at;
use crate::data::ring_buffer::SampleRing;
use crate::error::{AppResult, DaqError};
use crate::measurement::PowerSample;
use chrono::{DateTime, Duration, Utc};
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info, warn};

/// Width of the window imported from yesterday's file, in seconds.
pub const RECOVERY_WINDOW_SECS: i64 = 24 * 3600;

/// Per-file (or cumulative) import counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    /// Rows stored in the ring.
    pub accepted: usize,
    /// Valid rows outside the window or not newer than the ring's last sample.
    pub stale: usize,
    /// Rows that could not be parsed.
    pub malformed: usize,
}

impl ImportStats {
    fn merge(&mut self, other: ImportStats) {
        self.accepted += other.accepted;
        self.stale += other.stale;
        self.malformed += other.malformed;
    }
}

/// Parsed content of one day file.
#[derive(Debug, Default)]
pub struct DayFileContents {
    /// Successfully parsed rows in file order.
    pub samples: Vec<PowerSample>,
    /// Number of rows that were skipped.
    pub malformed: usize,
}

/// Parse a day file, skipping rows that are not valid samples.
///
/// Only a failure to open the file is returned as an error.
pub fn read_day_file(path: &Path) -> AppResult<DayFileContents> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut contents = DayFileContents::default();
    let mut record = csv::StringRecord::new();

    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                let fields: Vec<&str> = record.iter().collect();
                match PowerSample::from_row(&fields) {
                    Ok(sample) => contents.samples.push(sample),
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "Skipping malformed row");
                        contents.malformed += 1;
                    }
                }
            }
            Err(e) => {
                if matches!(e.kind(), csv::ErrorKind::Io(_)) {
                    warn!(path = %path.display(), error = %e, "Stopped reading day file");
                    break;
                }
                debug!(path = %path.display(), error = %e, "Skipping unreadable row");
                contents.malformed += 1;
            }
        }
    }

    Ok(contents)
}

/// Import one day file into `ring`, keeping rows with `timestamp >= not_before`.
///
/// A missing file yields empty stats.
pub fn import_day_file(
    ring: &SampleRing,
    path: &Path,
    not_before: Option<i64>,
) -> AppResult<ImportStats> {
    let contents = match read_day_file(path) {
        Ok(contents) => contents,
        Err(DaqError::Csv(e))
            if matches!(e.kind(), csv::ErrorKind::Io(io) if io.kind() == ErrorKind::NotFound) =>
        {
            debug!(path = %path.display(), "No day file to recover");
            return Ok(ImportStats::default());
        }
        Err(e) => return Err(e),
    };

    let mut stats = ImportStats {
        malformed: contents.malformed,
        ..ImportStats::default()
    };

    for sample in contents.samples {
        let in_window = not_before.map_or(true, |min| sample.timestamp >= min);
        if in_window && ring.push_if_newer(sample) {
            stats.accepted += 1;
        } else {
            stats.stale += 1;
        }
    }

    info!(
        path = %path.display(),
        accepted = stats.accepted,
        stale = stats.stale,
        malformed = stats.malformed,
        "Recovered day file"
    );
    Ok(stats)
}

/// Rebuild the ring from yesterday's and today's day files in `dir`.
///
/// Best effort: a file that cannot be opened is logged and ignored.
pub fn recover(ring: &SampleRing, dir: &Path, now: DateTime<Utc>) -> ImportStats {
    let yesterday = now - Duration::days(1);
    let window_start = now.timestamp() - RECOVERY_WINDOW_SECS;

    let sources = [
        (day_file_name_at(yesterday), Some(window_start)),
        (day_file_name_at(now), None),
    ];

    let mut total = ImportStats::default();
    for (name, not_before) in sources {
        let path = dir.join(&name);
        match import_day_file(ring, &path, not_before) {
            Ok(stats) => total.merge(stats),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping day file during recovery"),
        }
    }

    info!(
        accepted = total.accepted,
        last_timestamp = ?ring.last_timestamp(),
        "Startup recovery finished"
    );
    total
}
