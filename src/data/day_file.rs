//! Daily CSV persistence of accepted samples.
//!
//! Each UTC calendar day gets its own file named `pd-YYYY-MM-DD.csv` in the
//! configured data directory. The acquisition loop calls
//! [`DayFileWriter::rotate_if_needed`] before every poll; when the UTC date has
//! moved on, the current file is flushed and closed and the new day's file is
//! created in truncate mode.
//!
//! Failing to create the new file is reported as [`DaqError::DayFileRotation`],
//! which the caller must treat as fatal.

use crate::error::{AppResult, DaqError};
use crate::measurement::PowerSample;
use chrono::{DateTime, NaiveDate, Utc};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// File name of the day file for a UTC date.
pub fn day_file_name(date: NaiveDate) -> String {
    format!("pd-{}.csv", date.format("%Y-%m-%d"))
}

/// File name of the day file that covers instant `at`.
pub fn day_file_name_at(at: DateTime<Utc>) -> String {
    day_file_name(at.date_naive())
}

/// How to open the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Keep existing rows (startup, the file may hold today's earlier data).
    Append,
    /// Start empty (rotation into a new day).
    Truncate,
}

fn open_csv(path: &Path, mode: OpenMode) -> std::io::Result<csv::Writer<File>> {
    let mut options = OpenOptions::new();
    options.create(true);
    match mode {
        OpenMode::Append => options.append(true),
        OpenMode::Truncate => options.write(true).truncate(true),
    };

    let file = options.open(path)?;
    Ok(csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file))
}

/// Writer for the currently active day file.
pub struct DayFileWriter {
    dir: PathBuf,
    name: String,
    writer: csv::Writer<File>,
}

impl DayFileWriter {
    /// Open (append mode) the day file for instant `now` inside `dir`.
    ///
    /// The directory is created if missing. A failure here is reported as
    /// [`DaqError::DayFileRotation`] because the gateway cannot run without it.
    pub fn open(dir: &Path, now: DateTime<Utc>) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;

        let name = day_file_name_at(now);
        let path = dir.join(&name);
        let writer = open_csv(&path, OpenMode::Append)
            .map_err(|source| DaqError::DayFileRotation { path, source })?;

        Ok(Self {
            dir: dir.to_path_buf(),
            name,
            writer,
        })
    }

    /// Switch to a new file if the UTC date of `now` differs from the open file's.
    ///
    /// Returns `true` when a rotation happened.
    pub fn rotate_if_needed(&mut self, now: DateTime<Utc>) -> AppResult<bool> {
        let expected = day_file_name_at(now);
        if expected == self.name {
            return Ok(false);
        }

        info!(from = %self.name, to = %expected, "Changing to new day file");

        if let Err(e) = self.writer.flush() {
            error!(file = %self.name, error = %e, "Failed to flush day file before rotation");
        }

        let path = self.dir.join(&expected);
        let writer = open_csv(&path, OpenMode::Truncate).map_err(|source| {
            error!(path = %path.display(), error = %source, "Failed to create new day file");
            DaqError::DayFileRotation {
                path: path.clone(),
                source,
            }
        })?;

        // Replacing the writer drops (and closes) the previous day's file
        self.writer = writer;
        self.name = expected;
        Ok(true)
    }

    /// Append one sample row. Buffered until [`flush`](Self::flush).
    pub fn append(&mut self, sample: &PowerSample) -> AppResult<()> {
        self.writer.write_record(sample.to_row())?;
        Ok(())
    }

    /// Push buffered rows to the operating system.
    pub fn flush(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Name of the open file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full path of the open file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }
}
