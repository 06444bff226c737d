//! Custom error types for the gateway.
//!
//! Two enums cover the whole crate, both built with `thiserror`:
//!
//! - **`CommError`**: failures of a single device exchange. Every variant is
//!   session-local: the acquisition loop logs it, drops the connection and goes
//!   back to waiting for the device.
//! - **`DaqError`**: application-level failures (configuration, storage, file
//!   I/O). Only [`DaqError::DayFileRotation`] is fatal; it is bubbled up to the
//!   supervisor in `main.rs`, which terminates the process.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types
//! so the `?` operator works across module boundaries.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Outcome of a failed request/response exchange with the device.
#[derive(Error, Debug)]
pub enum CommError {
    /// Writing a command failed, or the command could not be framed.
    #[error("Error sending command: {0}")]
    Send(#[source] std::io::Error),

    /// Reading a response failed, timed out or hit end of stream.
    #[error("Error receiving response: {0}")]
    Receive(#[source] std::io::Error),

    /// The trailing HMAC did not authenticate the frame body.
    #[error("Invalid MAC in response")]
    InvalidMac,

    /// An authentic response for another opcode, nonce or counter.
    #[error("Wrong response: {0}")]
    WrongResponse(String),

    /// The frame body or its parameters could not be parsed.
    #[error("Error parsing response: {0}")]
    ParsingResponse(String),

    /// The device reported a non-zero response code.
    #[error("Device answered with response code {0}")]
    ResponseCode(i32),

    /// A line longer than the protocol allows.
    #[error("Frame exceeds {limit} bytes")]
    FrameTooLong {
        /// Maximum accepted frame length, newline excluded.
        limit: usize,
    },
}

impl CommError {
    /// True when the failure came from the transport rather than frame content.
    pub fn is_transport(&self) -> bool {
        matches!(self, CommError::Send(_) | CommError::Receive(_))
    }
}

/// Application-level failure.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Loading or extracting the layered configuration failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A configuration value is present but unusable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or socket failure outside a device exchange.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A device exchange failed; ends the current session only.
    #[error("Device communication error: {0}")]
    Comm(#[from] CommError),

    /// SQLite rejected a statement or transaction.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Reading or writing a day file record failed.
    #[error("Day file error: {0}")]
    Csv(#[from] csv::Error),

    /// A sample timestamp that has no local calendar hour.
    #[error("Timestamp {0} is outside the representable calendar range")]
    InvalidTimestamp(i64),

    /// Opening the next day file failed. Fatal.
    #[error("Failed to open day file {}: {source}", path.display())]
    DayFileRotation {
        /// File that could not be created.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A blocking task panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    Task(String),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// Errors after which the process must not keep running.
    ///
    /// Losing the writable day file means every further sample would only live
    /// in memory, so rotation failures stop the whole gateway.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DaqError::DayFileRotation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn only_rotation_failures_are_fatal() {
        let fatal = DaqError::DayFileRotation {
            path: PathBuf::from("pd-2024-01-02.csv"),
            source: Error::new(ErrorKind::PermissionDenied, "read-only"),
        };
        assert!(fatal.is_fatal());
        assert!(fatal.to_string().contains("pd-2024-01-02.csv"));

        let comm: DaqError = CommError::InvalidMac.into();
        assert!(!comm.is_fatal());
        assert!(!DaqError::Configuration("bad".into()).is_fatal());
    }

    #[test]
    fn transport_errors_are_classified() {
        let timeout = CommError::Receive(Error::new(ErrorKind::TimedOut, "2s"));
        assert!(timeout.is_transport());
        assert!(!CommError::ResponseCode(3).is_transport());
        assert!(!CommError::WrongResponse("counter".into()).is_transport());
    }

    #[test]
    fn response_code_is_reported() {
        let err = CommError::ResponseCode(-2);
        assert_eq!(err.to_string(), "Device answered with response code -2");
    }
}
