//! One-second power sample as reported by the metering device.
//!
//! The device supplies voltage, current and active power for each of the three
//! phases. Apparent and reactive power are always derived locally, both for
//! live samples and for rows re-imported from a day file, so a stale or edited
//! file can never inject its own derived values.
//!
//! # Day-file row layout
//!
//! ```text
//! timestamp,v0,v1,v2,i0,i1,i2,p0,p1,p2
//! 1700000040,120.0000,121.5000,119.8000,2.0000,1.1000,0.0000,200.0000,90.2500,0.0000
//! ```
//!
//! Floats are written with four decimals and read back at any precision.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of electrical phases reported per sample.
pub const PHASES: usize = 3;

/// Number of fields in a day-file row.
pub const ROW_FIELDS: usize = 1 + 3 * PHASES;

/// Number of parameters in a get-data response.
pub const WIRE_FIELDS: usize = 12;

/// Why a row or response could not be turned into a sample.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseSampleError {
    /// Wrong number of fields.
    #[error("expected {expected} fields, got {found}")]
    FieldCount {
        /// Required number of fields.
        expected: usize,
        /// Number of fields present.
        found: usize,
    },

    /// A field that is not a finite number.
    #[error("invalid value '{value}' in field {index}")]
    InvalidNumber {
        /// Zero-based field position.
        index: usize,
        /// Offending text.
        value: String,
    },
}

/// A single accepted (or candidate) measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    /// Phase voltages (V).
    pub voltage: [f64; PHASES],
    /// Phase currents (A).
    pub current: [f64; PHASES],
    /// Phase active power as measured by the device (W).
    pub active_power: [f64; PHASES],
    /// Derived: `voltage * current` (VA).
    pub apparent_power: [f64; PHASES],
    /// Derived: `sqrt(apparent^2 - active^2)` (var).
    pub reactive_power: [f64; PHASES],
}

impl PowerSample {
    /// Build a sample from raw device readings and compute derived quantities.
    pub fn new(
        timestamp: i64,
        voltage: [f64; PHASES],
        current: [f64; PHASES],
        active_power: [f64; PHASES],
    ) -> Self {
        let mut apparent_power = [0.0; PHASES];
        let mut reactive_power = [0.0; PHASES];

        for phase in 0..PHASES {
            let s = voltage[phase] * current[phase];
            let p = active_power[phase];
            apparent_power[phase] = s;
            // Rounding in the meter can put |P| slightly above S; clamp instead of NaN.
            reactive_power[phase] = (s * s - p * p).max(0.0).sqrt();
        }

        Self {
            timestamp,
            voltage,
            current,
            active_power,
            apparent_power,
            reactive_power,
        }
    }

    /// Decode the parameters of one get-data response.
    ///
    /// Layout: `[timestamp, _, _, v0, v1, v2, i0, i1, i2, p0, p1, p2]`. Fields 1 and
    /// 2 carry device bookkeeping and are ignored.
    pub fn from_wire_fields<S: AsRef<str>>(fields: &[S]) -> Result<Self, ParseSampleError> {
        if fields.len() != WIRE_FIELDS {
            return Err(ParseSampleError::FieldCount {
                expected: WIRE_FIELDS,
                found: fields.len(),
            });
        }

        let timestamp = parse_i64(fields, 0)?;
        let readings = parse_readings(fields, 3)?;
        Ok(Self::new(timestamp, readings[0], readings[1], readings[2]))
    }

    /// Decode one day-file row. Derived quantities are recomputed.
    pub fn from_row<S: AsRef<str>>(fields: &[S]) -> Result<Self, ParseSampleError> {
        if fields.len() != ROW_FIELDS {
            return Err(ParseSampleError::FieldCount {
                expected: ROW_FIELDS,
                found: fields.len(),
            });
        }

        let timestamp = parse_i64(fields, 0)?;
        let readings = parse_readings(fields, 1)?;
        Ok(Self::new(timestamp, readings[0], readings[1], readings[2]))
    }

    /// Encode as a day-file row.
    pub fn to_row(&self) -> [String; ROW_FIELDS] {
        let mut row: [String; ROW_FIELDS] = Default::default();
        row[0] = self.timestamp.to_string();
        let values = self
            .voltage
            .iter()
            .chain(self.current.iter())
            .chain(self.active_power.iter());
        for (slot, value) in row[1..].iter_mut().zip(values) {
            *slot = format!("{:.4}", value);
        }
        row
    }

    /// Active power of the phases that feed the energy totals (W).
    ///
    /// Only phases 0 and 1 are summed; phase 2 is reported but not billed.
    pub fn billed_active_power(&self) -> f64 {
        self.active_power[0] + self.active_power[1]
    }

    /// Reactive power of the billed phases (var).
    pub fn billed_reactive_power(&self) -> f64 {
        self.reactive_power[0] + self.reactive_power[1]
    }
}

fn parse_i64<S: AsRef<str>>(fields: &[S], index: usize) -> Result<i64, ParseSampleError> {
    let text = fields[index].as_ref().trim();
    text.parse::<i64>()
        .map_err(|_| ParseSampleError::InvalidNumber {
            index,
            value: text.to_string(),
        })
}

fn parse_f64<S: AsRef<str>>(fields: &[S], index: usize) -> Result<f64, ParseSampleError> {
    let text = fields[index].as_ref().trim();
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ParseSampleError::InvalidNumber {
            index,
            value: text.to_string(),
        }),
    }
}

/// Parse voltage, current and active power triplets starting at `offset`.
fn parse_readings<S: AsRef<str>>(
    fields: &[S],
    offset: usize,
) -> Result<[[f64; PHASES]; 3], ParseSampleError> {
    let mut readings = [[0.0; PHASES]; 3];
    for (group, values) in readings.iter_mut().enumerate() {
        for (phase, value) in values.iter_mut().enumerate() {
            *value = parse_f64(fields, offset + group * PHASES + phase)?;
        }
    }
    Ok(readings)
}
