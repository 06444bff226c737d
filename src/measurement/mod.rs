//! Electrical measurement types shared by the protocol, storage and aggregation layers.
//!
//! All quantities are per phase and in SI units: volts, amperes, watts (active),
//! volt-amperes (apparent) and volt-amperes reactive.

pub mod sample;

pub use sample::{ParseSampleError, PowerSample, PHASES};
