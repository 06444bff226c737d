//! # Power DAQ Gateway Library
//!
//! This crate is the core of the `power_daq` gateway: it pulls one-second
//! electrical samples from a remote metering device over an authenticated line
//! protocol, persists them to rotating daily CSV files and an in-memory ring,
//! and rolls them into minute/hour/day energy aggregates in SQLite. The binary
//! (`main.rs`) is a thin CLI over these modules.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: The connection → handshake → poll → fetch → delete loop,
//!   day-file rotation, shutdown and fatal-error escalation.
//! - **`config`**: Figment-based `GatewayConfig` (TOML + `POWER_DAQ_` environment)
//!   and the `ConfigLookup` numeric settings trait.
//! - **`data`**: The shared `SampleRing`, day-file writer and startup recovery.
//! - **`energy`**: Per-sample energy deltas and the transactional bucket upserts.
//! - **`error`**: `CommError` for device exchanges and the application-wide `DaqError`.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`measurement`**: The `PowerSample` type and its wire/row codecs.
//! - **`network`**: Opcodes, HMAC-MD5 frame authentication, framing and `DeviceSession`.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod energy;
pub mod error;
pub mod logging;
pub mod measurement;
pub mod network;
