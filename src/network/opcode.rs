//! Operation codes of the device line protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of device operations and their two-letter wire codes.
///
/// Adding an opcode is a protocol version change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// `HE`: nonce exchange at connection start.
    Handshake,
    /// `SS`
    StartSampling,
    /// `SP`
    StopSampling,
    /// `CW`
    ConfigWrite,
    /// `CR`
    ConfigRead,
    /// `RE`
    Reset,
    /// `SR`
    SamplingRate,
    /// `FU`
    FirmwareUpdate,
    /// `QS`: sampling flag and pending sample count.
    QueryStatus,
    /// `GD`: fetch buffered samples, one response per sample.
    GetData,
    /// `DD`: discard samples already fetched.
    DeleteData,
    /// `GW`
    GetWifi,
    /// `BY`: orderly disconnect.
    Disconnect,
}

impl Opcode {
    /// Every opcode in wire-table order.
    pub const ALL: [Opcode; 13] = [
        Opcode::Handshake,
        Opcode::StartSampling,
        Opcode::StopSampling,
        Opcode::ConfigWrite,
        Opcode::ConfigRead,
        Opcode::Reset,
        Opcode::SamplingRate,
        Opcode::FirmwareUpdate,
        Opcode::QueryStatus,
        Opcode::GetData,
        Opcode::DeleteData,
        Opcode::GetWifi,
        Opcode::Disconnect,
    ];

    /// Two-letter wire code.
    pub fn code(self) -> &'static str {
        match self {
            Opcode::Handshake => "HE",
            Opcode::StartSampling => "SS",
            Opcode::StopSampling => "SP",
            Opcode::ConfigWrite => "CW",
            Opcode::ConfigRead => "CR",
            Opcode::Reset => "RE",
            Opcode::SamplingRate => "SR",
            Opcode::FirmwareUpdate => "FU",
            Opcode::QueryStatus => "QS",
            Opcode::GetData => "GD",
            Opcode::DeleteData => "DD",
            Opcode::GetWifi => "GW",
            Opcode::Disconnect => "BY",
        }
    }

    /// Parse a wire code; `None` for anything outside the table.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "HE" => Some(Opcode::Handshake),
            "SS" => Some(Opcode::StartSampling),
            "SP" => Some(Opcode::StopSampling),
            "CW" => Some(Opcode::ConfigWrite),
            "CR" => Some(Opcode::ConfigRead),
            "RE" => Some(Opcode::Reset),
            "SR" => Some(Opcode::SamplingRate),
            "FU" => Some(Opcode::FirmwareUpdate),
            "QS" => Some(Opcode::QueryStatus),
            "GD" => Some(Opcode::GetData),
            "DD" => Some(Opcode::DeleteData),
            "GW" => Some(Opcode::GetWifi),
            "BY" => Some(Opcode::Disconnect),
            _ => None,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
