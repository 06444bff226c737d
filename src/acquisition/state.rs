//! Observable state of the acquisition loop.

use serde::{Deserialize, Serialize};

/// Where the acquisition loop currently is.
///
/// # State Machine
///
/// ```text
/// Recovering ──> AwaitConnection ──accept──> Handshaking ──> PollStatus
///                     ▲                                        │    ▲
///                     │                       not sampling ────┤    │
///                     │                          StartSampling ┘    │
///                     │                                        │    │
///                     │                              pending 0 ├──> Idle
///                     │                                        ▼    ▲
///          any protocol/transport error        RequestBatch ──> ReceiveSamples
///                     │                                             │
///                     └──────────────────── DeleteOnDevice <────────┘
///
/// shutdown signal (accept loop or top of a poll) ──> ShuttingDown ──> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionPhase {
    /// Importing day files before the listener is served
    Recovering,
    /// Waiting for the device to connect
    AwaitConnection,
    /// Exchanging nonces
    Handshaking,
    /// Asking the device for its sampling flag and pending count
    PollStatus,
    /// Device reported it was not sampling
    StartSampling,
    /// Get-data request sent
    RequestBatch,
    /// Reading one response per pending sample
    ReceiveSamples,
    /// Acknowledging the delivered range
    DeleteOnDevice,
    /// Waiting before the next poll
    Idle,
    /// Disconnecting after a shutdown request
    ShuttingDown,
    /// Loop has returned
    Stopped,
}

impl std::fmt::Display for AcquisitionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionPhase::Recovering => write!(f, "Recovering"),
            AcquisitionPhase::AwaitConnection => write!(f, "AwaitConnection"),
            AcquisitionPhase::Handshaking => write!(f, "Handshaking"),
            AcquisitionPhase::PollStatus => write!(f, "PollStatus"),
            AcquisitionPhase::StartSampling => write!(f, "StartSampling"),
            AcquisitionPhase::RequestBatch => write!(f, "RequestBatch"),
            AcquisitionPhase::ReceiveSamples => write!(f, "ReceiveSamples"),
            AcquisitionPhase::DeleteOnDevice => write!(f, "DeleteOnDevice"),
            AcquisitionPhase::Idle => write!(f, "Idle"),
            AcquisitionPhase::ShuttingDown => write!(f, "ShuttingDown"),
            AcquisitionPhase::Stopped => write!(f, "Stopped"),
        }
    }
}

impl AcquisitionPhase {
    /// Whether a device session is open in this phase.
    pub fn is_connected(&self) -> bool {
        !matches!(
            self,
            AcquisitionPhase::Recovering
                | AcquisitionPhase::AwaitConnection
                | AcquisitionPhase::Stopped
        )
    }
}

/// Snapshot published on the status channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionStatus {
    /// Current step of the session loop
    pub phase: AcquisitionPhase,
    /// Address of the connected device
    pub peer: Option<String>,
    /// Version string from the last handshake
    pub firmware_version: Option<String>,
    /// Samples stored since start (recovered rows not included)
    pub samples_accepted: u64,
    /// Samples discarded as out of order or unparseable
    pub samples_dropped: u64,
    /// Newest accepted timestamp
    pub last_timestamp: Option<i64>,
}

impl Default for AcquisitionStatus {
    fn default() -> Self {
        Self {
            phase: AcquisitionPhase::Recovering,
            peer: None,
            firmware_version: None,
            samples_accepted: 0,
            samples_dropped: 0,
            last_timestamp: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(AcquisitionPhase::AwaitConnection.to_string(), "AwaitConnection");
        assert_eq!(AcquisitionPhase::DeleteOnDevice.to_string(), "DeleteOnDevice");
    }

    #[test]
    fn test_connected_phases() {
        assert!(!AcquisitionPhase::AwaitConnection.is_connected());
        assert!(AcquisitionPhase::ReceiveSamples.is_connected());
        assert!(AcquisitionPhase::Idle.is_connected());
        assert!(!AcquisitionPhase::Stopped.is_connected());
    }
}
