//! Device wire protocol: opcodes, frame authentication, framing and sessions.
pub mod auth;
pub mod frame;
pub mod opcode;
pub mod session;

pub use auth::SessionKey;
pub use frame::{CommandFrame, ResponseFrame, MAX_FRAME_LEN};
pub use opcode::Opcode;
pub use session::{DeviceSession, DeviceStatus};
