//! Line frames exchanged with the metering device.
//!
//! ```text
//! command:   OP:NONCE:COUNTER:PARAMS*HMAC\n
//! response:  A:OP:NONCE:COUNTER:CODE:PARAMS*HMAC\n
//! ```
//!
//! `PARAMS` is a sequence of tab-separated tokens, empty when there are none.
//! Frames built here terminate every token (`P\t5\t`); the handshake nonce is
//! the one exception and goes out bare. Decoded frames keep the parameter field
//! exactly as received, so re-encoding them reproduces the original bytes.
//!
//! The digest covers every byte before the `*`. A frame, newline excluded, is at
//! most [`MAX_FRAME_LEN`] bytes; longer input is rejected rather than truncated.

use super::auth::SessionKey;
use super::opcode::Opcode;
use crate::error::CommError;
use std::io;

/// Longest accepted frame, newline excluded.
pub const MAX_FRAME_LEN: usize = 200;

/// First field of every response frame.
pub const RESPONSE_PREFIX: &str = "A";

const PARAM_SEPARATOR: char = '\t';

/// Encode parameters as tab-terminated tokens.
fn join_params(params: &[String]) -> Result<String, CommError> {
    let mut out = String::new();
    for param in params {
        if param.is_empty() || param.contains(['\t', '\n', '\r']) {
            return Err(CommError::Send(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("parameter {param:?} cannot be framed"),
            )));
        }
        out.push_str(param);
        out.push(PARAM_SEPARATOR);
    }
    Ok(out)
}

/// Split a parameter field. Empty tokens are skipped.
pub fn split_params(text: &str) -> Vec<String> {
    text.split(PARAM_SEPARATOR)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Raw parameter field for `params`, reusing `raw` while it still decodes to them.
fn param_field(params: &[String], raw: Option<&str>) -> Result<String, CommError> {
    match raw {
        Some(raw) if split_params(raw) == params => {
            if raw.contains(['\n', '\r']) {
                return Err(CommError::Send(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "parameter field contains a line break",
                )));
            }
            Ok(raw.to_string())
        }
        _ => join_params(params),
    }
}

fn check_len(frame: &str) -> Result<(), CommError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(CommError::FrameTooLong {
            limit: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

fn parse_field<T: std::str::FromStr>(field: Option<&str>, name: &str) -> Result<T, CommError> {
    let text = field.ok_or_else(|| CommError::ParsingResponse(format!("missing {name}")))?;
    text.parse::<T>()
        .map_err(|_| CommError::ParsingResponse(format!("invalid {name} '{text}'")))
}

fn parse_opcode(field: Option<&str>) -> Result<Opcode, CommError> {
    let text = field.ok_or_else(|| CommError::ParsingResponse("missing opcode".into()))?;
    Opcode::from_code(text).ok_or_else(|| CommError::WrongResponse(format!("unknown opcode '{text}'")))
}

/// Gateway → device request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Requested operation.
    pub opcode: Opcode,
    /// The peer's nonce.
    pub nonce: u32,
    /// Exchange counter of the session.
    pub counter: u32,
    /// Non-empty parameter tokens.
    pub params: Vec<String>,
    /// Parameter field as received or as built by [`CommandFrame::with_raw_params`].
    raw_params: Option<String>,
}

impl CommandFrame {
    /// Command whose parameters are sent as tab-terminated tokens.
    pub fn new(opcode: Opcode, nonce: u32, counter: u32, params: &[&str]) -> Self {
        Self {
            opcode,
            nonce,
            counter,
            params: params.iter().map(|p| p.to_string()).collect(),
            raw_params: None,
        }
    }

    /// Command with a literal parameter field, e.g. a bare handshake nonce.
    pub fn with_raw_params(opcode: Opcode, nonce: u32, counter: u32, field: &str) -> Self {
        Self {
            opcode,
            nonce,
            counter,
            params: split_params(field),
            raw_params: Some(field.to_string()),
        }
    }

    /// Parameter field as it goes on the wire.
    pub fn param_field(&self) -> Result<String, CommError> {
        param_field(&self.params, self.raw_params.as_deref())
    }

    /// Signed wire form, newline included.
    pub fn encode(&self, key: &SessionKey) -> Result<String, CommError> {
        let body = format!(
            "{}:{}:{}:{}",
            self.opcode,
            self.nonce,
            self.counter,
            self.param_field()?
        );
        let sealed = key.seal(&body);
        check_len(&sealed)?;
        Ok(sealed + "\n")
    }

    /// Parse and authenticate one command line (device side).
    pub fn decode(line: &str, key: &SessionKey) -> Result<Self, CommError> {
        let line = line.trim_end_matches(['\r', '\n']);
        check_len(line)?;
        let body = key.open(line)?;

        let mut fields = body.splitn(4, ':');
        let opcode = parse_opcode(fields.next())?;
        let nonce = parse_field(fields.next(), "nonce")?;
        let counter = parse_field(fields.next(), "counter")?;
        let raw = fields.next().unwrap_or_default();

        Ok(Self {
            opcode,
            nonce,
            counter,
            params: split_params(raw),
            raw_params: Some(raw.to_string()),
        })
    }
}

/// Device → gateway reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Operation being answered.
    pub opcode: Opcode,
    /// Must echo the gateway's own nonce.
    pub nonce: u32,
    /// Counter of the command being answered.
    pub counter: u32,
    /// Zero on success.
    pub code: i32,
    /// Non-empty parameter tokens.
    pub params: Vec<String>,
    /// Parameter field as received.
    raw_params: Option<String>,
}

impl ResponseFrame {
    /// Response whose parameters are sent as tab-terminated tokens.
    pub fn new(opcode: Opcode, nonce: u32, counter: u32, code: i32, params: &[&str]) -> Self {
        Self {
            opcode,
            nonce,
            counter,
            code,
            params: params.iter().map(|p| p.to_string()).collect(),
            raw_params: None,
        }
    }

    /// Parameter field as it goes on the wire.
    pub fn param_field(&self) -> Result<String, CommError> {
        param_field(&self.params, self.raw_params.as_deref())
    }

    /// Signed wire form, newline included (device side).
    pub fn encode(&self, key: &SessionKey) -> Result<String, CommError> {
        let body = format!(
            "{RESPONSE_PREFIX}:{}:{}:{}:{}:{}",
            self.opcode,
            self.nonce,
            self.counter,
            self.code,
            self.param_field()?
        );
        let sealed = key.seal(&body);
        check_len(&sealed)?;
        Ok(sealed + "\n")
    }

    /// Authenticate and parse one response line.
    ///
    /// Only the frame's own structure is checked here; binding to a session
    /// (opcode, nonce, counter) is done by [`ResponseFrame::expect`].
    pub fn decode(line: &str, key: &SessionKey) -> Result<Self, CommError> {
        let line = line.trim_end_matches(['\r', '\n']);
        check_len(line)?;
        let body = key.open(line)?;

        let mut fields = body.splitn(6, ':');
        if fields.next() != Some(RESPONSE_PREFIX) {
            return Err(CommError::ParsingResponse("missing response prefix".into()));
        }
        let opcode = parse_opcode(fields.next())?;
        let nonce = parse_field(fields.next(), "nonce")?;
        let counter = parse_field(fields.next(), "counter")?;
        let code = parse_field(fields.next(), "response code")?;
        let raw = fields.next().unwrap_or_default();

        Ok(Self {
            opcode,
            nonce,
            counter,
            code,
            params: split_params(raw),
            raw_params: Some(raw.to_string()),
        })
    }

    /// Check that this response answers `opcode` in the current exchange.
    ///
    /// Order: opcode, nonce, counter, status code, then parameter count (only
    /// when `expected_params > 0`).
    pub fn expect(
        &self,
        opcode: Opcode,
        own_nonce: u32,
        counter: u32,
        expected_params: usize,
    ) -> Result<(), CommError> {
        if self.opcode != opcode {
            return Err(CommError::WrongResponse(format!(
                "expected {opcode}, got {}",
                self.opcode
            )));
        }
        if self.nonce != own_nonce {
            return Err(CommError::WrongResponse(format!(
                "nonce {} does not match session",
                self.nonce
            )));
        }
        if self.counter != counter {
            return Err(CommError::WrongResponse(format!(
                "counter {} does not match expected {counter}",
                self.counter
            )));
        }
        if self.code != 0 {
            return Err(CommError::ResponseCode(self.code));
        }
        if expected_params > 0 && self.params.len() != expected_params {
            return Err(CommError::ParsingResponse(format!(
                "expected {expected_params} parameters, got {}",
                self.params.len()
            )));
        }
        Ok(())
    }
}
