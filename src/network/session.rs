//! Authenticated request/response session with one connected device.
//!
//! A session lives for exactly one connection. It owns the stream and the
//! per-connection state:
//!
//! - `local_nonce`: generated here at accept, must be echoed in every response
//! - `peer_nonce`: learnt in the handshake, sent in every command
//! - `counter`: starts at 0 and advances once per completed exchange
//!
//! Reads are bounded both in size ([`MAX_FRAME_LEN`]) and in time (the receive
//! timeout), so a stalled or hostile peer can only ever fail its own session.

use super::auth::SessionKey;
use super::frame::{CommandFrame, ResponseFrame, MAX_FRAME_LEN};
use super::opcode::Opcode;
use crate::error::CommError;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

/// Parameters of a get-data response.
pub const SAMPLE_PARAMS: usize = crate::measurement::sample::WIRE_FIELDS;

/// Most samples requested in one get-data exchange (one hour at 1 Hz).
pub const MAX_BATCH: u32 = 3600;

/// Device state reported by a query-status exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Whether the device is currently sampling.
    pub sampling: bool,
    /// Number of samples waiting to be fetched.
    pub pending: u32,
}

impl DeviceStatus {
    /// Decode the four query-status parameters.
    pub fn from_params(params: &[String]) -> Result<Self, CommError> {
        if params.len() != 4 {
            return Err(CommError::ParsingResponse(format!(
                "status carries {} parameters",
                params.len()
            )));
        }
        let pending = params[3].parse::<u32>().map_err(|_| {
            CommError::ParsingResponse(format!("invalid pending count '{}'", params[3]))
        })?;
        Ok(Self {
            sampling: params[0] != "0",
            pending,
        })
    }
}

/// One device connection speaking the signed line protocol.
pub struct DeviceSession<S> {
    stream: BufReader<S>,
    peer: String,
    key: SessionKey,
    local_nonce: u32,
    peer_nonce: u32,
    counter: u32,
    version: Option<String>,
    timeout: Duration,
}

impl<S> DeviceSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a freshly accepted stream with a random local nonce.
    pub fn new(stream: S, peer: impl Into<String>, key: SessionKey, timeout: Duration) -> Self {
        Self::with_nonce(stream, peer, key, timeout, rand::random::<u32>())
    }

    /// Like [`new`](Self::new) with a caller-chosen local nonce.
    pub fn with_nonce(
        stream: S,
        peer: impl Into<String>,
        key: SessionKey,
        timeout: Duration,
        local_nonce: u32,
    ) -> Self {
        Self {
            stream: BufReader::new(stream),
            peer: peer.into(),
            key,
            local_nonce,
            peer_nonce: 0,
            counter: 0,
            version: None,
            timeout,
        }
    }

    /// Remote address, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Nonce every response must echo.
    pub fn local_nonce(&self) -> u32 {
        self.local_nonce
    }

    /// Nonce carried by commands; zero until the handshake completes.
    pub fn peer_nonce(&self) -> u32 {
        self.peer_nonce
    }

    /// Sequence number of the next command.
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Firmware version announced in the handshake.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Exchange nonces. Must be the first exchange on the connection.
    pub async fn handshake(&mut self) -> Result<(), CommError> {
        self.counter = 0;
        self.peer_nonce = 0;

        // The nonce goes out bare, without a token terminator
        let hello = CommandFrame::with_raw_params(
            Opcode::Handshake,
            self.peer_nonce,
            self.counter,
            &self.local_nonce.to_string(),
        );
        self.send_frame(&hello).await?;
        let params = self.receive_response(Opcode::Handshake, 2).await?;
        self.advance_counter();

        self.peer_nonce = params[0].parse::<u32>().map_err(|_| {
            CommError::ParsingResponse(format!("invalid peer nonce '{}'", params[0]))
        })?;
        self.version = Some(params[1].clone());

        debug!(peer = %self.peer, version = %params[1], "Handshake completed");
        Ok(())
    }

    /// Sign and write one command with the peer's nonce and the current counter.
    pub async fn send_command(&mut self, opcode: Opcode, params: &[&str]) -> Result<(), CommError> {
        let frame = CommandFrame::new(opcode, self.peer_nonce, self.counter, params);
        self.send_frame(&frame).await
    }

    async fn send_frame(&mut self, frame: &CommandFrame) -> Result<(), CommError> {
        let wire = frame.encode(&self.key)?;

        trace!(peer = %self.peer, frame = %wire.trim_end(), "Send");

        let stream = self.stream.get_mut();
        stream.write_all(wire.as_bytes()).await.map_err(CommError::Send)?;
        stream.flush().await.map_err(CommError::Send)?;
        Ok(())
    }

    /// Read one response and bind it to this session and exchange.
    ///
    /// Returns the response parameters. The counter is not advanced.
    pub async fn receive_response(
        &mut self,
        opcode: Opcode,
        expected_params: usize,
    ) -> Result<Vec<String>, CommError> {
        let line = self.read_line().await?;
        trace!(peer = %self.peer, frame = %line.trim_end(), "Recv");

        let frame = ResponseFrame::decode(&line, &self.key)?;
        frame.expect(opcode, self.local_nonce, self.counter, expected_params)?;
        Ok(frame.params)
    }

    /// One complete exchange; the counter advances only if it succeeds.
    pub async fn send_and_receive(
        &mut self,
        opcode: Opcode,
        params: &[&str],
        expected_params: usize,
    ) -> Result<Vec<String>, CommError> {
        self.send_command(opcode, params).await?;
        let response = self.receive_response(opcode, expected_params).await?;
        self.advance_counter();
        Ok(response)
    }

    /// Close a multi-response exchange.
    pub fn advance_counter(&mut self) {
        self.counter = self.counter.wrapping_add(1);
    }

    /// Ask whether the device is sampling and how many samples it holds.
    pub async fn query_status(&mut self) -> Result<DeviceStatus, CommError> {
        let params = self.send_and_receive(Opcode::QueryStatus, &["A"], 4).await?;
        DeviceStatus::from_params(&params)
    }

    /// Tell the device to start sampling.
    pub async fn start_sampling(&mut self) -> Result<(), CommError> {
        self.send_and_receive(Opcode::StartSampling, &[], 0).await?;
        Ok(())
    }

    /// Request `count` samples; the device answers once per sample.
    ///
    /// All responses share the request's counter, which advances once after the
    /// last one. `count` must not exceed [`MAX_BATCH`]; larger backlogs are
    /// fetched in several batches.
    pub async fn get_data(&mut self, count: u32) -> Result<Vec<Vec<String>>, CommError> {
        if count > MAX_BATCH {
            return Err(CommError::Send(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("batch of {count} samples exceeds {MAX_BATCH}"),
            )));
        }
        let qty = count.to_string();
        self.send_command(Opcode::GetData, &["P", qty.as_str()]).await?;

        let mut responses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            responses.push(self.receive_response(Opcode::GetData, SAMPLE_PARAMS).await?);
        }

        self.advance_counter();
        Ok(responses)
    }

    /// Discard the `count` oldest samples on the device.
    pub async fn delete_data(&mut self, count: u32) -> Result<(), CommError> {
        let qty = count.to_string();
        self.send_and_receive(Opcode::DeleteData, &["P", qty.as_str()], 0)
            .await?;
        Ok(())
    }

    /// Orderly goodbye before the gateway closes the connection.
    pub async fn disconnect(&mut self) -> Result<(), CommError> {
        self.send_and_receive(Opcode::Disconnect, &["1000"], 0).await?;
        Ok(())
    }

    /// Shut down the write half and drop the stream.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.get_mut().shutdown().await {
            debug!(peer = %self.peer, error = %e, "Error closing device stream");
        }
    }

    async fn read_line(&mut self) -> Result<String, CommError> {
        let limit = (MAX_FRAME_LEN + 1) as u64;
        let mut line = String::new();

        let read = tokio::time::timeout(
            self.timeout,
            (&mut self.stream).take(limit).read_line(&mut line),
        )
        .await
        .map_err(|_| {
            CommError::Receive(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no response within {:?}", self.timeout),
            ))
        })?
        .map_err(CommError::Receive)?;

        if read == 0 {
            return Err(CommError::Receive(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "device closed the connection",
            )));
        }

        if !line.ends_with('\n') {
            if line.len() as u64 >= limit {
                return Err(CommError::FrameTooLong {
                    limit: MAX_FRAME_LEN,
                });
            }
            return Err(CommError::Receive(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            )));
        }

        Ok(line)
    }
}
