//! Device acquisition loop.
//!
//! Accepts one device connection at a time and drives it through
//! handshake → poll → fetch → delete → idle, storing every accepted sample in
//! the day file, the [`SampleRing`] and the energy tables.
//!
//! Session-local failures (transport, authentication, framing) drop the
//! connection and return to accepting. Failing to create the next day file is
//! fatal: [`Acquisition::run`] returns the error and the caller terminates.

pub mod state;

pub use state::{AcquisitionPhase, AcquisitionStatus};

use crate::config::GatewayConfig;
use crate::data::day_file::DayFileWriter;
use crate::data::recovery;
use crate::data::ring_buffer::SampleRing;
use crate::energy::EnergyAggregator;
use crate::error::{AppResult, DaqError};
use crate::measurement::PowerSample;
use crate::network::session::MAX_BATCH;
use crate::network::{DeviceSession, SessionKey};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Wall-clock source for day-file naming and recovery windows.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Listener and timing parameters.
#[derive(Debug, Clone)]
pub struct AcquisitionOptions {
    /// TCP port (0 = ephemeral)
    pub port: u16,
    /// Limit on each response read
    pub receive_timeout: Duration,
    /// Pause after a failed accept
    pub accept_retry: Duration,
    /// Pause between status polls
    pub poll_interval: Duration,
    /// Directory of the day files
    pub data_dir: PathBuf,
}

impl AcquisitionOptions {
    /// Take the `[device]` timings and the day file directory from the config.
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            port: config.device.port,
            receive_timeout: config.device.receive_timeout(),
            accept_retry: config.device.accept_retry(),
            poll_interval: config.device.poll_interval(),
            data_dir: config.storage.data_dir.clone(),
        }
    }
}

/// State carried across sessions.
struct Cursor {
    writer: DayFileWriter,
    last_timestamp: Option<i64>,
}

/// The acquisition service.
pub struct Acquisition {
    listener: TcpListener,
    key: SessionKey,
    ring: Arc<SampleRing>,
    energy: EnergyAggregator,
    options: AcquisitionOptions,
    clock: Arc<dyn Clock>,
    status: watch::Sender<AcquisitionStatus>,
}

impl Acquisition {
    /// Bind the device listener on all interfaces.
    pub async fn bind(
        options: AcquisitionOptions,
        key: SessionKey,
        ring: Arc<SampleRing>,
        energy: EnergyAggregator,
    ) -> AppResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", options.port)).await?;
        info!(addr = %listener.local_addr()?, "Device listener bound");

        let (status, _) = watch::channel(AcquisitionStatus::default());
        Ok(Self {
            listener,
            key,
            ring,
            energy,
            options,
            clock: Arc::new(SystemClock),
            status,
        })
    }

    /// Replace the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Receiver for status snapshots.
    pub fn subscribe(&self) -> watch::Receiver<AcquisitionStatus> {
        self.status.subscribe()
    }

    fn set_phase(&self, phase: AcquisitionPhase) {
        self.status.send_modify(|s| s.phase = phase);
    }

    /// Recover, then serve device connections until `shutdown` turns true.
    ///
    /// Returns `Err` only for fatal errors.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        self.set_phase(AcquisitionPhase::Recovering);

        let ring = Arc::clone(&self.ring);
        let dir = self.options.data_dir.clone();
        let now = self.clock.now();
        let stats = tokio::task::spawn_blocking(move || recovery::recover(&ring, &dir, now))
            .await
            .map_err(|e| DaqError::Task(e.to_string()))?;
        debug!(?stats, "Recovery stats");

        let writer = DayFileWriter::open(&self.options.data_dir, self.clock.now())?;
        let mut cursor = Cursor {
            writer,
            last_timestamp: self.ring.last_timestamp(),
        };
        self.status
            .send_modify(|s| s.last_timestamp = cursor.last_timestamp);

        let result = self.serve(&mut cursor, &mut shutdown).await;

        if let Err(e) = cursor.writer.flush() {
            warn!(error = %e, "Failed to flush day file on exit");
        }
        self.status.send_modify(|s| {
            s.phase = AcquisitionPhase::Stopped;
            s.peer = None;
        });
        info!("Acquisition stopped");
        result
    }

    async fn serve(
        &self,
        cursor: &mut Cursor,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AppResult<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            self.set_phase(AcquisitionPhase::AwaitConnection);

            let accepted = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                result = self.listener.accept() => result,
            };

            let (stream, addr) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept device connection");
                    if wait_or_shutdown(self.options.accept_retry, shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            info!(peer = %addr, "Device connected");
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Could not set TCP_NODELAY");
            }

            let mut session = DeviceSession::new(
                stream,
                addr.to_string(),
                self.key.clone(),
                self.options.receive_timeout,
            );
            self.status.send_modify(|s| {
                s.peer = Some(addr.to_string());
                s.firmware_version = None;
            });

            let outcome = self.run_session(&mut session, cursor, shutdown).await;

            match outcome {
                Ok(()) => {
                    self.set_phase(AcquisitionPhase::ShuttingDown);
                    if let Err(e) = session.disconnect().await {
                        warn!(peer = %addr, error = %e, "Disconnect notification failed");
                    }
                    session.close().await;
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    error!(peer = %addr, error = %e, "Fatal acquisition error");
                    session.close().await;
                    return Err(e);
                }
                Err(e) => {
                    error!(peer = %addr, error = %e, "Device session ended");
                    session.close().await;
                }
            }

            self.status.send_modify(|s| s.peer = None);
        }
    }

    /// Drive one connection. Returns `Ok` only once shutdown was requested.
    async fn run_session(
        &self,
        session: &mut DeviceSession<TcpStream>,
        cursor: &mut Cursor,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AppResult<()> {
        self.set_phase(AcquisitionPhase::Handshaking);
        session.handshake().await?;

        let version = session.version().map(str::to_string);
        info!(peer = %session.peer(), version = ?version, "Device session established");
        self.status.send_modify(|s| s.firmware_version = version);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            cursor.writer.rotate_if_needed(self.clock.now())?;

            self.set_phase(AcquisitionPhase::PollStatus);
            let status = session.query_status().await?;

            if !status.sampling {
                self.set_phase(AcquisitionPhase::StartSampling);
                info!(peer = %session.peer(), "Device not sampling, starting");
                session.start_sampling().await?;
            }

            if status.pending > 0 {
                let count = status.pending.min(MAX_BATCH);
                if count < status.pending {
                    debug!(pending = status.pending, count, "Backlog fetched in batches");
                }
                self.fetch_batch(session, cursor, count).await?;
            }

            self.set_phase(AcquisitionPhase::Idle);
            if wait_or_shutdown(self.options.poll_interval, shutdown).await {
                return Ok(());
            }
        }
    }

    async fn fetch_batch(
        &self,
        session: &mut DeviceSession<TcpStream>,
        cursor: &mut Cursor,
        count: u32,
    ) -> AppResult<()> {
        self.set_phase(AcquisitionPhase::RequestBatch);
        debug!(peer = %session.peer(), count, "Requesting samples");

        self.set_phase(AcquisitionPhase::ReceiveSamples);
        let responses = session.get_data(count).await?;

        let mut batch = Vec::with_capacity(responses.len());
        let mut dropped = 0u64;

        for params in &responses {
            let sample = match PowerSample::from_wire_fields(params) {
                Ok(sample) => sample,
                Err(e) => {
                    warn!(peer = %session.peer(), error = %e, "Skipping unparseable sample");
                    dropped += 1;
                    continue;
                }
            };

            if cursor
                .last_timestamp
                .is_some_and(|last| sample.timestamp <= last)
            {
                debug!(
                    timestamp = sample.timestamp,
                    last = ?cursor.last_timestamp,
                    "Dropping out-of-order sample"
                );
                dropped += 1;
                continue;
            }

            if let Err(e) = cursor.writer.append(&sample) {
                error!(file = %cursor.writer.name(), error = %e, "Failed to write sample to day file");
            }
            self.ring.push(sample);
            cursor.last_timestamp = Some(sample.timestamp);
            batch.push(sample);
        }

        if let Err(e) = cursor.writer.flush() {
            error!(file = %cursor.writer.name(), error = %e, "Failed to flush day file");
        }

        let accepted = batch.len() as u64;
        self.status.send_modify(|s| {
            s.samples_accepted += accepted;
            s.samples_dropped += dropped;
            s.last_timestamp = cursor.last_timestamp;
        });

        if !batch.is_empty() {
            self.aggregate(batch).await;
        }

        self.set_phase(AcquisitionPhase::DeleteOnDevice);
        session.delete_data(count).await?;

        info!(peer = %session.peer(), accepted, dropped, "Batch stored");
        Ok(())
    }

    /// Fold a batch into the energy tables on a blocking thread.
    ///
    /// Storage failures affect only the sample concerned.
    async fn aggregate(&self, batch: Vec<PowerSample>) {
        let energy = self.energy.clone();
        let result = tokio::task::spawn_blocking(move || {
            for sample in &batch {
                if let Err(e) = energy.record_sample(sample) {
                    error!(timestamp = sample.timestamp, error = %e, "Failed to aggregate sample");
                }
            }
        })
        .await;

        if let Err(e) = result {
            error!(error = %DaqError::Task(e.to_string()), "Aggregation task failed");
        }
    }
}

/// Sleep for `duration` unless shutdown is requested first. Returns true on shutdown.
async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
