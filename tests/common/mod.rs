//! Shared helpers for gateway integration tests: a scripted fake metering
//! device, a controllable clock and a gateway launcher.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use power_daq::acquisition::{Acquisition, AcquisitionOptions, AcquisitionStatus, Clock};
use power_daq::config::Settings;
use power_daq::data::SampleRing;
use power_daq::energy::EnergyAggregator;
use power_daq::error::AppResult;
use power_daq::network::{CommandFrame, Opcode, ResponseFrame, SessionKey};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const TEST_KEY: &[u8] = b"abc123";
pub const DEVICE_NONCE: u32 = 424_242;
pub const FIRMWARE: &str = "fake-1.0";

pub fn key() -> SessionKey {
    SessionKey::new(TEST_KEY).expect("valid key")
}

/// Get-data parameters for a sample with fixed, consistent readings.
pub fn sample_fields(ts: i64) -> Vec<String> {
    [
        ts.to_string().as_str(),
        "0",
        "0",
        "230.0",
        "230.0",
        "230.0",
        "2.0",
        "1.0",
        "0.5",
        "400.0",
        "200.0",
        "100.0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Clock that only moves when told to.
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn at(timestamp: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(timestamp)))
    }

    pub fn set(&self, timestamp: i64) {
        self.0.store(timestamp, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0.load(Ordering::SeqCst), 0).unwrap_or_default()
    }
}

/// What the fake device saw during one connection.
#[derive(Debug, Default)]
pub struct DeviceLog {
    pub commands: Vec<CommandFrame>,
    pub deleted: Vec<u32>,
    pub disconnected: bool,
}

impl DeviceLog {
    pub fn count(&self, opcode: Opcode) -> usize {
        self.commands.iter().filter(|c| c.opcode == opcode).count()
    }
}

/// Scripted device: serves `batches` in order, one batch per non-empty poll.
///
/// After each delete the batch index is sent on `deletes`.
pub struct FakeDevice {
    pub batches: Vec<Vec<Vec<String>>>,
    pub sampling: bool,
    /// Pending count to report instead of the current batch size.
    pub reported_pending: Option<u32>,
    /// Answer start-sampling with a non-zero response code.
    pub fail_start: bool,
    pub deletes: Option<mpsc::UnboundedSender<usize>>,
    pub on_delete: Option<Box<dyn FnMut(usize) + Send>>,
}

impl FakeDevice {
    pub fn new(batches: Vec<Vec<Vec<String>>>) -> Self {
        Self {
            batches,
            sampling: false,
            reported_pending: None,
            fail_start: false,
            deletes: None,
            on_delete: None,
        }
    }

    /// Connect to the gateway and answer commands until the connection closes.
    pub fn spawn(mut self, addr: SocketAddr) -> JoinHandle<DeviceLog> {
        tokio::spawn(async move {
            let stream = TcpStream::connect(("127.0.0.1", addr.port()))
                .await
                .expect("connect to gateway");
            self.serve(stream).await
        })
    }

    async fn serve(&mut self, stream: TcpStream) -> DeviceLog {
        let key = key();
        let mut stream = BufReader::new(stream);
        let mut log = DeviceLog::default();
        let mut gateway_nonce = 0u32;
        let mut batch = 0usize;

        loop {
            let mut line = String::new();
            match stream.read_line(&mut line).await {
                Ok(0) | Err(_) => return log,
                Ok(_) => {}
            }

            let command = CommandFrame::decode(&line, &key).expect("gateway frame authenticates");
            let expected_nonce = if command.opcode == Opcode::Handshake {
                0
            } else {
                DEVICE_NONCE
            };
            assert_eq!(command.nonce, expected_nonce, "command carries device nonce");

            let mut code = 0;
            let mut replies: Vec<Vec<String>> = Vec::new();
            match command.opcode {
                Opcode::Handshake => {
                    gateway_nonce = command.params[0].parse().expect("numeric nonce");
                    replies.push(vec![DEVICE_NONCE.to_string(), FIRMWARE.to_string()]);
                }
                Opcode::QueryStatus => {
                    let queued = self.batches.get(batch).map_or(0, Vec::len);
                    let pending = self
                        .reported_pending
                        .map_or(queued.to_string(), |n| n.to_string());
                    let flag = if self.sampling { "1" } else { "0" };
                    replies.push(vec![
                        flag.to_string(),
                        "0".to_string(),
                        "0".to_string(),
                        pending,
                    ]);
                }
                Opcode::StartSampling => {
                    if self.fail_start {
                        code = -1;
                    } else {
                        self.sampling = true;
                    }
                    replies.push(Vec::new());
                }
                Opcode::GetData => {
                    let count: usize = command.params[1].parse().expect("numeric count");
                    let samples = self.batches.get(batch).cloned().unwrap_or_default();
                    replies.extend(samples.into_iter().take(count));
                }
                Opcode::DeleteData => {
                    let count: u32 = command.params[1].parse().expect("numeric count");
                    log.deleted.push(count);
                    if let Some(hook) = self.on_delete.as_mut() {
                        hook(batch);
                    }
                    if let Some(tx) = &self.deletes {
                        let _ = tx.send(batch);
                    }
                    batch += 1;
                    replies.push(Vec::new());
                }
                Opcode::Disconnect => {
                    log.disconnected = true;
                    replies.push(Vec::new());
                }
                _ => replies.push(Vec::new()),
            }

            for params in replies {
                let refs: Vec<&str> = params.iter().map(String::as_str).collect();
                let wire = ResponseFrame::new(command.opcode, gateway_nonce, command.counter, code, &refs)
                    .encode(&key)
                    .expect("encode response");
                if stream.get_mut().write_all(wire.as_bytes()).await.is_err() {
                    return log;
                }
            }
            log.commands.push(command);
        }
    }
}

/// Gateway under test with handles to its shared state.
pub struct Gateway {
    pub addr: SocketAddr,
    pub ring: Arc<SampleRing>,
    pub energy: EnergyAggregator,
    pub status: watch::Receiver<AcquisitionStatus>,
    pub shutdown: watch::Sender<bool>,
    pub handle: JoinHandle<AppResult<()>>,
}

impl Gateway {
    pub async fn start(dir: &Path, clock: Arc<dyn Clock>) -> Self {
        let ring = Arc::new(SampleRing::new(1024));
        let energy = EnergyAggregator::open(
            dir.join("energy.db"),
            Duration::from_millis(1000),
            Arc::new(Settings::default()),
        )
        .expect("open energy db");

        let options = AcquisitionOptions {
            port: 0,
            receive_timeout: Duration::from_secs(2),
            accept_retry: Duration::from_millis(50),
            poll_interval: Duration::from_millis(20),
            data_dir: dir.to_path_buf(),
        };

        let acquisition = Acquisition::bind(options, key(), Arc::clone(&ring), energy.clone())
            .await
            .expect("bind listener")
            .with_clock(clock);

        let addr = acquisition.local_addr().expect("local addr");
        let status = acquisition.subscribe();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(acquisition.run(shutdown_rx));

        Self {
            addr,
            ring,
            energy,
            status,
            shutdown,
            handle,
        }
    }

    /// Request shutdown and wait for the loop to return.
    pub async fn stop(self) -> AppResult<()> {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("acquisition stops in time")
            .expect("acquisition task does not panic")
    }
}

/// Wait for the next delete notification.
pub async fn next_delete(rx: &mut mpsc::UnboundedReceiver<usize>) -> usize {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("device saw a delete in time")
        .expect("device still running")
}

/// Lines of a day file, empty when it does not exist.
pub fn day_file_lines(dir: &Path, name: &str) -> Vec<String> {
    std::fs::read_to_string(dir.join(name))
        .map(|content| content.lines().map(str::to_string).collect())
        .unwrap_or_default()
}
