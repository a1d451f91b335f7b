//! Serial session: the single IO task that owns the transport.
//!
//! Every command travels through one spawned task, so only one exchange is
//! ever on the wire. The task opens the port lazily on the first exchange,
//! sends the 2-byte command and collects the 2-byte response within the
//! response window.
//!
//! Devices behind USB CDC-ACM bridges sometimes deliver the two response
//! bytes in separate reads. A lone byte is held until the next lone byte
//! arrives and the pair is treated as one response. Bursts of any other
//! length are logged and discarded.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use dtmlib_core::error::{Error, Result};
use dtmlib_core::transport::Transport;

use crate::codec::{Command, Response};

/// Default response window for one exchange.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Configuration for the IO task.
#[derive(Debug, Clone)]
pub(crate) struct IoConfig {
    /// How long to wait for the response to a command.
    pub response_timeout: Duration,
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// A request sent to the IO task.
pub(crate) enum Request {
    /// Open the port if it is not open yet.
    Open { reply: oneshot::Sender<Result<()>> },
    /// Send a command and wait for its response.
    Exchange {
        command: Command,
        reply: oneshot::Sender<Result<Option<Response>>>,
    },
    /// Close the port.
    Close { reply: oneshot::Sender<Result<()>> },
    /// Stop the task and hand the transport back.
    Shutdown {
        reply: oneshot::Sender<Box<dyn Transport>>,
    },
}

/// Handle to the serial session task.
///
/// Cheap to clone; all clones talk to the same task and therefore share one
/// FIFO of exchanges.
#[derive(Clone)]
pub struct DtmLink {
    cmd_tx: mpsc::Sender<Request>,
    cancel: CancellationToken,
}

impl DtmLink {
    /// Open the port now instead of on the first exchange.
    ///
    /// A port that is already open counts as success.
    pub async fn open(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Open { reply }).await?;
        rx.await.map_err(|_| Error::NotConnected)?
    }

    /// Send `command` and wait for the response.
    ///
    /// Returns `Ok(None)` when no complete response arrived within the
    /// response window. Errors are reserved for port failures.
    pub async fn send(&self, command: Command) -> Result<Option<Response>> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Exchange { command, reply }).await?;
        rx.await.map_err(|_| Error::NotConnected)?
    }

    /// Close the port. The next exchange reopens it.
    pub async fn close(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Close { reply }).await?;
        rx.await.map_err(|_| Error::NotConnected)?
    }

    /// Stop the task and recover the transport.
    pub async fn shutdown(&self) -> Result<Box<dyn Transport>> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Shutdown { reply }).await?;
        rx.await.map_err(|_| Error::NotConnected)
    }

    /// Stop the task without recovering the transport.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn request(&self, request: Request) -> Result<()> {
        self.cmd_tx
            .send(request)
            .await
            .map_err(|_| Error::NotConnected)
    }
}

/// Spawn the IO task. Must be called from within a Tokio runtime.
pub(crate) fn spawn_io_task(
    transport: Box<dyn Transport>,
    config: IoConfig,
) -> (DtmLink, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<Request>(32);
    let cancel = CancellationToken::new();

    let task = tokio::spawn(io_loop(transport, config, cmd_rx, cancel.clone()));

    (DtmLink { cmd_tx, cancel }, task)
}

/// Read window used while no exchange is in progress.
const IDLE_READ: Duration = Duration::from_millis(100);

/// Runs as a spawned Tokio task.
///
/// Priority order:
/// 1. Cancellation
/// 2. Requests
/// 3. Draining unsolicited bytes while the port is open
async fn io_loop(
    mut transport: Box<dyn Transport>,
    config: IoConfig,
    mut cmd_rx: mpsc::Receiver<Request>,
    cancel: CancellationToken,
) {
    let mut opened = false;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("IO task cancelled");
                break;
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Request::Open { reply }) => {
                        let result = ensure_open(&mut *transport, &mut opened).await;
                        let _ = reply.send(result);
                    }
                    Some(Request::Exchange { command, reply }) => {
                        let result = execute_exchange(
                            &mut *transport,
                            &mut opened,
                            command,
                            &config,
                        ).await;
                        let _ = reply.send(result);
                    }
                    Some(Request::Close { reply }) => {
                        let result = close_port(&mut *transport, &mut opened).await;
                        let _ = reply.send(result);
                    }
                    Some(Request::Shutdown { reply }) => {
                        debug!("IO task shutdown requested");
                        let _ = reply.send(transport);
                        return;
                    }
                    None => {
                        debug!("all link handles dropped, exiting IO task");
                        break;
                    }
                }
            }

            // Late responses to timed-out exchanges land here.
            _ = async {
                let mut buf = [0u8; 64];
                match transport.receive(&mut buf, IDLE_READ).await {
                    Ok(n) if n > 0 => {
                        debug!(data = ?&buf[..n], "discarding unsolicited data");
                    }
                    _ => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }, if opened => {}
        }
    }
}

async fn ensure_open(transport: &mut dyn Transport, opened: &mut bool) -> Result<()> {
    if *opened {
        return Ok(());
    }
    match transport.open().await {
        Ok(()) | Err(Error::PortAlreadyOpen) => {
            *opened = true;
            Ok(())
        }
        Err(e @ Error::PortUnavailable(_)) => Err(e),
        Err(e) => Err(Error::PortUnavailable(e.to_string())),
    }
}

async fn close_port(transport: &mut dyn Transport, opened: &mut bool) -> Result<()> {
    if !*opened {
        debug!("close requested while port is not open");
        return Ok(());
    }
    *opened = false;
    match transport.close().await {
        Ok(()) => Ok(()),
        Err(e @ Error::PortCloseFailed(_)) => Err(e),
        Err(e) => Err(Error::PortCloseFailed(e.to_string())),
    }
}

async fn execute_exchange(
    transport: &mut dyn Transport,
    opened: &mut bool,
    command: Command,
    config: &IoConfig,
) -> Result<Option<Response>> {
    ensure_open(transport, opened).await?;

    let bytes = command.to_bytes();
    trace!(command = ?bytes, "sending DTM command");
    transport.send(&bytes).await?;

    let deadline = Instant::now() + config.response_timeout;
    let mut reassembler = Reassembler::default();
    let mut buf = [0u8; 64];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match transport.receive(&mut buf, remaining).await {
            Ok(n) => {
                if let Some(response) = reassembler.push(&buf[..n]) {
                    trace!(response = ?response.bytes(), "received DTM response");
                    return Ok(Some(response));
                }
            }
            Err(Error::Timeout) => break,
            Err(e) => return Err(e),
        }
    }

    debug!(command = ?bytes, "no response within the response window");
    Ok(None)
}

/// Joins single-byte bursts into 2-byte responses.
#[derive(Debug, Default)]
pub(crate) struct Reassembler {
    pending: Option<u8>,
}

impl Reassembler {
    /// Feed one received burst; returns a response once two bytes are in.
    pub fn push(&mut self, burst: &[u8]) -> Option<Response> {
        match *burst {
            [byte] => match self.pending.take() {
                Some(first) => Some(Response::new([first, byte])),
                None => {
                    self.pending = Some(byte);
                    None
                }
            },
            [msb, lsb] => {
                if let Some(stale) = self.pending.take() {
                    debug!(stale, "dropping lone byte before full response");
                }
                Some(Response::new([msb, lsb]))
            }
            _ => {
                warn!(len = burst.len(), data = ?burst, "unexpected burst length, discarding");
                None
            }
        }
    }
}
