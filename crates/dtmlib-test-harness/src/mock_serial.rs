//! Mock transport for deterministic testing of the DTM session and
//! controller.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs. Each response is a list of *bursts*, so tests
//! can reproduce a device that delivers its two response bytes in one read
//! or in two, or that emits line noise before answering.
//!
//! The mock is cheaply cloneable and all clones share state: keep one clone
//! in the test to inspect what was sent after handing the other to the
//! session task.
//!
//! # Example
//!
//! ```
//! use dtmlib_test_harness::MockTransport;
//!
//! let mock = MockTransport::new();
//! // LE Test Setup (reset) answered with a success status event.
//! mock.expect(&[0x00, 0x00], &[0x00, 0x00]);
//! // LE Test End answered with a packet report, split over two reads.
//! mock.expect_bursts(&[0xC0, 0x00], &[&[0x80], &[0x2A]]);
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dtmlib_core::error::{Error, Result};
use dtmlib_core::transport::Transport;

/// A pre-loaded request and the bursts returned for it.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// Bursts returned by successive `receive()` calls. Empty for a device
    /// that stays silent.
    bursts: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
struct MockState {
    expectations: VecDeque<Expectation>,
    /// Bursts pending for the next `receive()` calls.
    pending: VecDeque<Vec<u8>>,
    open: bool,
    open_failure: Option<String>,
    close_failure: Option<String>,
    sent_log: Vec<Vec<u8>>,
    open_calls: usize,
    close_calls: usize,
}

/// A mock [`Transport`] for testing without hardware.
///
/// Expectations are consumed in order. When `send()` is called the data is
/// recorded and matched against the next expectation; its bursts are
/// queued behind any bursts not yet read and returned by the following
/// `receive()` calls. With no burst pending,
/// `receive()` waits out its timeout and returns [`Error::Timeout`], which
/// pairs well with Tokio's paused clock.
///
/// A new mock starts closed, like a real port that the session opens
/// lazily.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a new, closed mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the log from other clones.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Expect `request` and answer with `response` as a single burst.
    pub fn expect(&self, request: &[u8], response: &[u8]) {
        self.expect_bursts(request, &[response]);
    }

    /// Expect `request` and answer with each of `bursts` in turn.
    pub fn expect_bursts(&self, request: &[u8], bursts: &[&[u8]]) {
        self.state().expectations.push_back(Expectation {
            request: request.to_vec(),
            bursts: bursts.iter().map(|b| b.to_vec()).collect(),
        });
    }

    /// Expect `request` and never answer it.
    pub fn expect_silence(&self, request: &[u8]) {
        self.expect_bursts(request, &[]);
    }

    /// Queue `data` as a burst the device sends on its own, outside any
    /// request. It is delivered after bursts already pending.
    pub fn inject_unsolicited(&self, data: &[u8]) {
        self.state().pending.push_back(data.to_vec());
    }

    /// Make every subsequent `open()` fail with
    /// [`Error::PortUnavailable`].
    pub fn fail_open(&self, reason: &str) {
        self.state().open_failure = Some(reason.to_string());
    }

    /// Make the next `close()` fail with [`Error::PortCloseFailed`]. The
    /// port stays open, as a driver that refused to close would leave it.
    pub fn fail_next_close(&self, reason: &str) {
        self.state().close_failure = Some(reason.to_string());
    }

    /// All data sent through this transport, one element per `send()`.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.state().sent_log.clone()
    }

    /// Number of `send()` calls whose data equals `request`.
    pub fn sent_count(&self, request: &[u8]) -> usize {
        self.state()
            .sent_log
            .iter()
            .filter(|sent| sent.as_slice() == request)
            .count()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.state().expectations.len()
    }

    /// Number of `open()` calls, successful or not.
    pub fn open_calls(&self) -> usize {
        self.state().open_calls
    }

    /// Number of `close()` calls, successful or not.
    pub fn close_calls(&self) -> usize {
        self.state().close_calls
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        let mut state = self.state();
        state.open_calls += 1;
        if let Some(reason) = state.open_failure.clone() {
            return Err(Error::PortUnavailable(reason));
        }
        if state.open {
            return Err(Error::PortAlreadyOpen);
        }
        state.open = true;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        if !state.open {
            return Err(Error::NotConnected);
        }

        state.sent_log.push(data.to_vec());

        match state.expectations.pop_front() {
            Some(expectation) if expectation.request == data => {
                state.pending.extend(expectation.bursts);
                Ok(())
            }
            Some(expectation) => {
                tracing::warn!(expected = ?expectation.request, got = ?data, "mock: unexpected send");
                Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "unexpected send data: expected {:02X?}, got {:02X?}",
                        expectation.request, data
                    ),
                )))
            }
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("no more expectations in mock transport, got {:02X?}", data),
            ))),
        }
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let burst = {
            let mut state = self.state();
            if !state.open {
                return Err(Error::NotConnected);
            }
            state.pending.pop_front()
        };

        match burst {
            Some(burst) => {
                let n = burst.len().min(buf.len());
                buf[..n].copy_from_slice(&burst[..n]);
                Ok(n)
            }
            None => {
                tokio::time::sleep(timeout).await;
                Err(Error::Timeout)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state();
        state.close_calls += 1;
        if let Some(reason) = state.close_failure.take() {
            return Err(Error::PortCloseFailed(reason));
        }
        if !state.open {
            return Err(Error::PortCloseFailed("port is not open".into()));
        }
        state.open = false;
        state.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn opened() -> MockTransport {
        let mut mock = MockTransport::new();
        mock.open().await.unwrap();
        mock
    }

    #[tokio::test]
    async fn mock_transport_basic_send_receive() {
        let mut mock = opened().await;
        mock.expect(&[0x00, 0x00], &[0x00, 0x00]);

        mock.send(&[0x00, 0x00]).await.unwrap();

        let mut buf = [0u8; 8];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[0x00, 0x00]);
    }

    #[tokio::test]
    async fn mock_transport_split_bursts() {
        let mut mock = opened().await;
        mock.expect_bursts(&[0xC0, 0x00], &[&[0x80], &[0x05]]);
        mock.send(&[0xC0, 0x00]).await.unwrap();

        let mut buf = [0u8; 8];
        let n = mock.receive(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], &[0x80]);
        let n = mock.receive(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], &[0x05]);
    }

    #[tokio::test(start_paused = true)]
    async fn mock_transport_silence_times_out() {
        let mut mock = opened().await;
        mock.expect_silence(&[0x40, 0x00]);
        mock.send(&[0x40, 0x00]).await.unwrap();

        let mut buf = [0u8; 8];
        let result = mock.receive(&mut buf, Duration::from_millis(1000)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn mock_transport_unread_bursts_stay_queued() {
        let mut mock = opened().await;
        mock.inject_unsolicited(&[0x80]);
        mock.expect(&[0x00, 0x00], &[0x00, 0x00]);
        mock.send(&[0x00, 0x00]).await.unwrap();

        let mut buf = [0u8; 8];
        let n = mock.receive(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], &[0x80]);
        let n = mock.receive(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], &[0x00, 0x00]);
    }

    #[tokio::test]
    async fn mock_transport_clones_share_log() {
        let mut mock = opened().await;
        let observer = mock.clone();
        mock.expect(&[0x00, 0x00], &[0x00, 0x00]);
        mock.send(&[0x00, 0x00]).await.unwrap();

        assert_eq!(observer.sent_data(), vec![vec![0x00, 0x00]]);
        assert_eq!(observer.sent_count(&[0x00, 0x00]), 1);
        assert_eq!(observer.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn mock_transport_wrong_data_errors() {
        let mut mock = opened().await;
        mock.expect(&[0x00, 0x00], &[0x00, 0x00]);

        let result = mock.send(&[0xC0, 0x00]).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn mock_transport_no_expectations_errors() {
        let mut mock = opened().await;
        let result = mock.send(&[0x00, 0x00]).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn mock_transport_requires_open() {
        let mut mock = MockTransport::new();
        assert!(!mock.is_connected());
        let result = mock.send(&[0x00, 0x00]).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn mock_transport_open_twice_reports_already_open() {
        let mut mock = opened().await;
        let result = mock.open().await;
        assert!(matches!(result, Err(Error::PortAlreadyOpen)));
        assert_eq!(mock.open_calls(), 2);
    }

    #[tokio::test]
    async fn mock_transport_open_failure() {
        let mut mock = MockTransport::new();
        mock.fail_open("device busy");
        let result = mock.open().await;
        assert!(matches!(result, Err(Error::PortUnavailable(_))));
        assert!(!mock.is_connected());
    }

    #[tokio::test]
    async fn mock_transport_close_failure_keeps_port_open() {
        let mut mock = opened().await;
        mock.fail_next_close("driver error");

        let result = mock.close().await;
        assert!(matches!(result, Err(Error::PortCloseFailed(_))));
        assert!(mock.is_connected());

        mock.close().await.unwrap();
        assert!(!mock.is_connected());
        assert_eq!(mock.close_calls(), 2);
    }
}
