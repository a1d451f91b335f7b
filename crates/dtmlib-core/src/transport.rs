//! Transport trait for DTM communication.
//!
//! The [`Transport`] trait abstracts over the physical serial link to a
//! Bluetooth LE controller running Direct Test Mode firmware. The real
//! implementation lives in `dtmlib-transport`; `dtmlib-test-harness`
//! provides a scripted mock for deterministic tests.
//!
//! The session layer in `dtmlib` owns exactly one `Transport` and decides
//! when it is opened and closed. Implementations must not open the device
//! on construction.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to a DTM device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the underlying device.
    ///
    /// Returns [`Error::PortAlreadyOpen`](crate::error::Error::PortAlreadyOpen)
    /// if the device is already open or an open is in progress, and
    /// [`Error::PortUnavailable`](crate::error::Error::PortUnavailable) for
    /// any other failure.
    async fn open(&mut self) -> Result<()>;

    /// Write raw bytes to the device.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive one burst of bytes from the device into `buf`.
    ///
    /// A DTM response may arrive as a single 2-byte burst or as two 1-byte
    /// bursts; reassembly is the caller's job. Waits up to `timeout` and
    /// returns [`Error::Timeout`](crate::error::Error::Timeout) if nothing
    /// arrives.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the device.
    ///
    /// Returns [`Error::PortCloseFailed`](crate::error::Error::PortCloseFailed)
    /// if the driver reports an error. Reopening afterwards is allowed.
    async fn close(&mut self) -> Result<()>;

    /// Check whether the device is currently open.
    fn is_connected(&self) -> bool;
}
