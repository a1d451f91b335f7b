//! Serial port transport for DTM communication.
//!
//! This module provides [`SerialTransport`], which implements the
//! [`Transport`] trait for the USB CDC-ACM or UART link to a Bluetooth LE
//! controller running Direct Test Mode firmware.
//!
//! DTM over UART uses a fixed line configuration: 19200 baud, 8 data bits,
//! no parity, 1 stop bit, no flow control. The port is *not* opened when the
//! transport is constructed; the session layer calls [`Transport::open`]
//! when it first needs the link.
//!
//! # Example
//!
//! ```no_run
//! use dtmlib_transport::SerialTransport;
//! use dtmlib_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> dtmlib_core::Result<()> {
//! let mut transport = SerialTransport::new("/dev/ttyACM0");
//! transport.open().await?;
//!
//! // LE Test Setup: reset
//! transport.send(&[0x00, 0x00]).await?;
//!
//! let mut buf = [0u8; 8];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use dtmlib_core::error::{Error, Result};
use dtmlib_core::transport::Transport;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Baud rate mandated for the DTM UART interface.
pub const DTM_BAUD_RATE: u32 = 19200;

/// Serial port configuration.
///
/// Defaults match the DTM UART interface:
/// - 19200 baud
/// - 8 data bits
/// - 1 stop bit
/// - No parity
/// - No flow control
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Baud rate (19200 for standard DTM firmware)
    pub baud_rate: u32,
    /// Number of data bits (typically 8)
    pub data_bits: DataBits,
    /// Number of stop bits (typically 1)
    pub stop_bits: StopBits,
    /// Parity checking (typically None)
    pub parity: Parity,
    /// Flow control (None for DTM)
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DTM_BAUD_RATE,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Seven,
    Eight,
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

/// Number of stop bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

impl From<FlowControl> for tokio_serial::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }
}

/// Serial port transport for a DTM device.
///
/// Construction only records the device path and line settings; the port is
/// opened by [`Transport::open`].
pub struct SerialTransport {
    /// The underlying serial port stream, present while open
    port: Option<SerialStream>,
    /// Port name for logging/debugging
    port_name: String,
    config: SerialConfig,
}

impl SerialTransport {
    /// Create a transport for `port` with the standard DTM line settings.
    ///
    /// * `port` - Serial port path (e.g. "/dev/ttyACM0" on Linux, "COM3" on Windows)
    pub fn new(port: &str) -> Self {
        Self::with_config(port, SerialConfig::default())
    }

    /// Create a transport with full configuration control.
    pub fn with_config(port: &str, config: SerialConfig) -> Self {
        SerialTransport {
            port: None,
            port_name: port.to_string(),
            config,
        }
    }

    /// Get the name of the serial port.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Get the line configuration used when opening.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Err(Error::PortAlreadyOpen);
        }

        let config = &self.config;
        tracing::debug!(
            port = %self.port_name,
            baud_rate = config.baud_rate,
            data_bits = ?config.data_bits,
            stop_bits = ?config.stop_bits,
            parity = ?config.parity,
            flow_control = ?config.flow_control,
            "Opening serial port"
        );

        let serial_stream = tokio_serial::new(&self.port_name, config.baud_rate)
            .data_bits(config.data_bits.into())
            .stop_bits(config.stop_bits.into())
            .parity(config.parity.into())
            .flow_control(config.flow_control.into())
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %self.port_name, error = %e, "Failed to open serial port");
                Error::PortUnavailable(format!("{}: {}", self.port_name, e))
            })?;

        tracing::info!(port = %self.port_name, baud_rate = config.baud_rate, "Serial port opened");

        self.port = Some(serial_stream);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(
            port = %self.port_name,
            data = ?data,
            "Sending data"
        );

        port.write_all(data).await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to send data");
            Error::Io(e)
        })?;

        port.flush().await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to flush serial port");
            Error::Io(e)
        })?;

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(Ok(n)) => {
                tracing::trace!(
                    port = %self.port_name,
                    bytes = n,
                    data = ?&buf[..n],
                    "Received data"
                );
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(port = %self.port_name, error = %e, "Failed to receive data");
                Err(Error::Io(e))
            }
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut port) = self.port.take() else {
            return Err(Error::PortCloseFailed(format!(
                "{}: port is not open",
                self.port_name
            )));
        };

        tracing::debug!(port = %self.port_name, "Closing serial port");

        // The stream is dropped (and the descriptor closed) even if the
        // final flush fails.
        let flushed = port.flush().await;
        drop(port);

        match flushed {
            Ok(()) => {
                tracing::info!(port = %self.port_name, "Serial port closed");
                Ok(())
            }
            Err(e) => {
                tracing::error!(port = %self.port_name, error = %e, "Failed to close serial port");
                Err(Error::PortCloseFailed(format!("{}: {}", self.port_name, e)))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.port.is_some() {
            tracing::debug!(port = %self.port_name, "SerialTransport dropped, closing port");
        }
    }
}
