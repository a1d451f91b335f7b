//! DtmBuilder -- fluent builder for constructing [`TestController`]
//! instances.
//!
//! Separates configuration from construction so that callers can set the
//! serial port, line speed, response window and initial test parameters
//! before the session task is spawned. The port itself is opened lazily by
//! the first command.
//!
//! # Example
//!
//! ```no_run
//! use dtmlib::DtmBuilder;
//! use dtmlib_core::Phy;
//! use std::time::Duration;
//!
//! # async fn example() -> dtmlib_core::Result<()> {
//! let dtm = DtmBuilder::new()
//!     .serial_port("/dev/ttyACM0")
//!     .response_timeout(Duration::from_millis(500))
//!     .phy(Phy::Le2M)
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use dtmlib_core::error::{Error, Result};
use dtmlib_core::transport::Transport;
use dtmlib_core::types::{ModulationIndex, Phy};
use dtmlib_transport::{DTM_BAUD_RATE, SerialConfig, SerialTransport};

use crate::controller::{TestConfiguration, TestController};
use crate::io::{self, DEFAULT_RESPONSE_TIMEOUT, IoConfig};

/// Fluent builder for [`TestController`].
pub struct DtmBuilder {
    serial_port: Option<String>,
    baud_rate: u32,
    response_timeout: Duration,
    configuration: TestConfiguration,
    event_capacity: usize,
}

impl Default for DtmBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DtmBuilder {
    pub fn new() -> Self {
        DtmBuilder {
            serial_port: None,
            baud_rate: DTM_BAUD_RATE,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            configuration: TestConfiguration::default(),
            event_capacity: 64,
        }
    }

    /// Set the serial port path (e.g. `/dev/ttyACM0` or `COM3`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Override the baud rate (default: 19200).
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    /// How long to wait for the response to one command (default: 1000ms).
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Replace all initial test parameters at once.
    pub fn configuration(mut self, configuration: TestConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Initial payload length in octets (default: 1).
    pub fn length(mut self, length: u8) -> Self {
        self.configuration.length = length;
        self
    }

    /// Initial PHY (default: LE 1M).
    pub fn phy(mut self, phy: Phy) -> Self {
        self.configuration.phy = phy;
        self
    }

    /// Initial modulation index (default: standard).
    pub fn modulation(mut self, modulation: ModulationIndex) -> Self {
        self.configuration.modulation = modulation;
        self
    }

    /// Initial transmit power in dBm (default: 0).
    pub fn tx_power(mut self, dbm: i8) -> Self {
        self.configuration.tx_power_dbm = dbm;
        self
    }

    /// Initial timer selection (default: 0).
    pub fn timer(mut self, timer: u8) -> Self {
        self.configuration.timer = timer;
        self
    }

    /// Capacity of the lifecycle event broadcast channel (default: 64).
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build a [`TestController`] with a caller-provided transport.
    ///
    /// This is the entry point for testing (pass a `MockTransport` from
    /// `dtmlib-test-harness`).
    pub async fn build_with_transport(
        self,
        transport: Box<dyn Transport>,
    ) -> Result<TestController> {
        let config = IoConfig {
            response_timeout: self.response_timeout,
        };
        let (link, task) = io::spawn_io_task(transport, config);
        Ok(TestController::new(
            link,
            task,
            self.configuration,
            self.event_capacity,
        ))
    }

    /// Build a [`TestController`] on a serial transport.
    ///
    /// Requires that [`serial_port()`](Self::serial_port) has been called.
    /// The port is not opened here.
    pub async fn build(self) -> Result<TestController> {
        let port = self
            .serial_port
            .clone()
            .ok_or_else(|| Error::PortUnavailable("serial_port is required for build()".into()))?;
        let serial_config = SerialConfig {
            baud_rate: self.baud_rate,
            ..SerialConfig::default()
        };
        let transport = SerialTransport::with_config(&port, serial_config);
        self.build_with_transport(Box::new(transport)).await
    }
}
