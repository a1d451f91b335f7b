//! Transport implementations for dtmlib.
//!
//! This crate provides [`SerialTransport`], the concrete implementation of
//! the [`Transport`](dtmlib_core::Transport) trait for the UART or USB
//! CDC-ACM link to a Direct Test Mode device.
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
//! // LE Test End
//! transport.send(&[0xC0, 0x00]).await?;
//!
//! let mut buf = [0u8; 8];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

pub mod serial;

pub use serial::{
    DTM_BAUD_RATE, DataBits, FlowControl, Parity, SerialConfig, SerialTransport, StopBits,
};
