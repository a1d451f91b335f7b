//! Bluetooth LE Direct Test Mode (DTM) over a 2-wire UART.
//!
//! This crate drives a BLE controller running DTM firmware. It provides:
//!
//! - **Command codec** ([`codec`]) -- pack and unpack the 16-bit DTM command
//!   and response words.
//! - **Serial session** ([`io`]) -- one IO task owning the transport, with
//!   lazy open, a single in-flight exchange and response reassembly.
//! - **TestController** ([`controller`]) -- setup commands, single-channel
//!   and sweep transmitter/receiver tests with main and per-step timeouts,
//!   and lifecycle events.
//! - **DtmBuilder** ([`builder`]) -- fluent construction over a serial port
//!   or any [`Transport`](dtmlib_core::Transport).
//!
//! # Example
//!
//! ```
//! use dtmlib::codec::{decode_response, encode_end, Report};
//!
//! assert_eq!(encode_end().to_bytes(), [0xC0, 0x00]);
//!
//! let report = decode_response(&[0x80, 0x05]).unwrap();
//! assert_eq!(report, Report::PacketReport { packets: 5 });
//! ```

pub mod builder;
pub mod codec;
pub mod controller;
pub mod io;

pub use builder::DtmBuilder;
pub use controller::{ListenerId, Sweep, TestConfiguration, TestController, TestOutcome, TestState};
pub use io::DtmLink;
