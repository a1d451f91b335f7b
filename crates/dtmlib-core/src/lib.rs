//! dtmlib-core: Core traits, types, and error definitions for dtmlib.
//!
//! This crate defines the abstractions shared by every dtmlib crate.
//! Applications that drive Bluetooth LE Direct Test Mode depend on these
//! types without pulling in a specific serial driver.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel
//! - [`DtmEvent`] -- test lifecycle notifications
//! - [`Channel`], [`Phy`], [`PacketType`] -- DTM wire vocabulary
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use events::DtmEvent;
pub use transport::Transport;
pub use types::*;
