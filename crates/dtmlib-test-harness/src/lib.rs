//! dtmlib-test-harness: Test utilities and mock transports for dtmlib.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! the DTM session and test controller without a radio attached.

pub mod mock_serial;

pub use mock_serial::MockTransport;
