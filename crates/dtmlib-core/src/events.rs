//! Test lifecycle event types.
//!
//! Events are emitted by the test controller at each lifecycle transition.
//! They are delivered synchronously to registered listener callbacks and
//! also published through a `tokio::sync::broadcast` channel for
//! consumers that prefer to await them.

use crate::types::TestKind;

/// An event emitted by the test controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DtmEvent {
    /// A new test call has begun; displays should clear per-channel state.
    Reset,

    /// The device accepted a start command and is now transmitting or
    /// receiving on `channel`.
    Started {
        kind: TestKind,
        /// Channel index (0..=39).
        channel: u8,
    },

    /// The test on `channel` ended.
    Ended {
        kind: TestKind,
        channel: u8,
        /// Packets counted by the device. Only reported for receiver tests.
        packets: Option<u32>,
    },
}
