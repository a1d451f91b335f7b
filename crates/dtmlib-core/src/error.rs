//! Error types for dtmlib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Port lifecycle failures, malformed
//! responses, and transport-level I/O errors are all captured here.
//!
//! A start command rejected by the device is *not* an error: test
//! operations report it as an unsuccessful outcome instead.

/// The error type for all dtmlib operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The serial device could not be opened.
    ///
    /// Fatal to the current operation and never retried automatically.
    #[error("port unavailable: {0}")]
    PortUnavailable(String),

    /// The driver reported that the port is already open or being opened.
    ///
    /// The session layer treats this as a successful open.
    #[error("port already open")]
    PortAlreadyOpen,

    /// The serial device reported an error while closing.
    ///
    /// A later open attempt is still allowed.
    #[error("failed to close port: {0}")]
    PortCloseFailed(String),

    /// A response did not have the fixed two-byte shape.
    #[error("malformed response: expected 2 bytes, got {0}")]
    MalformedResponse(usize),

    /// Timed out waiting for data from the device.
    #[error("timeout waiting for response")]
    Timeout,

    /// No connection to the device has been established, or the session
    /// task has stopped.
    #[error("not connected")]
    NotConnected,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
