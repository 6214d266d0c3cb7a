//! Error types for digitizer communication and readout.
//!
//! `AcqError` is the single error type shared by the control channel, the
//! streaming readout and the device facade. Using `thiserror`, each failure
//! category maps to one variant so callers can branch on what went wrong:
//!
//! - **`Connection`**: resolve/connect failure on either socket. Fatal to the
//!   operation in progress, never retried automatically.
//! - **`Protocol`**: a control-channel response did not parse as expected.
//! - **`ChannelClosed`** / **`Timeout`**: the control exchange could not be
//!   completed. Recover by reconnecting, not by retrying the call.
//! - **`StreamClosed`**: the data socket closed. Expected during shutdown; the
//!   readout converts it into the sentinel chunk instead of surfacing it.
//! - **`CallbackFault`**: a readout handler failed. Caught at the worker
//!   boundary and turned into a stop request.
//!
//! Contract violations (a chunk of the wrong width, indexing a site that does
//! not exist) are not represented here; they panic.

use std::time::Duration;
use thiserror::Error;

/// Result alias for digitizer operations.
pub type Result<T> = std::result::Result<T, AcqError>;

/// Coarse classification of an [`AcqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket could not be established (or none exists yet)
    Connection,
    /// Control exchange failed or returned something unexpected
    Protocol,
    /// Data stream ended
    Stream,
    /// Readout handler failed
    Callback,
    /// Invalid or unreadable settings
    Configuration,
    /// Reactor or other runtime failure
    Runtime,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Stream => "stream",
            ErrorKind::Callback => "callback",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Runtime => "runtime",
        };
        write!(f, "{}", label)
    }
}

/// Errors raised while talking to a digitizer.
#[derive(Error, Debug)]
pub enum AcqError {
    /// Resolving or connecting to an endpoint failed.
    #[error("Failed to connect to {endpoint}: {source}")]
    Connection {
        /// `host:port` that was dialled
        endpoint: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// A control response did not have the expected form.
    #[error("Unexpected response to '{command}': {message} (got {response:?})")]
    Protocol {
        /// Command that was sent
        command: String,
        /// Response text with the prompt removed
        response: String,
        /// What was expected
        message: String,
    },

    /// The control socket closed while a command was in flight.
    #[error("Control channel closed while executing '{command}': {source}")]
    ChannelClosed {
        /// Command that was in flight
        command: String,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// No prompt arrived within the command timeout.
    #[error("Timeout after {timeout:?} waiting for response to '{command}'")]
    Timeout {
        /// Command that was in flight
        command: String,
        /// Configured response timeout
        timeout: Duration,
    },

    /// The data socket closed or failed.
    #[error("Data stream closed: {0}")]
    StreamClosed(#[source] std::io::Error),

    /// A readout handler returned an error or panicked.
    #[error("Readout callback failed: {0}")]
    CallbackFault(String),

    /// The device has no address yet.
    #[error("Device is not connected")]
    NotConnected,

    /// Work was submitted after the reactor shut down.
    #[error("Reactor has been shut down")]
    ReactorShutdown,

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AcqError {
    /// Build a [`AcqError::Protocol`] for `command`.
    pub fn protocol(
        command: impl Into<String>,
        response: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Protocol {
            command: command.into(),
            response: response.into(),
            message: message.into(),
        }
    }

    /// Build a [`AcqError::ChannelClosed`] for `command`.
    pub fn channel_closed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::ChannelClosed {
            command: command.into(),
            source,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcqError::Connection { .. } | AcqError::NotConnected => ErrorKind::Connection,
            AcqError::Protocol { .. } | AcqError::ChannelClosed { .. } | AcqError::Timeout { .. } => {
                ErrorKind::Protocol
            }
            AcqError::StreamClosed(_) => ErrorKind::Stream,
            AcqError::CallbackFault(_) => ErrorKind::Callback,
            AcqError::Config(_) => ErrorKind::Configuration,
            AcqError::ReactorShutdown | AcqError::Io(_) => ErrorKind::Runtime,
        }
    }

    /// True for failures that require reconnecting before the device is usable again.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            AcqError::Connection { .. }
                | AcqError::ChannelClosed { .. }
                | AcqError::Timeout { .. }
                | AcqError::NotConnected
        )
    }
}

impl From<figment::Error> for AcqError {
    fn from(err: figment::Error) -> Self {
        AcqError::Config(err.to_string())
    }
}
