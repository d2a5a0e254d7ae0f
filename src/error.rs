//! # Error Types
//!
//! This module defines the error taxonomy for the connection engine. Errors
//! fall into two families:
//!
//! - **Recoverable**: validation failures, queue caps, timeouts and remote
//!   method errors. The connection stays healthy and the caller may retry.
//! - **Fatal**: transport, authentication and protocol failures. The engine
//!   closes the connection before returning these.
//!
//! Callback results bubble through [`Connection::process`] unchanged so that
//! event-loop integrators can surface application errors.
//!
//! [`Connection::process`]: crate::Connection::process

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the connection engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller passed an empty, malformed or out-of-range argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted in the wrong connection state.
    ///
    /// Configuration setters require `Unset`; everything else requires the
    /// connection to have been started.
    #[error("operation not permitted in state {0:?}")]
    PermissionDenied(crate::connection::State),

    /// `process()` was invoked from inside a message callback.
    #[error("connection is already dispatching")]
    Busy,

    /// Operation before the connection was started, or after it closed.
    #[error("not connected")]
    NotConnected,

    /// The process forked since the connection was created.
    ///
    /// Connections do not survive `fork()`; the child must open its own.
    #[error("connection was created by another process")]
    ChildGuard,

    /// A bounded message queue is full; the message was not enqueued.
    #[error("message queue capacity exceeded")]
    OutOfBuffer,

    /// Read, write or connect failed. The connection is closed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The authentication handshake was rejected. The connection is closed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed frame, unexpected Hello reply or unsupported protocol
    /// version. The connection is closed.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A synchronous call ran past its deadline.
    #[error("method call timed out")]
    Timeout,

    /// The peer answered a method call with an error message.
    #[error("remote error {name}: {message}")]
    Remote {
        /// D-Bus error name, e.g. `org.freedesktop.DBus.Error.UnknownMethod`.
        name: String,
        /// Human-readable error text from the reply body.
        message: String,
    },
}

impl Error {
    /// Whether this error closes the connection when it surfaces from the
    /// dispatch loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Auth(_) | Error::Protocol(_)
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Transport(std::io::Error::from_raw_os_error(e as i32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::Auth("rejected".into()).is_fatal());
        assert!(Error::protocol("bad frame").is_fatal());
        assert!(!Error::OutOfBuffer.is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::NotConnected.is_fatal());
    }

    #[test]
    fn transport_errors_close_the_connection_kind() {
        let e = Error::Transport(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(e.is_fatal());
    }
}
