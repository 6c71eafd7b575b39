use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors returned by the brokerline event loop.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or poll operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// TLS session setup failed.
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    /// The host name is not a valid TLS server name.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    /// Host/port resolved to no usable address.
    #[error("address resolution failed: {0}")]
    Resolve(String),
    /// The transport closed before the awaited condition was reached.
    #[error("connection closed")]
    ConnectionClosed,
    /// `wait_for_open` exceeded its overall bound.
    #[error("wait for open timed out after {0:?}")]
    OpenTimeout(Duration),
    /// No free connection slots available.
    #[error("connection limit reached")]
    ConnectionLimitReached,
    /// Configuration value out of range.
    #[error("invalid config: {0}")]
    Config(String),
}

/// Failure reported by a timer callback.
///
/// The sweep logs it and keeps firing the remaining due timers.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TimerError(Box<dyn std::error::Error + Send + Sync + 'static>);

impl TimerError {
    /// Wrap any error (or message) as a timer failure.
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        TimerError(err.into())
    }

    /// The underlying error.
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.0
    }
}

impl From<io::Error> for TimerError {
    fn from(err: io::Error) -> Self {
        TimerError(Box::new(err))
    }
}

impl From<Error> for TimerError {
    fn from(err: Error) -> Self {
        TimerError(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_error_from_message() {
        let err = TimerError::new("heartbeat missed");
        assert_eq!(err.to_string(), "heartbeat missed");
    }

    #[test]
    fn open_timeout_display() {
        let err = Error::OpenTimeout(Duration::from_secs(300));
        assert_eq!(err.to_string(), "wait for open timed out after 300s");
    }
}
