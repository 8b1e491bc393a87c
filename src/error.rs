//! Canonical error and result types for the crate.
//!
//! The error surface is a closed set: every fallible public operation
//! returns one of the variants below. Broker-reported failures carry the
//! peer's message and exception class; transport failures wrap the
//! underlying I/O error.

use std::io;

/// Top-level error type exposed by `wiremq`.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// An entity was used after close, or required configuration is missing.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// A caller supplied an argument outside the accepted domain.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    /// A bounded wait expired before the operation completed.
    #[error("operation timed out")]
    Timeout,
    /// The underlying transport failed, or reconnection was exhausted.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// The peer sent bytes that violate the negotiated wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The broker answered a command with an exception response.
    #[error("broker error [{exception_class}]: {message}")]
    Broker {
        /// Human-readable message carried by the exception response.
        message: String,
        /// Class tag of the remote exception.
        exception_class: String,
    },
    /// The operation is not supported by the negotiated wire format.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// An error augmented with the call site that observed it.
    #[error("{site}: {source}")]
    At {
        /// Origin marker added while unwinding.
        site: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<MessagingError>,
    },
}

impl MessagingError {
    /// Build an [`MessagingError::IllegalState`] from any displayable message.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Build an [`MessagingError::IllegalArgument`] from any displayable message.
    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Self::IllegalArgument(message.into())
    }

    /// Build an [`MessagingError::Protocol`] from any displayable message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Build a [`MessagingError::Transport`] that does not originate from a
    /// live socket, such as a failed reconnect or a closed writer channel.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(io::Error::other(message.into()))
    }

    /// Wrap this error with the origin site that observed it.
    ///
    /// Used by the template layer so a failure raised deep inside a user
    /// callback still names the operation that was running.
    #[must_use]
    pub fn at(self, site: &'static str) -> Self {
        Self::At {
            site,
            source: Box::new(self),
        }
    }

    /// True when the error means the transport is unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Protocol(_) => true,
            Self::At { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

/// Canonical result alias used by `wiremq` public APIs.
pub type Result<T> = std::result::Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_preserves_the_source_chain() {
        let err = MessagingError::Timeout.at("send on queue://q1");
        assert!(matches!(
            err,
            MessagingError::At {
                site: "send on queue://q1",
                ..
            }
        ));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn fatality_is_visible_through_augmentation() {
        let err = MessagingError::protocol("unknown tag 99").at("receive");
        assert!(err.is_fatal());
        assert!(!MessagingError::Timeout.is_fatal());
    }
}
