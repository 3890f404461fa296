#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// Transport-level failure variants.
///
/// These are `Clone` so they can be carried inside [`ConnectionEvent`](super::ConnectionEvent)s
/// that are fanned out to many subscribers.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Opening or maintaining the connection failed
    Connection(String),
    /// The connection did not open within the configured timeout
    Timeout(Duration),
    /// A send was attempted while disconnected with queueing disabled
    SendRejected,
    /// The outbound queue was full and the oldest messages were evicted
    QueueOverflow {
        /// Number of messages that were evicted
        dropped: usize,
    },
    /// Automatic reconnection gave up
    MaxRetriesExceeded {
        /// Number of reconnection attempts made in the cycle
        attempts: u32,
    },
    /// The transport is closed and cannot carry frames
    ConnectionClosed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(reason) => write!(f, "Connection error: {reason}"),
            Self::Timeout(after) => write!(f, "Connection timed out after {after:?}"),
            Self::SendRejected => write!(f, "Send rejected: not connected and queueing disabled"),
            Self::QueueOverflow { dropped } => {
                write!(f, "Outbound queue overflow, dropped {dropped} oldest messages")
            }
            Self::MaxRetriesExceeded { attempts } => {
                write!(f, "Gave up reconnecting after {attempts} attempts")
            }
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl StdError for TransportError {}

impl From<TransportError> for crate::error::Error {
    fn from(e: TransportError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Transport, e)
    }
}

#[cfg(feature = "tungstenite")]
impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(e.to_string())
    }
}
