//! Capability traits separating the connection core from concrete sockets.

use std::fmt;
use std::sync::Arc;

use url::Url;

use super::connection::TransportEvents;
use crate::Result;

/// Opaque identifier of a remote connection target, e.g. a WebSocket URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(String);

impl Endpoint {
    #[must_use]
    pub fn new<S: Into<String>>(endpoint: S) -> Self {
        Self(endpoint.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse the endpoint as a URL, for transports that need one.
    pub fn url(&self) -> Result<Url> {
        Ok(Url::parse(&self.0)?)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(endpoint: &str) -> Self {
        Self::new(endpoint)
    }
}

impl From<String> for Endpoint {
    fn from(endpoint: String) -> Self {
        Self(endpoint)
    }
}

/// Transport readiness, mirroring the WebSocket `readyState` values.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    /// Whether closing the transport would still have an effect.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One physical duplex channel.
///
/// A transport reports what happens to it through the [`TransportEvents`] handed to
/// [`Transport::open`]. It may invoke those callbacks from any thread, including
/// synchronously from inside `open`, `send` or `close`.
pub trait Transport: Send + Sync + 'static {
    /// Begin opening the channel.
    fn open(&self, events: TransportEvents) -> Result<()>;

    /// Write one text frame. Fails if the channel is not open.
    fn send(&self, frame: &str) -> Result<()>;

    /// Close the channel with a close code and reason.
    fn close(&self, code: u16, reason: &str);

    /// Current readiness. Must not call back into [`TransportEvents`].
    fn ready_state(&self) -> ReadyState;
}

/// Factory for transports, one per connection attempt.
pub trait Connector: Send + Sync + 'static {
    /// Create an unopened transport for `endpoint`.
    fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>>;
}
