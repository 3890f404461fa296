//! Persistent client connections that survive network loss.
//!
//! `resocket` keeps long-lived duplex connections (WebSocket by default) alive on behalf
//! of many independent consumers:
//!
//! - [`ws::ConnectionManager`] drives one endpoint through connect, timeout, backoff and
//!   reconnect, buffering outbound messages while the link is down.
//! - [`registry::ConnectionRegistry`] shares one manager per endpoint between all of its
//!   subscribers and closes the connection when the last one leaves.
//! - [`consumer::ConsumerFacade`] is the handle an application component holds: state,
//!   the latest message, a bounded history and `send`.
//!
//! # Feature flags
//!
//! - `tungstenite` (default): the [`ws::WsConnector`] transport on `tokio-tungstenite`
//! - `tracing`: structured logs for state transitions, retries and queue overflow

pub mod consumer;
pub mod error;
pub mod registry;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use consumer::{ConsumerFacade, ConsumerOptions, ReceivedMessage};
pub use registry::{ConnectionRegistry, Subscription};
