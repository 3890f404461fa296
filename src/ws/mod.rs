//! Core connection infrastructure.
//!
//! This module provides transport-agnostic connection management: a per-endpoint state
//! machine with reconnection, outbound buffering and event fan-out. Concrete sockets plug in
//! through the [`Connector`] and [`Transport`] traits.
//!
//! # Architecture
//!
//! - [`BackoffPolicy`]: Reconnect delay calculator
//! - [`OutboundQueue`]: Bounded buffer replayed when the connection opens
//! - [`ConnectionManager`]: One endpoint's lifecycle as an explicit state machine
//! - [`Scheduler`]: Cancellable timers for retries and connection timeouts
//!
//! # Example
//!
//! ```ignore
//! let connection = ConnectionManager::with_tokio(endpoint, Config::default(), connector)?;
//! connection.add_listener(EventInterest::ALL, Arc::new(|event| println!("{event:?}")));
//! connection.connect();
//! ```

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod message;
pub mod queue;
pub mod timer;
pub mod traits;
#[cfg(feature = "tungstenite")]
pub mod tungstenite;

pub use backoff::BackoffPolicy;
pub use config::{Config, QueueConfig, ReconnectConfig};
pub use connection::{ConnectionManager, ConnectionState, TransportEvents};
pub use event::{ConnectionEvent, EventInterest, Listener, ListenerId, Subscribers};
pub use error::TransportError;
pub use message::Message;
pub use queue::{OutboundQueue, SendOutcome};
pub use timer::{Scheduler, TimerHandle, TokioScheduler};
pub use traits::*;
#[cfg(feature = "tungstenite")]
pub use tungstenite::{HeartbeatConfig, WsConnector};
