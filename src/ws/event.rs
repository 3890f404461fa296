#![expect(
    clippy::module_name_repetitions,
    reason = "Event types carry the module name so they read clearly when re-exported"
)]

//! Lifecycle and message events fanned out to collaborators.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bitflags::bitflags;

use super::error::TransportError;
use super::message::Message;

/// Everything a connection reports to the outside world.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A connection attempt started
    Connecting,
    /// The transport opened
    Connected,
    /// The transport closed, or the client disconnected
    Disconnected {
        /// Close code reported by the transport, if any
        code: Option<u16>,
        /// Close reason reported by the transport
        reason: String,
    },
    /// The transport failed to open, timed out, or errored while open
    Error(TransportError),
    /// A reconnection attempt has been scheduled
    Reconnecting {
        /// 1-based attempt number within the current cycle
        attempt: u32,
        /// Delay before the attempt fires
        delay: Duration,
    },
    /// Automatic reconnection gave up; the connection stays down until connected explicitly
    MaxReconnectAttemptsReached {
        /// Attempts made in the exhausted cycle
        attempts: u32,
    },
    /// An inbound frame
    Message(Message),
    /// The outbound queue evicted its oldest entries to stay within capacity
    QueueOverflow {
        /// Number of evicted messages
        dropped: usize,
    },
    /// Timers were cancelled and the transport released
    Cleanup,
}

impl ConnectionEvent {
    /// The interest flag matching this event.
    #[must_use]
    pub const fn interest(&self) -> EventInterest {
        match self {
            Self::Connecting => EventInterest::CONNECTING,
            Self::Connected => EventInterest::CONNECTED,
            Self::Disconnected { .. } => EventInterest::DISCONNECTED,
            Self::Error(_) => EventInterest::ERROR,
            Self::Reconnecting { .. } => EventInterest::RECONNECTING,
            Self::MaxReconnectAttemptsReached { .. } => EventInterest::MAX_RECONNECT_ATTEMPTS,
            Self::Message(_) => EventInterest::MESSAGE,
            Self::QueueOverflow { .. } => EventInterest::QUEUE_OVERFLOW,
            Self::Cleanup => EventInterest::CLEANUP,
        }
    }

    #[must_use]
    pub const fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventInterest: u16 {
        /// No interest in any event.
        const NONE = 0;

        const CONNECTING = 1;

        const CONNECTED = 1 << 1;

        const DISCONNECTED = 1 << 2;

        const ERROR = 1 << 3;

        const RECONNECTING = 1 << 4;

        const MAX_RECONNECT_ATTEMPTS = 1 << 5;

        const MESSAGE = 1 << 6;

        const QUEUE_OVERFLOW = 1 << 7;

        const CLEANUP = 1 << 8;

        /// Interest in every connection state change.
        const LIFECYCLE = Self::CONNECTING.bits()
            | Self::CONNECTED.bits()
            | Self::DISCONNECTED.bits()
            | Self::ERROR.bits()
            | Self::RECONNECTING.bits()
            | Self::MAX_RECONNECT_ATTEMPTS.bits()
            | Self::CLEANUP.bits();

        /// Interest in all events.
        const ALL = Self::LIFECYCLE.bits() | Self::MESSAGE.bits() | Self::QUEUE_OVERFLOW.bits();
    }
}

impl Default for EventInterest {
    fn default() -> Self {
        Self::ALL
    }
}

/// Callback invoked for each event.
pub type Listener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Identity of one registration in a [`Subscribers`] list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    interest: EventInterest,
    listener: Listener,
}

/// Ordered list of listeners.
///
/// Dispatch iterates a snapshot taken before the first callback runs, so listeners may
/// add or remove registrations (including their own) while an event is being delivered.
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    entries: Mutex<Vec<Registration>>,
}

impl Subscribers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, interest: EventInterest, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Registration {
            id,
            interest,
            listener,
        });
        id
    }

    /// Returns whether `id` was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|r| r.id != id);
        entries.len() != before
    }

    #[must_use]
    pub fn contains(&self, id: ListenerId) -> bool {
        self.lock().iter().any(|r| r.id == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Deliver `event` to every listener interested in it, in registration order.
    pub fn emit(&self, event: &ConnectionEvent) {
        let interest = event.interest();
        let snapshot: Vec<Listener> = self
            .lock()
            .iter()
            .filter(|r| r.interest.intersects(interest))
            .map(|r| Arc::clone(&r.listener))
            .collect();

        for listener in snapshot {
            listener(event);
        }
    }

    // Registrations have no invariant spanning the lock, so a poisoned list is still usable.
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Registration>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
