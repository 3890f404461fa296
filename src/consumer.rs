//! Per-consumer binding to one endpoint.
//!
//! A [`ConsumerFacade`] is what an application component holds: it exposes the connection
//! state, the latest message and a bounded history, and it tears its binding down when
//! disposed or dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Result;
use crate::registry::{ConnectionRegistry, Subscription};
use crate::ws::{
    ConnectionEvent, ConnectionManager, ConnectionState, Endpoint, EventInterest, Listener,
    ListenerId, Message, SendOutcome, TransportError,
};

const DEFAULT_MAX_HISTORY_SIZE: usize = 100;

/// Consumer-local settings.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ConsumerOptions {
    /// Number of inbound messages retained; the oldest are evicted beyond this
    #[builder(default = DEFAULT_MAX_HISTORY_SIZE)]
    pub max_history_size: usize,
    /// Bind and connect as soon as the facade is created
    #[builder(default = true)]
    pub auto_connect: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// An inbound message and the moment it was observed.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub payload: Message,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug)]
struct History {
    capacity: usize,
    messages: VecDeque<ReceivedMessage>,
    /// Tracked apart from `messages`, which may retain nothing.
    last: Option<ReceivedMessage>,
}

impl History {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: VecDeque::new(),
            last: None,
        }
    }

    fn push(&mut self, payload: Message) {
        let received = ReceivedMessage {
            payload,
            received_at: Utc::now(),
        };
        if self.capacity == 0 {
            self.last = Some(received);
            return;
        }
        self.last = Some(received.clone());
        self.messages.push_back(received);
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
    }
}

#[derive(Debug)]
enum Binding {
    /// Multiplexed through a registry; only this consumer's subscription is owned.
    Shared {
        registry: ConnectionRegistry,
        endpoint: Endpoint,
        subscription: Option<Subscription>,
    },
    /// A manager owned outright by this consumer.
    Dedicated {
        manager: ConnectionManager,
        listener: Option<ListenerId>,
    },
}

/// One consumer's view of a connection.
#[derive(Debug)]
pub struct ConsumerFacade {
    binding: Binding,
    history: Arc<Mutex<History>>,
}

impl ConsumerFacade {
    /// Bind to `endpoint` through `registry`, sharing its connection with other consumers.
    #[must_use]
    pub fn shared(
        registry: &ConnectionRegistry,
        endpoint: Endpoint,
        options: &ConsumerOptions,
    ) -> Self {
        let mut facade = Self {
            binding: Binding::Shared {
                registry: registry.clone(),
                endpoint,
                subscription: None,
            },
            history: Self::new_history(options),
        };
        if options.auto_connect {
            facade.connect();
        }
        facade
    }

    /// Take ownership of `manager`; disposing the facade tears the manager down.
    #[must_use]
    pub fn dedicated(manager: ConnectionManager, options: &ConsumerOptions) -> Self {
        let history = Self::new_history(options);
        let listener = manager.add_listener(EventInterest::MESSAGE, Self::recorder(&history));
        if options.auto_connect {
            manager.connect();
        }

        Self {
            binding: Binding::Dedicated {
                manager,
                listener: Some(listener),
            },
            history,
        }
    }

    /// Send through the bound connection.
    ///
    /// A shared facade that has released its subscription has no connection to send through
    /// and fails with [`TransportError::ConnectionClosed`].
    pub fn send_message(&self, message: Message) -> Result<SendOutcome> {
        match &self.binding {
            Binding::Shared {
                registry,
                endpoint,
                subscription,
            } => {
                if subscription.is_none() {
                    return Err(TransportError::ConnectionClosed.into());
                }
                registry
                    .send(endpoint, message)?
                    .ok_or_else(|| TransportError::ConnectionClosed.into())
            }
            Binding::Dedicated { manager, .. } => manager.send(message),
        }
    }

    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<SendOutcome> {
        self.send_message(Message::json(value)?)
    }

    /// Bind (shared) or start connecting (dedicated).
    pub fn connect(&mut self) {
        match &mut self.binding {
            Binding::Shared {
                registry,
                endpoint,
                subscription,
            } => {
                if subscription.is_none() {
                    *subscription = Some(registry.subscribe_with(
                        endpoint.clone(),
                        EventInterest::MESSAGE,
                        Self::recorder(&self.history),
                    ));
                } else if let Some(manager) = registry.manager(endpoint) {
                    manager.connect();
                }
            }
            Binding::Dedicated { manager, .. } => manager.connect(),
        }
    }

    /// Release the shared subscription, or close the dedicated connection.
    ///
    /// Other consumers of a shared endpoint keep their connection.
    pub fn disconnect(&mut self) {
        match &mut self.binding {
            Binding::Shared { subscription, .. } => {
                if let Some(subscription) = subscription.take() {
                    subscription.unsubscribe();
                }
            }
            Binding::Dedicated { manager, .. } => manager.disconnect(),
        }
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        match &self.binding {
            Binding::Shared {
                registry,
                endpoint,
                subscription,
            } => {
                if subscription.is_some() {
                    registry.connection_state(endpoint)
                } else {
                    ConnectionState::Idle
                }
            }
            Binding::Dedicated { manager, .. } => manager.state(),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        match &self.binding {
            Binding::Shared { endpoint, .. } => endpoint,
            Binding::Dedicated { manager, .. } => manager.endpoint(),
        }
    }

    #[must_use]
    pub fn last_message(&self) -> Option<ReceivedMessage> {
        self.lock_history().last.clone()
    }

    /// Retained messages, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<ReceivedMessage> {
        self.lock_history().messages.iter().cloned().collect()
    }

    /// Forget every received message, including [`Self::last_message`].
    pub fn clear_history(&self) {
        let mut history = self.lock_history();
        history.messages.clear();
        history.last = None;
    }

    /// Unregister from the connection and, for a dedicated binding, shut it down.
    pub fn dispose(self) {
        drop(self);
    }

    fn teardown(&mut self) {
        if let Binding::Dedicated { manager, listener } = &mut self.binding
            && let Some(id) = listener.take()
        {
            manager.remove_listener(id);
        }
        self.disconnect();
    }

    fn new_history(options: &ConsumerOptions) -> Arc<Mutex<History>> {
        Arc::new(Mutex::new(History::new(options.max_history_size)))
    }

    fn recorder(history: &Arc<Mutex<History>>) -> Listener {
        let history = Arc::clone(history);
        Arc::new(move |event: &ConnectionEvent| {
            if let Some(message) = event.as_message() {
                history
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(message.clone());
            }
        })
    }

    fn lock_history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConsumerFacade {
    fn drop(&mut self) {
        self.teardown();
    }
}
