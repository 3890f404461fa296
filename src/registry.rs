//! Process-scoped map of shared connections.
//!
//! Many independent consumers subscribe to the same endpoint; the registry keeps exactly one
//! [`ConnectionManager`] per endpoint, reference-counts the subscribers and tears the
//! connection down when the last one leaves.
//!
//! # Example
//!
//! ```rust, no_run
//! use futures::StreamExt as _;
//! use resocket::registry::ConnectionRegistry;
//! use resocket::ws::{Config, Endpoint, EventInterest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = ConnectionRegistry::websocket(Config::default())?;
//!
//!     let endpoint = Endpoint::new("wss://echo.example.com/socket");
//!     let stream = registry.subscribe_stream(endpoint.clone(), EventInterest::MESSAGE);
//!     let mut stream = Box::pin(stream);
//!
//!     registry.send(&endpoint, "hello".into())?;
//!     while let Some(event) = stream.next().await {
//!         println!("{event:?}");
//!     }
//!
//!     registry.shutdown();
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::sync::{Arc, Weak};

use async_stream::stream;
use dashmap::{DashMap, Entry};
use futures::Stream;
use tokio::sync::mpsc;

use crate::Result;
use crate::ws::{
    Config, ConnectionEvent, ConnectionManager, ConnectionState, Connector, Endpoint,
    EventInterest, Listener, ListenerId, Message, Scheduler, SendOutcome, Subscribers,
    TokioScheduler,
};

/// One endpoint's shared connection and the consumers attached to it.
struct Shared {
    manager: ConnectionManager,
    subscribers: Arc<Subscribers>,
}

/// Explicitly scoped replacement for a global connection map.
///
/// Cloning is cheap and every clone refers to the same map. Call
/// [`ConnectionRegistry::shutdown`] at teardown to close every connection.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    entries: DashMap<Endpoint, Arc<Shared>>,
    connector: Arc<dyn Connector>,
    scheduler: Arc<dyn Scheduler>,
    config: Config,
}

impl ConnectionRegistry {
    /// Create a registry whose timers run on the current tokio runtime.
    pub fn new(connector: Arc<dyn Connector>, config: Config) -> Result<Self> {
        let scheduler = Arc::new(TokioScheduler::current()?);
        Ok(Self::with_scheduler(connector, scheduler, config))
    }

    #[must_use]
    pub fn with_scheduler(
        connector: Arc<dyn Connector>,
        scheduler: Arc<dyn Scheduler>,
        config: Config,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: DashMap::new(),
                connector,
                scheduler,
                config,
            }),
        }
    }

    /// Registry connecting over WebSocket with the default heartbeat.
    #[cfg(feature = "tungstenite")]
    pub fn websocket(config: Config) -> Result<Self> {
        let connector = Arc::new(crate::ws::WsConnector::new()?);
        Self::new(connector, config)
    }

    /// Register `callback` for every event of `endpoint`, connecting if needed.
    pub fn subscribe<E, F>(&self, endpoint: E, callback: F) -> Subscription
    where
        E: Into<Endpoint>,
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.subscribe_with(endpoint.into(), EventInterest::ALL, Arc::new(callback))
    }

    /// Register `listener` for the events of `endpoint` selected by `interest`.
    ///
    /// The first subscriber for an endpoint creates its manager; later ones share it.
    /// A connection is started unless one is open, opening, or waiting to retry.
    pub fn subscribe_with(
        &self,
        endpoint: Endpoint,
        interest: EventInterest,
        listener: Listener,
    ) -> Subscription {
        // The map guard is released before connecting so that subscribers may re-enter.
        let (manager, id) = match self.inner.entries.entry(endpoint.clone()) {
            Entry::Occupied(o) => {
                let shared = o.get();
                #[cfg(feature = "tracing")]
                tracing::debug!(%endpoint, subscribers = shared.subscribers.len() + 1, "Multiplexing onto existing connection");
                (
                    shared.manager.clone(),
                    shared.subscribers.add(interest, listener),
                )
            }
            Entry::Vacant(v) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%endpoint, "Creating connection");
                let manager = ConnectionManager::new(
                    endpoint.clone(),
                    self.inner.config.clone(),
                    Arc::clone(&self.inner.connector),
                    Arc::clone(&self.inner.scheduler),
                );
                let subscribers = Arc::new(Subscribers::new());
                let fanout = Arc::clone(&subscribers);
                manager.add_listener(EventInterest::ALL, Arc::new(move |event| fanout.emit(event)));

                let id = subscribers.add(interest, listener);
                v.insert(Arc::new(Shared {
                    manager: manager.clone(),
                    subscribers,
                }));
                (manager, id)
            }
        };

        let state = manager.state();
        if !state.is_active() && !state.is_reconnecting() {
            manager.connect();
        }

        Subscription {
            registry: Some(Arc::downgrade(&self.inner)),
            endpoint,
            id,
        }
    }

    /// Stream of `endpoint`'s events selected by `interest`.
    ///
    /// The stream holds a subscription for as long as it lives; dropping it unsubscribes.
    pub fn subscribe_stream(
        &self,
        endpoint: Endpoint,
        interest: EventInterest,
    ) -> impl Stream<Item = ConnectionEvent> + use<> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe_with(
            endpoint,
            interest,
            Arc::new(move |event: &ConnectionEvent| {
                _ = event_tx.send(event.clone());
            }),
        );

        stream! {
            let _subscription = subscription;
            while let Some(event) = event_rx.recv().await {
                yield event;
            }
        }
    }

    /// Send through `endpoint`'s connection. Returns `None` when nobody is subscribed to it.
    pub fn send(&self, endpoint: &Endpoint, message: Message) -> Result<Option<SendOutcome>> {
        let Some(manager) = self.manager(endpoint) else {
            #[cfg(feature = "tracing")]
            tracing::debug!(%endpoint, "No connection for endpoint, message not sent");
            return Ok(None);
        };
        manager.send(message).map(Some)
    }

    /// State of `endpoint`'s connection, [`ConnectionState::Idle`] when there is none.
    #[must_use]
    pub fn connection_state(&self, endpoint: &Endpoint) -> ConnectionState {
        self.manager(endpoint)
            .map_or(ConnectionState::Idle, |manager| manager.state())
    }

    #[must_use]
    pub fn manager(&self, endpoint: &Endpoint) -> Option<ConnectionManager> {
        self.inner
            .entries
            .get(endpoint)
            .map(|shared| shared.manager.clone())
    }

    #[must_use]
    pub fn subscriber_count(&self, endpoint: &Endpoint) -> usize {
        self.inner
            .entries
            .get(endpoint)
            .map_or(0, |shared| shared.subscribers.len())
    }

    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner
            .entries
            .iter()
            .map(|shared| shared.key().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Disconnect every connection and forget all subscribers.
    pub fn shutdown(&self) {
        for endpoint in self.endpoints() {
            if let Some((_, shared)) = self.inner.entries.remove(&endpoint) {
                shared.manager.disconnect();
                shared.subscribers.clear();
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Connection registry shut down");
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("endpoints", &self.endpoints())
            .finish_non_exhaustive()
    }
}

impl RegistryInner {
    fn unsubscribe(&self, endpoint: &Endpoint, id: ListenerId) {
        // The manager stops while its entry is still locked, so a racing `subscribe` never
        // sees the endpoint vacant next to a live old connection. Its events go out after.
        let mut halted = None;
        _ = self.entries.remove_if(endpoint, |_, shared| {
            shared.subscribers.remove(id);
            let last = shared.subscribers.is_empty();
            if last {
                halted = Some(shared.manager.halt());
            }
            last
        });

        if let Some(halted) = halted {
            #[cfg(feature = "tracing")]
            tracing::debug!(%endpoint, "Last subscriber left, closing connection");
            halted.notify();
        }
    }
}

/// Registration of one consumer on one endpoint.
///
/// Dropping the subscription unsubscribes; the last subscriber to leave closes the connection.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Option<Weak<RegistryInner>>,
    endpoint: Endpoint,
    id: ListenerId,
}

impl Subscription {
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Whether the registry still delivers events to this subscription.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.registry
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|registry| {
                registry
                    .entries
                    .get(&self.endpoint)
                    .is_some_and(|shared| shared.subscribers.contains(self.id))
            })
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) {
            registry.unsubscribe(&self.endpoint, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("endpoint", &self.endpoint)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
