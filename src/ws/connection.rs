#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

use super::backoff::BackoffPolicy;
use super::config::Config;
use super::error::TransportError;
use super::event::{ConnectionEvent, EventInterest, Listener, ListenerId, Subscribers};
use super::message::Message;
use super::queue::{OutboundQueue, SendOutcome};
use super::timer::{Scheduler, TimerHandle, TokioScheduler};
use super::traits::{Connector, Endpoint, ReadyState, Transport};
use crate::Result;

/// Close code sent when the client shuts a connection down on purpose.
pub const NORMAL_CLOSURE: u16 = 1000;

const CLIENT_DISCONNECT_REASON: &str = "Client disconnect";

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Closed, either by the remote side, by the client, or after giving up reconnecting
    Disconnected,
    /// The last attempt or connection failed
    Error,
    /// Waiting to retry after a failure
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Whether a connection exists or is being established.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected { .. })
    }

    #[must_use]
    pub const fn is_reconnecting(self) -> bool {
        matches!(self, Self::Reconnecting { .. })
    }
}

/// Who asked for a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller,
    Retry,
}

/// How a connection attempt or live connection ended.
enum Loss {
    Failed(TransportError),
    Closed { code: Option<u16>, reason: String },
}

/// Manages one endpoint's transport lifecycle, reconnection and outbound buffering.
///
/// The manager is an explicit state machine driven by transport callbacks (through
/// [`TransportEvents`]) and timer firings. Transitions happen synchronously under an
/// internal lock; events are dispatched after the lock is released, so listeners may
/// call back into the manager.
///
/// Every transport and timer is tagged with the epoch current when it was created.
/// Abandoning a transport, or calling [`ConnectionManager::disconnect`], advances the
/// epoch, which turns any late callback from the old generation into a no-op.
///
/// # Example
///
/// ```ignore
/// let connection = ConnectionManager::new(endpoint, config, connector, scheduler);
/// connection.add_listener(EventInterest::MESSAGE, Arc::new(|event| println!("{event:?}")));
/// connection.connect();
/// connection.send_json(&json!({ "type": "hello" }))?;
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Endpoint,
    config: Config,
    connector: Arc<dyn Connector>,
    scheduler: Arc<dyn Scheduler>,
    core: Mutex<Core>,
    queue: OutboundQueue,
    /// Orders routing in `send` against replay in `on_open`. Taken before `core`.
    outbound: Mutex<()>,
    listeners: Subscribers,
    /// Watch channel sender for state changes
    state_tx: watch::Sender<ConnectionState>,
}

struct Core {
    state: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
    attempts: u32,
    backoff: BackoffPolicy,
    epoch: u64,
    reconnect_timer: Option<TimerHandle>,
    timeout_timer: Option<TimerHandle>,
}

impl ConnectionManager {
    /// Create a manager for `endpoint`. No connection is attempted until [`Self::connect`].
    #[must_use]
    pub fn new(
        endpoint: Endpoint,
        config: Config,
        connector: Arc<dyn Connector>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let core = Core {
            state: ConnectionState::Idle,
            transport: None,
            attempts: 0,
            backoff: BackoffPolicy::new(&config.reconnect),
            epoch: 0,
            reconnect_timer: None,
            timeout_timer: None,
        };

        Self {
            inner: Arc::new(Inner {
                endpoint,
                queue: OutboundQueue::new(config.queue.clone()),
                config,
                connector,
                scheduler,
                core: Mutex::new(core),
                outbound: Mutex::new(()),
                listeners: Subscribers::new(),
                state_tx,
            }),
        }
    }

    /// Create a manager whose timers run on the current tokio runtime.
    pub fn with_tokio(
        endpoint: Endpoint,
        config: Config,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let scheduler = Arc::new(TokioScheduler::current()?);
        Ok(Self::new(endpoint, config, connector, scheduler))
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Start connecting unless already connecting or connected.
    ///
    /// An explicit call begins a fresh retry cycle, so it also revives a manager that gave
    /// up after exhausting its reconnection attempts. Failures are reported as events and
    /// state transitions, never returned.
    pub fn connect(&self) {
        self.inner.start(Origin::Caller);
    }

    /// Close the connection and stop all automatic reconnection.
    ///
    /// Cancels pending reconnect and connection-timeout timers synchronously; callbacks of
    /// timers that already fired are ignored. Buffered messages are kept.
    pub fn disconnect(&self) {
        self.inner.shutdown();
    }

    /// [`Self::disconnect`] without dispatching: the caller delivers the events later,
    /// after releasing any lock a listener might need.
    pub(crate) fn halt(&self) -> Halted {
        Halted {
            inner: Arc::clone(&self.inner),
            events: self.inner.halt(),
        }
    }

    /// Send a message, buffering it while disconnected.
    pub fn send(&self, message: Message) -> Result<SendOutcome> {
        self.inner.send(message)
    }

    /// Serialize `value` as JSON and send it.
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<SendOutcome> {
        self.send(Message::json(value)?)
    }

    /// True iff the transport reports an open channel.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let transport = self.inner.lock().transport.clone();
        transport.is_some_and(|t| t.ready_state() == ReadyState::Open)
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Reconnection attempts made in the current cycle.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    /// Copy of the messages waiting for a connection.
    #[must_use]
    pub fn queued_messages(&self) -> Vec<Message> {
        self.inner.queue.queued_messages()
    }

    pub fn clear_queue(&self) {
        self.inner.queue.clear();
    }

    /// Register a listener for the events selected by `interest`.
    pub fn add_listener(&self, interest: EventInterest, listener: Listener) -> ListenerId {
        self.inner.listeners.add(interest, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    // Core holds no cross-field invariant that a panicking listener could break mid-update:
    // listeners never run under this lock.
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outbound(&self) -> MutexGuard<'_, ()> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, core: &mut Core, state: ConnectionState) {
        core.state = state;
        self.state_tx.send_replace(state);
    }

    fn emit_all(&self, events: Vec<ConnectionEvent>) {
        for event in &events {
            self.listeners.emit(event);
        }
    }

    fn start(self: &Arc<Self>, origin: Origin) {
        let epoch = {
            let mut core = self.lock();
            if core.state.is_active() {
                return;
            }
            if origin == Origin::Caller && !core.state.is_reconnecting() {
                core.attempts = 0;
            }

            core.epoch = core.epoch.wrapping_add(1);
            core.reconnect_timer = None;
            core.timeout_timer = Some(self.schedule_timeout(core.epoch));
            self.transition(&mut core, ConnectionState::Connecting);
            core.epoch
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, ?origin, "Connecting");
        self.listeners.emit(&ConnectionEvent::Connecting);

        let transport = match self.connector.create(&self.endpoint) {
            Ok(transport) => transport,
            Err(e) => {
                self.lose(epoch, Loss::Failed(TransportError::Connection(e.to_string())));
                return;
            }
        };

        {
            let mut core = self.lock();
            if core.epoch != epoch {
                // Superseded before the transport was even opened.
                return;
            }
            core.transport = Some(Arc::clone(&transport));
        }

        let events = TransportEvents {
            inner: Arc::downgrade(self),
            epoch,
        };
        if let Err(e) = transport.open(events) {
            self.lose(epoch, Loss::Failed(TransportError::Connection(e.to_string())));
        }
    }

    fn schedule_timeout(self: &Arc<Self>, epoch: u64) -> TimerHandle {
        let weak = Arc::downgrade(self);
        let after = self.config.connection_timeout;
        self.scheduler.schedule(
            after,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timeout(epoch, after);
                }
            }),
        )
    }

    fn schedule_reconnect(self: &Arc<Self>, epoch: u64, delay: Duration) -> TimerHandle {
        let weak = Arc::downgrade(self);
        self.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_retry(epoch);
                }
            }),
        )
    }

    fn on_retry(self: &Arc<Self>, epoch: u64) {
        {
            let core = self.lock();
            if core.epoch != epoch || !core.state.is_reconnecting() {
                return;
            }
        }
        self.start(Origin::Retry);
    }

    fn on_timeout(self: &Arc<Self>, epoch: u64, after: Duration) {
        {
            let core = self.lock();
            if core.epoch != epoch || core.state != ConnectionState::Connecting {
                return;
            }
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(endpoint = %self.endpoint, ?after, "Connection attempt timed out");
        self.lose(epoch, Loss::Failed(TransportError::Timeout(after)));
    }

    fn on_open(self: &Arc<Self>, epoch: u64) {
        // Held until the queue is drained, so a concurrent `send` neither overtakes older
        // queued messages nor queues behind a replay that already finished.
        let outbound = self.lock_outbound();
        let transport = {
            let mut core = self.lock();
            if core.epoch != epoch {
                return;
            }
            core.timeout_timer = None;
            core.attempts = 0;
            core.backoff.reset();
            self.transition(
                &mut core,
                ConnectionState::Connected {
                    since: Instant::now(),
                },
            );
            core.transport.clone()
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, "Connected");

        if self.config.queue.replay_on_connect
            && let Some(transport) = transport
        {
            match self.queue.replay_to(transport.as_ref()) {
                Ok(_sent) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(endpoint = %self.endpoint, sent = _sent, "Replayed queued messages");
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(endpoint = %self.endpoint, error = %_e, remaining = self.queue.len(), "Replay interrupted");
                }
            }
        }
        drop(outbound);

        self.listeners.emit(&ConnectionEvent::Connected);
    }

    fn on_message(&self, epoch: u64, frame: &str) {
        if self.lock().epoch != epoch {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(endpoint = %self.endpoint, %frame, "Received frame");
        self.listeners
            .emit(&ConnectionEvent::Message(Message::from_frame(frame)));
    }

    /// Abandon the transport of `epoch` and decide whether to retry.
    fn lose(self: &Arc<Self>, epoch: u64, loss: Loss) {
        let mut events = Vec::with_capacity(2);
        let abandoned = {
            let mut core = self.lock();
            if core.epoch != epoch {
                return;
            }
            core.epoch = core.epoch.wrapping_add(1);
            core.timeout_timer = None;
            let abandoned = core.transport.take();

            match loss {
                Loss::Failed(error) => {
                    self.transition(&mut core, ConnectionState::Error);
                    events.push(ConnectionEvent::Error(error));
                }
                Loss::Closed { code, reason } => {
                    self.transition(&mut core, ConnectionState::Disconnected);
                    events.push(ConnectionEvent::Disconnected { code, reason });
                }
            }

            if self.config.auto_reconnect {
                events.push(self.plan_retry(&mut core));
            }
            abandoned
        };

        if let Some(transport) = abandoned
            && transport.ready_state().is_live()
        {
            transport.close(NORMAL_CLOSURE, "Abandoned");
        }
        self.emit_all(events);
    }

    fn plan_retry(self: &Arc<Self>, core: &mut Core) -> ConnectionEvent {
        let retry = self
            .config
            .reconnect
            .max_attempts
            .is_none_or(|max| core.backoff.should_retry(core.attempts, max));

        if !retry {
            self.transition(core, ConnectionState::Disconnected);
            #[cfg(feature = "tracing")]
            tracing::warn!(
                endpoint = %self.endpoint,
                error = %TransportError::MaxRetriesExceeded { attempts: core.attempts },
                "Giving up"
            );
            return ConnectionEvent::MaxReconnectAttemptsReached {
                attempts: core.attempts,
            };
        }

        core.attempts = core.attempts.saturating_add(1);
        let attempt = core.attempts;
        let delay = core.backoff.next_delay(attempt - 1);
        core.reconnect_timer = Some(self.schedule_reconnect(core.epoch, delay));
        self.transition(core, ConnectionState::Reconnecting { attempt });

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.endpoint, attempt, ?delay, "Scheduling reconnect");
        ConnectionEvent::Reconnecting { attempt, delay }
    }

    fn shutdown(&self) {
        let events = self.halt();
        self.emit_all(events);
    }

    /// Stop the connection and return the events to dispatch once the caller is ready.
    fn halt(&self) -> Vec<ConnectionEvent> {
        let (transport, was_up) = {
            let mut core = self.lock();
            core.epoch = core.epoch.wrapping_add(1);
            core.reconnect_timer = None;
            core.timeout_timer = None;
            let was_up = !matches!(
                core.state,
                ConnectionState::Idle | ConnectionState::Disconnected
            );
            self.transition(&mut core, ConnectionState::Disconnected);
            (core.transport.take(), was_up)
        };

        if let Some(transport) = transport
            && transport.ready_state().is_live()
        {
            transport.close(NORMAL_CLOSURE, CLIENT_DISCONNECT_REASON);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, "Disconnected by client");

        let mut events = Vec::with_capacity(2);
        if was_up {
            events.push(ConnectionEvent::Disconnected {
                code: Some(NORMAL_CLOSURE),
                reason: CLIENT_DISCONNECT_REASON.to_owned(),
            });
        }
        events.push(ConnectionEvent::Cleanup);
        events
    }

    fn send(&self, message: Message) -> Result<SendOutcome> {
        let outcome = {
            let _outbound = self.lock_outbound();
            let transport = {
                let core = self.lock();
                if core.state.is_connected() {
                    core.transport.clone()
                } else {
                    None
                }
            };
            self.queue.send(message, transport.as_deref())?
        };

        if let SendOutcome::Queued { evicted } = outcome
            && evicted > 0
        {
            self.listeners
                .emit(&ConnectionEvent::QueueOverflow { dropped: evicted });
        }
        Ok(outcome)
    }
}

/// Events of a stopped manager that are still to be dispatched.
#[must_use = "the disconnect events are lost unless notified"]
pub(crate) struct Halted {
    inner: Arc<Inner>,
    events: Vec<ConnectionEvent>,
}

impl Halted {
    pub(crate) fn notify(self) {
        self.inner.emit_all(self.events);
    }
}

/// Callback slots a [`Transport`] uses to report what happens to it.
///
/// Each instance is bound to one connection attempt. Once the manager moves on (a newer
/// attempt, a timeout, or an explicit disconnect), calls through an old instance are ignored.
#[derive(Clone)]
pub struct TransportEvents {
    inner: Weak<Inner>,
    epoch: u64,
}

impl TransportEvents {
    /// The channel opened.
    pub fn on_open(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_open(self.epoch);
        }
    }

    /// A text frame arrived.
    pub fn on_message(&self, frame: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_message(self.epoch, frame);
        }
    }

    /// The channel closed.
    pub fn on_close(&self, code: Option<u16>, reason: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lose(
                self.epoch,
                Loss::Closed {
                    code,
                    reason: reason.to_owned(),
                },
            );
        }
    }

    /// The channel failed, before or after opening.
    pub fn on_error(&self, error: TransportError) {
        if let Some(inner) = self.inner.upgrade() {
            #[cfg(feature = "tracing")]
            tracing::warn!(endpoint = %inner.endpoint, %error, "Transport error");
            inner.lose(self.epoch, Loss::Failed(error));
        }
    }

    /// Whether the manager still listens to this attempt.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.lock().epoch == self.epoch)
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}
