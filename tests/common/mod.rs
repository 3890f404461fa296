#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use resocket::Result;
use resocket::ws::{
    Config, ConnectionEvent, ConnectionManager, Connector, Endpoint, Listener, ReadyState,
    ReconnectConfig, Transport, TransportError, TransportEvents,
};

pub const ENDPOINT: &str = "wss://stream.test/socket";

/// How freshly created transports react to `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Stay connecting until the test drives them.
    Manual,
    /// Open immediately.
    Accept,
    /// Fail immediately with a connection error.
    Refuse,
}

/// Connector handing out [`MockTransport`]s and remembering every one it created.
pub struct MockConnector {
    behaviour: Mutex<Behaviour>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockConnector {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour: Mutex::new(behaviour),
            transports: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    /// Number of transports created so far, i.e. connection attempts.
    pub fn created(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    pub fn transport(&self, index: usize) -> Arc<MockTransport> {
        Arc::clone(&self.transports.lock().unwrap()[index])
    }

    pub fn last(&self) -> Arc<MockTransport> {
        Arc::clone(self.transports.lock().unwrap().last().unwrap())
    }
}

impl Connector for MockConnector {
    fn create(&self, _endpoint: &Endpoint) -> Result<Arc<dyn Transport>> {
        let transport = Arc::new(MockTransport::new(*self.behaviour.lock().unwrap()));
        self.transports.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// In-memory transport recording frames and close calls.
pub struct MockTransport {
    behaviour: Behaviour,
    state: AtomicU8,
    events: Mutex<Option<TransportEvents>>,
    sent: Mutex<Vec<String>>,
    closed_with: Mutex<Option<(u16, String)>>,
}

impl MockTransport {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            state: AtomicU8::new(ReadyState::Connecting as u8),
            events: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closed_with: Mutex::new(None),
        }
    }

    fn events(&self) -> TransportEvents {
        self.events.lock().unwrap().clone().unwrap()
    }

    fn set_state(&self, state: ReadyState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Frames written while open.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Close code and reason if the manager closed this transport.
    pub fn closed_with(&self) -> Option<(u16, String)> {
        self.closed_with.lock().unwrap().clone()
    }

    /// Complete the handshake.
    pub fn accept(&self) {
        self.set_state(ReadyState::Open);
        self.events().on_open();
    }

    /// Deliver an inbound text frame.
    pub fn receive(&self, frame: &str) {
        self.events().on_message(frame);
    }

    /// Simulate the remote side closing the connection.
    pub fn drop_connection(&self, code: u16, reason: &str) {
        self.set_state(ReadyState::Closed);
        self.events().on_close(Some(code), reason);
    }

    /// Simulate a network failure.
    pub fn fail(&self, reason: &str) {
        self.set_state(ReadyState::Closed);
        self.events()
            .on_error(TransportError::Connection(reason.to_owned()));
    }

    pub fn is_current(&self) -> bool {
        self.events().is_current()
    }
}

impl Transport for MockTransport {
    fn open(&self, events: TransportEvents) -> Result<()> {
        *self.events.lock().unwrap() = Some(events);
        match self.behaviour {
            Behaviour::Manual => {}
            Behaviour::Accept => self.accept(),
            Behaviour::Refuse => self.fail("connection refused"),
        }
        Ok(())
    }

    fn send(&self, frame: &str) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::ConnectionClosed.into());
        }
        self.sent.lock().unwrap().push(frame.to_owned());
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        self.set_state(ReadyState::Closed);
        *self.closed_with.lock().unwrap() = Some((code, reason.to_owned()));
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Collects every event a listener sees.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<ConnectionEvent>>>);

impl EventLog {
    pub fn listener(&self) -> Listener {
        let events = Arc::clone(&self.0);
        Arc::new(move |event: &ConnectionEvent| events.lock().unwrap().push(event.clone()))
    }

    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.0.lock().unwrap().clone()
    }

    pub fn count<P: Fn(&ConnectionEvent) -> bool>(&self, predicate: P) -> usize {
        self.0.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Reconnect settings without jitter so delays are exact.
pub fn exact_backoff(max_attempts: Option<u32>, initial_delay: Duration) -> ReconnectConfig {
    let mut reconnect = ReconnectConfig::default();
    reconnect.max_attempts = max_attempts;
    reconnect.initial_delay = initial_delay;
    reconnect.jitter = false;
    reconnect
}

/// Manager for [`ENDPOINT`] on the test's runtime.
pub fn manager(connector: &Arc<MockConnector>, config: Config) -> ConnectionManager {
    let connector: Arc<dyn Connector> = Arc::clone(connector) as Arc<dyn Connector>;
    ConnectionManager::with_tokio(Endpoint::new(ENDPOINT), config, connector).unwrap()
}
