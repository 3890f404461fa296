//! WebSocket [`Transport`] on top of tokio-tungstenite.
//!
//! **Feature flag:** `tungstenite`
//!
//! Each transport owns one background task that performs the handshake, pumps frames in
//! both directions and, when enabled, monitors liveness with PING/PONG frames.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::connection::TransportEvents;
use super::error::TransportError;
use super::traits::{Connector, Endpoint, ReadyState, Transport};
use crate::Result;
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(15);

/// PING/PONG liveness monitoring for open connections.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval for sending PING frames to keep the connection alive
    pub interval: Duration,
    /// Maximum time to wait for a PONG before considering the connection dead
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
        }
    }
}

/// Creates [`Transport`]s that speak WebSocket over TCP or TLS.
#[derive(Debug, Clone)]
pub struct WsConnector {
    runtime: Handle,
    heartbeat: Option<HeartbeatConfig>,
}

impl WsConnector {
    /// Connector spawning its socket tasks on the current tokio runtime, with default heartbeat.
    pub fn new() -> Result<Self> {
        Ok(Self::with_handle(Handle::try_current()?))
    }

    #[must_use]
    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            runtime,
            heartbeat: Some(HeartbeatConfig::default()),
        }
    }

    /// Replace the heartbeat settings; `None` disables PING/PONG monitoring.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: Option<HeartbeatConfig>) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

impl Connector for WsConnector {
    fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>> {
        let url = endpoint.url()?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported WebSocket scheme `{}` in {endpoint}",
                url.scheme()
            )));
        }

        Ok(Arc::new(WsTransport {
            url,
            runtime: self.runtime.clone(),
            heartbeat: self.heartbeat.clone(),
            ready: Arc::new(AtomicU8::new(ReadyState::Closed as u8)),
            outbound: Mutex::new(None),
            cancel: CancellationToken::new(),
        }))
    }
}

enum Command {
    Frame(String),
    Close { code: u16, reason: String },
}

enum Heartbeat {
    Ping,
    Expired(Duration),
}

/// How a live connection ended.
enum Ended {
    Remote { code: Option<u16>, reason: String },
    Failed(TransportError),
    Local,
}

struct WsTransport {
    url: Url,
    runtime: Handle,
    heartbeat: Option<HeartbeatConfig>,
    ready: Arc<AtomicU8>,
    /// Sender channel for outgoing frames, present once opened
    outbound: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    /// Aborts a handshake that has not completed yet
    cancel: CancellationToken,
}

impl WsTransport {
    fn set_ready(&self, state: ReadyState) {
        self.ready.store(state as u8, Ordering::SeqCst);
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<Command>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Transport for WsTransport {
    fn open(&self, events: TransportEvents) -> Result<()> {
        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        {
            let mut outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
            if outbound.is_some() {
                return Err(Error::validation("transport was already opened"));
            }
            *outbound = Some(sender_tx);
        }
        self.set_ready(ReadyState::Connecting);

        self.runtime.spawn(connection_task(
            self.url.clone(),
            sender_rx,
            events,
            Arc::clone(&self.ready),
            self.cancel.clone(),
            self.heartbeat.clone(),
        ));
        Ok(())
    }

    fn send(&self, frame: &str) -> Result<()> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::ConnectionClosed.into());
        }
        self.outbound()
            .ok_or(TransportError::ConnectionClosed)?
            .send(Command::Frame(frame.to_owned()))
            .map_err(|_e| TransportError::ConnectionClosed)?;
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        let previous = ReadyState::from_u8(
            self.ready
                .swap(ReadyState::Closing as u8, Ordering::SeqCst),
        );

        match previous {
            ReadyState::Open => {
                let command = Command::Close {
                    code,
                    reason: reason.to_owned(),
                };
                if self.outbound().is_none_or(|tx| tx.send(command).is_err()) {
                    self.set_ready(ReadyState::Closed);
                }
            }
            ReadyState::Connecting => {
                self.cancel.cancel();
                self.set_ready(ReadyState::Closed);
            }
            ReadyState::Closing | ReadyState::Closed => self.set_ready(previous),
        }
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.ready.load(Ordering::SeqCst))
    }
}

/// Handshake, then pump frames until either side ends the connection.
async fn connection_task(
    url: Url,
    mut sender_rx: mpsc::UnboundedReceiver<Command>,
    events: TransportEvents,
    ready: Arc<AtomicU8>,
    cancel: CancellationToken,
    heartbeat: Option<HeartbeatConfig>,
) {
    let connected = tokio::select! {
        () = cancel.cancelled() => return,
        result = connect_async(url.as_str()) => result,
    };

    let ws_stream = match connected {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            ready.store(ReadyState::Closed as u8, Ordering::SeqCst);
            events.on_error(e.into());
            return;
        }
    };

    // close() may have won the race against the handshake.
    if ready
        .compare_exchange(
            ReadyState::Connecting as u8,
            ReadyState::Open as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_err()
    {
        let mut ws_stream = ws_stream;
        _ = ws_stream.close(None).await;
        ready.store(ReadyState::Closed as u8, Ordering::SeqCst);
        return;
    }

    events.on_open();
    let ended = handle_connection(ws_stream, &mut sender_rx, &events, heartbeat).await;
    ready.store(ReadyState::Closed as u8, Ordering::SeqCst);

    match ended {
        Ended::Remote { code, reason } => events.on_close(code, &reason),
        Ended::Failed(error) => events.on_error(error),
        Ended::Local => {}
    }
}

/// Handle an open WebSocket connection.
async fn handle_connection(
    ws_stream: WsStream,
    sender_rx: &mut mpsc::UnboundedReceiver<Command>,
    events: &TransportEvents,
    heartbeat: Option<HeartbeatConfig>,
) -> Ended {
    let (mut write, mut read) = ws_stream.split();

    // Channel to notify heartbeat loop when PONG is received
    let (pong_tx, pong_rx) = watch::channel(Instant::now());
    let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();

    let heartbeat_handle = heartbeat
        .map(|config| tokio::spawn(heartbeat_loop(ping_tx, config, pong_rx)));

    let ended = loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Frame::Text(text))) => events.on_message(text.as_str()),
                    Some(Ok(Frame::Pong(_))) => {
                        _ = pong_tx.send(Instant::now());
                    }
                    Some(Ok(Frame::Close(frame))) => {
                        let (code, reason) = frame.map_or((None, String::new()), |f| {
                            (Some(u16::from(f.code)), f.reason.as_str().to_owned())
                        });
                        break Ended::Remote { code, reason };
                    }
                    Some(Ok(_)) => {
                        // Binary frames are outside the text protocol; PINGs are answered by tungstenite.
                    }
                    Some(Err(e)) => break Ended::Failed(e.into()),
                    None => {
                        break Ended::Remote {
                            code: None,
                            reason: String::new(),
                        };
                    }
                }
            }

            command = sender_rx.recv() => {
                match command {
                    Some(Command::Frame(text)) => {
                        if let Err(e) = write.send(Frame::Text(text.into())).await {
                            break Ended::Failed(e.into());
                        }
                    }
                    Some(Command::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        _ = write.send(Frame::Close(Some(frame))).await;
                        break Ended::Local;
                    }
                    None => {
                        // The owning transport is gone.
                        _ = write.close().await;
                        break Ended::Local;
                    }
                }
            }

            Some(signal) = ping_rx.recv() => {
                match signal {
                    Heartbeat::Ping => {
                        if let Err(e) = write.send(Frame::Ping(Default::default())).await {
                            break Ended::Failed(e.into());
                        }
                    }
                    Heartbeat::Expired(after) => {
                        _ = write.close().await;
                        break Ended::Failed(TransportError::Timeout(after));
                    }
                }
            }
        }
    };

    if let Some(handle) = heartbeat_handle {
        handle.abort();
    }
    ended
}

/// Heartbeat loop that requests PING frames and monitors PONG responses.
async fn heartbeat_loop(
    ping_tx: mpsc::UnboundedSender<Heartbeat>,
    config: HeartbeatConfig,
    mut pong_rx: watch::Receiver<Instant>,
) {
    let mut ping_interval = interval(config.interval);
    // The first tick completes immediately; the first PING goes out one interval after opening.
    ping_interval.tick().await;

    loop {
        ping_interval.tick().await;

        // Mark current PONG state as seen before sending PING
        // This prevents changed() from returning immediately due to a stale PONG
        drop(pong_rx.borrow_and_update());

        let ping_sent = Instant::now();
        if ping_tx.send(Heartbeat::Ping).is_err() {
            // Message loop has terminated
            break;
        }

        match timeout(config.timeout, pong_rx.changed()).await {
            Ok(Ok(())) => {
                let last_pong = *pong_rx.borrow_and_update();
                if last_pong < ping_sent {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("PONG received but older than last PING, connection may be stale");
                    _ = ping_tx.send(Heartbeat::Expired(config.timeout));
                    break;
                }
            }
            Ok(Err(_)) => {
                // Channel closed, connection is terminating
                break;
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Heartbeat timeout: no PONG received within {:?}",
                    config.timeout
                );
                _ = ping_tx.send(Heartbeat::Expired(config.timeout));
                break;
            }
        }
    }
}
