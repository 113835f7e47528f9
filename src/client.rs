//! WebSocket Client Module
//!
//! Drives the `ConnectionManager` from a single event loop. The loop is the
//! only place that mutates the manager: timers live in a map keyed by
//! `TimerKind`, and the connection task that owns the socket reports back
//! through a channel instead of calling into the manager directly.

use std::collections::HashMap;
use std::time::Instant;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request,
        http::HeaderValue,
        Error as WsError,
        Message,
    },
    Connector,
};

use crate::config::Config;
use crate::manager::{Action, ConnectionManager, ConnectionState, Event, TimerKind};
use crate::protocol;
use crate::stats::StatsAggregator;

/// Client error types
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("Histogram error: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),

    #[error("Invalid subprotocol header: {0}")]
    Subprotocol(String),
}

/// What the connection task reports to the loop, in transport order
#[derive(Debug)]
enum TransportEvent {
    ConnectFailed(String),
    Established,
    Message(Vec<u8>),
    Closed(Option<String>),
}

impl TransportEvent {
    fn into_event(self, at: Instant) -> Event {
        match self {
            TransportEvent::ConnectFailed(reason) => Event::ConnectFailed(reason),
            TransportEvent::Established => Event::Established { at },
            TransportEvent::Message(payload) => Event::Message { payload, at },
            TransportEvent::Closed(reason) => Event::Closed { reason },
        }
    }
}

/// Manager state as published after every dispatched event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub attempt_count: u32,
}

/// The socket side of one connection attempt
struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Reconnecting feed client
pub struct FeedClient {
    config: Config,
    manager: ConnectionManager,
    connector: Option<native_tls::TlsConnector>,
    timers: HashMap<TimerKind, tokio::time::Instant>,
    connection: Option<Connection>,
    events_tx: mpsc::UnboundedSender<(TransportEvent, Instant)>,
    events_rx: Option<mpsc::UnboundedReceiver<(TransportEvent, Instant)>>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl FeedClient {
    /// Build the client and its transport context.
    ///
    /// Fails when the TLS connector, the subscribe frame or the statistics
    /// histogram cannot be created.
    pub fn new(config: Config) -> Result<Self, ClientError> {
        let connector = if config.use_ssl {
            Some(native_tls::TlsConnector::builder().build()?)
        } else {
            None
        };

        let subscribe_frame = protocol::subscribe_message(&config.subscription())?;
        let manager = ConnectionManager::new(
            config.retry_policy(),
            subscribe_frame,
            config.summary_interval(),
            StatsAggregator::new()?,
        );

        // Validate the handshake request once so connect attempts cannot fail on it
        build_request(&config)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionStatus {
            state: manager.state(),
            attempt_count: manager.attempt_count(),
        });

        Ok(Self {
            config,
            manager,
            connector,
            timers: HashMap::new(),
            connection: None,
            events_tx,
            events_rx: Some(events_rx),
            status_tx,
        })
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Follow state and attempt changes while `run` is being awaited.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Run the event loop until `shutdown` turns true (or its sender is dropped).
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let Some(mut events_rx) = self.events_rx.take() else {
            log::error!("Feed client event loop already ran");
            return;
        };

        log::info!("Connecting to {}", self.config.websocket_url());
        self.dispatch(Event::Start);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next_deadline = self.timers.values().min().copied();
            let sleep = async move {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some((event, at)) = events_rx.recv() => {
                    self.dispatch(event.into_event(at));
                }
                _ = sleep => {
                    self.fire_due_timers();
                }
            }
        }

        self.shutdown();
    }

    fn fire_due_timers(&mut self) {
        let now = tokio::time::Instant::now();
        let mut due: Vec<(TimerKind, tokio::time::Instant)> = self
            .timers
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(kind, deadline)| (*kind, *deadline))
            .collect();
        due.sort_by_key(|(_, deadline)| *deadline);

        for (kind, _) in due {
            self.timers.remove(&kind);
            self.dispatch(Event::TimerFired(kind));
        }
    }

    fn dispatch(&mut self, event: Event) {
        for action in self.manager.handle_event(event) {
            self.perform(action);
        }

        let status = ConnectionStatus {
            state: self.manager.state(),
            attempt_count: self.manager.attempt_count(),
        };
        self.status_tx.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::Connect => self.connect(),
            Action::Send(text) => self.send(text),
            Action::Schedule { timer, delay } => {
                self.timers.insert(timer, tokio::time::Instant::now() + delay);
            }
            Action::Report(summary) => {
                summary.log();
                if self.config.json_summary {
                    match serde_json::to_string(&summary) {
                        Ok(line) => println!("{}", line),
                        Err(e) => log::warn!("Failed to serialize summary: {}", e),
                    }
                }
            }
        }
    }

    fn connect(&mut self) {
        if let Some(previous) = self.connection.take() {
            previous.task.abort();
        }

        let request = match build_request(&self.config) {
            Ok(request) => request,
            Err(e) => {
                let _ = self
                    .events_tx
                    .send((TransportEvent::ConnectFailed(e.to_string()), Instant::now()));
                return;
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connector = self.connector.clone().map(Connector::NativeTls);
        let timeout = self.config.connect_timeout();
        let events = self.events_tx.clone();

        let task = tokio::spawn(async move {
            run_connection(request, connector, timeout, events, outbound_rx).await;
        });

        self.connection = Some(Connection {
            outbound: outbound_tx,
            task,
        });
    }

    fn send(&mut self, text: String) {
        log::debug!("Sending: {}", text);
        let sent = self
            .connection
            .as_ref()
            .map(|connection| connection.outbound.send(text).is_ok())
            .unwrap_or(false);
        if !sent {
            log::warn!("No open connection to send on");
        }
    }

    /// Tear down the connection and all timers together
    fn shutdown(&mut self) {
        log::info!("Shutting down feed client");
        if let Some(connection) = self.connection.take() {
            connection.task.abort();
        }
        self.timers.clear();
    }
}

/// Build the WebSocket handshake request, adding the subprotocol header if configured
fn build_request(config: &Config) -> Result<Request, ClientError> {
    let mut request = config.websocket_url().into_client_request()?;
    if let Some(subprotocol) = &config.subprotocol {
        let value = HeaderValue::from_str(subprotocol)
            .map_err(|e| ClientError::Subprotocol(e.to_string()))?;
        request.headers_mut().insert("Sec-WebSocket-Protocol", value);
    }
    Ok(request)
}

/// Own one socket from handshake to close, reporting each step to the loop
async fn run_connection(
    request: Request,
    connector: Option<Connector>,
    timeout: std::time::Duration,
    events: mpsc::UnboundedSender<(TransportEvent, Instant)>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let report = |event: TransportEvent| {
        let _ = events.send((event, Instant::now()));
    };

    let connect = connect_async_tls_with_config(request, None, false, connector);
    let ws_stream = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok((ws_stream, _))) => ws_stream,
        Ok(Err(e)) => {
            report(TransportEvent::ConnectFailed(e.to_string()));
            return;
        }
        Err(_) => {
            report(TransportEvent::ConnectFailed(format!(
                "connect timed out after {:?}",
                timeout
            )));
            return;
        }
    };
    report(TransportEvent::Established);

    let (write, read) = ws_stream.split();
    pump_frames(write, read, &mut outbound, &events).await;
}

/// Move frames between the socket halves and the loop until either side closes.
///
/// Always ends by reporting exactly one `Closed`.
async fn pump_frames<W, R>(
    mut write: W,
    mut read: R,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<(TransportEvent, Instant)>,
) where
    W: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let report = |event: TransportEvent| {
        let _ = events.send((event, Instant::now()));
    };

    loop {
        tokio::select! {
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            log::error!("Failed to send subscription message: {}", e);
                            report(TransportEvent::Closed(Some(format!("write failed: {}", e))));
                            return;
                        }
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        report(TransportEvent::Closed(None));
                        return;
                    }
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        report(TransportEvent::Message(text.into_bytes()));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        report(TransportEvent::Message(data));
                    }
                    // WebSocket keepalive - respond with Pong
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            report(TransportEvent::Closed(Some(e.to_string())));
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        report(TransportEvent::Closed(frame.map(|f| format!("{} {}", u16::from(f.code), f.reason))));
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        report(TransportEvent::Closed(Some(e.to_string())));
                        return;
                    }
                    None => {
                        report(TransportEvent::Closed(None));
                        return;
                    }
                }
            }
        }
    }
}
