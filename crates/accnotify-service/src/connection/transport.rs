//! Transports feed the connection actor through one tagged event channel.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identity of one connect attempt. Increases monotonically per manager.
pub type TransportId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Closed { code: u16, reason: String },
    Failed(String),
    Frame(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub transport: TransportId,
    pub event: TransportEvent,
}

/// Owned by the connection actor; never handed out.
#[derive(Debug)]
pub struct TransportHandle {
    id: TransportId,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl TransportHandle {
    pub fn new(
        id: TransportId,
        outbound: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            outbound,
            cancel,
        }
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Queue a text frame. False once the transport has gone away.
    pub fn send(&self, text: String) -> bool {
        !self.cancel.is_cancelled() && self.outbound.send(text).is_ok()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Opens transports. Implementations spawn their own I/O task and report
/// through `events`; they must not block.
pub trait Connector: Send + Sync + 'static {
    fn open(
        &self,
        url: &str,
        id: TransportId,
        events: mpsc::Sender<TaggedEvent>,
        cancel: CancellationToken,
    ) -> TransportHandle;
}

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
    ping_interval: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration, ping_interval: Duration) -> Self {
        Self {
            connect_timeout,
            ping_interval,
        }
    }
}

impl Connector for WebSocketConnector {
    fn open(
        &self,
        url: &str,
        id: TransportId,
        events: mpsc::Sender<TaggedEvent>,
        cancel: CancellationToken,
    ) -> TransportHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = WebSocketTask {
            url: url.to_string(),
            id,
            events,
            outbound: outbound_rx,
            cancel: cancel.clone(),
            connect_timeout: self.connect_timeout,
            ping_interval: self.ping_interval,
        };
        tokio::spawn(task.run());
        TransportHandle::new(id, outbound_tx, cancel)
    }
}

struct WebSocketTask {
    url: String,
    id: TransportId,
    events: mpsc::Sender<TaggedEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    connect_timeout: Duration,
    ping_interval: Duration,
}

impl WebSocketTask {
    async fn emit(&self, event: TransportEvent) {
        let _ = self
            .events
            .send(TaggedEvent {
                transport: self.id,
                event,
            })
            .await;
    }

    async fn run(mut self) {
        let connect = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        );
        let ws = tokio::select! {
            _ = self.cancel.cancelled() => return,
            res = connect => match res {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(err)) => {
                    self.emit(TransportEvent::Failed(err.to_string())).await;
                    return;
                }
                Err(_) => {
                    self.emit(TransportEvent::Failed(format!(
                        "connect timed out after {}ms",
                        self.connect_timeout.as_millis()
                    )))
                    .await;
                    return;
                }
            }
        };
        self.emit(TransportEvent::Opened).await;

        let (mut ws_tx, mut ws_rx) = ws.split();
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + self.ping_interval,
            self.ping_interval,
        );
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    let _ = ws_tx.close().await;
                    debug!(transport = self.id, "transport closed locally");
                    return;
                }
                outbound = self.outbound.recv() => {
                    let Some(text) = outbound else { return };
                    if let Err(err) = ws_tx.send(Message::Text(text)).await {
                        self.emit(TransportEvent::Failed(err.to_string())).await;
                        return;
                    }
                }
                inbound = ws_rx.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.emit(TransportEvent::Frame(text)).await,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.emit(TransportEvent::Frame(text)).await,
                        Err(_) => debug!(transport = self.id, "dropping non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((1005, String::new()));
                        self.emit(TransportEvent::Closed { code, reason }).await;
                        return;
                    }
                    Some(Err(err)) => {
                        self.emit(TransportEvent::Failed(err.to_string())).await;
                        return;
                    }
                    None => {
                        self.emit(TransportEvent::Closed {
                            code: 1006,
                            reason: "stream ended".into(),
                        })
                        .await;
                        return;
                    }
                },
                _ = ping.tick() => {
                    if awaiting_pong {
                        warn!(transport = self.id, "ping unanswered, treating socket as dead");
                        self.emit(TransportEvent::Failed("ping timeout".into())).await;
                        return;
                    }
                    awaiting_pong = true;
                    if let Err(err) = ws_tx.send(Message::Ping(Vec::new())).await {
                        self.emit(TransportEvent::Failed(err.to_string())).await;
                        return;
                    }
                }
            }
        }
    }
}
