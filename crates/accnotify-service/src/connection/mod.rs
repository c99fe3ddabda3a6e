//! Connection manager.
//!
//! One actor task owns the connection state and the live transport. Callers
//! talk to it through [`ConnectionHandle`] commands; transports report through
//! a single tagged event channel. Every mutation happens on the actor task, so
//! transitions are serialized without locks.

use accnotify_core::envelope::{Envelope, MessageData};
use accnotify_core::settings::ClientSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod backoff;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod state;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use state::ConnectionState;
pub use transport::{
    Connector, TaggedEvent, TransportEvent, TransportHandle, TransportId, WebSocketConnector,
};

const EVENT_QUEUE: usize = 256;
const FRAME_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    NetworkAvailable,
    NetworkLost,
    KeepAlive,
    Ack { transport: TransportId, id: String },
    Shutdown,
}

/// A `message` envelope received on a specific transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub transport: TransportId,
    pub id: String,
    pub data: MessageData,
    pub timestamp: Option<i64>,
}

/// Persistent "service status" surface, updated on every transition.
pub trait StatusSurface: Send + Sync {
    fn show(&self, state: &ConnectionState);
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub backoff: BackoffPolicy,
    pub network_settle: Duration,
}

impl ConnectionConfig {
    pub fn from_settings(settings: &ClientSettings, device_key: &str) -> Self {
        let r = &settings.reconnect;
        Self {
            url: settings.websocket_url(device_key),
            backoff: BackoffPolicy::new(
                Duration::from_millis(r.base_delay_ms),
                Duration::from_millis(r.max_delay_ms),
            )
            .with_jitter(r.jitter_ratio),
            network_settle: r.network_settle(),
        }
    }
}

#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    connectivity: broadcast::Sender<bool>,
}

impl ConnectionHandle {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("connection manager is no longer running");
        }
    }

    /// No-op while connecting or connected.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close the session and suppress the pending retry.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn network_available(&self) {
        self.send(Command::NetworkAvailable);
    }

    pub fn network_lost(&self) {
        self.send(Command::NetworkLost);
    }

    /// Connect if down, otherwise send an application-level keep-alive.
    pub fn keep_alive(&self) {
        self.send(Command::KeepAlive);
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Connectivity flag, sent on every state transition.
    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<bool> {
        self.connectivity.subscribe()
    }

    pub fn ack_sender(&self) -> AckSender {
        AckSender {
            commands: self.commands.clone(),
        }
    }
}

/// The only way the delivery side can write to the socket.
#[derive(Clone)]
pub struct AckSender {
    commands: mpsc::UnboundedSender<Command>,
}

impl AckSender {
    /// Acknowledge `id` on `transport`. Dropped by the manager if that
    /// transport is no longer the current, connected one.
    pub fn ack(&self, transport: TransportId, id: &str) {
        let _ = self.commands.send(Command::Ack {
            transport,
            id: id.to_string(),
        });
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { commands: tx }, rx)
    }
}

pub fn spawn_connection_manager(
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    deliveries: mpsc::UnboundedSender<InboundMessage>,
    surface: Option<Arc<dyn StatusSurface>>,
    cancel: CancellationToken,
) -> (ConnectionHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (connectivity_tx, _) = broadcast::channel(64);

    let handle = ConnectionHandle {
        commands: commands_tx,
        state: state_rx,
        connectivity: connectivity_tx.clone(),
    };

    if let Some(surface) = &surface {
        surface.show(&ConnectionState::Disconnected);
    }

    let manager = ConnectionManager {
        config,
        connector,
        deliveries,
        surface,
        state: ConnectionState::Disconnected,
        attempt: 0,
        next_id: 0,
        current: None,
        settle_at: None,
        events_tx,
        state_tx,
        connectivity_tx,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(manager.run(commands_rx, events_rx, cancel));
    (handle, task)
}

struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    deliveries: mpsc::UnboundedSender<InboundMessage>,
    surface: Option<Arc<dyn StatusSurface>>,
    state: ConnectionState,
    attempt: u32,
    next_id: TransportId,
    current: Option<TransportHandle>,
    settle_at: Option<Instant>,
    events_tx: mpsc::Sender<TaggedEvent>,
    state_tx: watch::Sender<ConnectionState>,
    connectivity_tx: broadcast::Sender<bool>,
    cancel: CancellationToken,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ConnectionManager {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::Receiver<TaggedEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let retry_at = match &self.state {
                ConnectionState::ReconnectPending { deadline, .. } => Some(*deadline),
                _ => None,
            };
            let settle_at = self.settle_at;

            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = sleep_until_opt(retry_at) => self.retry_due(),
                _ = sleep_until_opt(settle_at) => self.network_settled(),
            }
        }

        self.retire_current();
        self.transition(ConnectionState::Disconnected);
        info!("connection manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::NetworkAvailable => self.network_available(),
            Command::NetworkLost => self.network_lost(),
            Command::KeepAlive => self.keep_alive(),
            Command::Ack { transport, id } => self.ack(transport, &id),
            Command::Shutdown => {}
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(from = self.state.label(), to = next.label(), "connection state changed");
        self.state = next.clone();
        let _ = self.connectivity_tx.send(next.is_connected());
        if let Some(surface) = &self.surface {
            surface.show(&next);
        }
        self.state_tx.send_replace(next);
    }

    fn retire_current(&mut self) {
        if let Some(old) = self.current.take() {
            debug!(transport = old.id(), "retiring transport");
            old.close();
        }
    }

    fn start_connect(&mut self) {
        self.retire_current();
        self.settle_at = None;
        self.next_id += 1;
        let id = self.next_id;
        info!(transport = id, attempt = self.attempt, "connecting");
        let handle = self.connector.open(
            &self.config.url,
            id,
            self.events_tx.clone(),
            self.cancel.child_token(),
        );
        self.current = Some(handle);
        self.transition(ConnectionState::Connecting);
    }

    fn connect(&mut self) {
        if self.state.is_active() {
            debug!(state = self.state.label(), "connect ignored");
            return;
        }
        self.start_connect();
    }

    fn disconnect(&mut self) {
        self.retire_current();
        self.attempt = 0;
        self.settle_at = None;
        self.transition(ConnectionState::Disconnected);
        info!("disconnected by request");
    }

    fn network_available(&mut self) {
        if self.state.is_active() {
            return;
        }
        debug!("network available, waiting to settle");
        self.settle_at = Some(Instant::now() + self.config.network_settle);
    }

    fn network_settled(&mut self) {
        self.settle_at = None;
        if !self.state.is_active() {
            self.start_connect();
        }
    }

    fn network_lost(&mut self) {
        self.settle_at = None;
        self.retire_current();
        self.attempt = 0;
        self.transition(ConnectionState::Disconnected);
        info!("network lost");
    }

    fn keep_alive(&mut self) {
        match self.state {
            ConnectionState::Connected => self.send_current(&Envelope::pong_now()),
            ConnectionState::Connecting => {}
            _ => self.start_connect(),
        }
    }

    fn retry_due(&mut self) {
        if matches!(self.state, ConnectionState::ReconnectPending { .. }) {
            self.start_connect();
        }
    }

    fn schedule_retry(&mut self, reason: &str) {
        self.retire_current();
        let delay = self.config.backoff.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        warn!(
            attempt = self.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            reason,
            "connection lost, retry scheduled"
        );
        self.transition(ConnectionState::ReconnectPending {
            attempt: self.attempt,
            deadline: Instant::now() + delay,
        });
    }

    fn handle_event(&mut self, tagged: TaggedEvent) {
        let current = self.current.as_ref().map(TransportHandle::id);
        if current != Some(tagged.transport) {
            debug!(
                transport = tagged.transport,
                event = ?tagged.event,
                "ignoring event from superseded transport"
            );
            return;
        }

        match tagged.event {
            TransportEvent::Opened => {
                if self.state == ConnectionState::Connecting {
                    self.attempt = 0;
                    self.transition(ConnectionState::Connected);
                    info!(transport = tagged.transport, "connected");
                }
            }
            TransportEvent::Closed { code, reason } => {
                self.schedule_retry(&format!("closed with code {code}: {reason}"));
            }
            TransportEvent::Failed(err) => self.schedule_retry(&err),
            TransportEvent::Frame(text) => self.handle_frame(tagged.transport, &text),
        }
    }

    fn handle_frame(&mut self, transport: TransportId, text: &str) {
        match Envelope::decode(text) {
            Ok(Envelope::Ping { .. }) => self.send_current(&Envelope::pong_now()),
            Ok(Envelope::Message {
                id,
                data,
                timestamp,
            }) => {
                debug!(transport, message_id = %id, "message received");
                let inbound = InboundMessage {
                    transport,
                    id,
                    data,
                    timestamp,
                };
                if self.deliveries.send(inbound).is_err() {
                    warn!("delivery pipeline stopped; message left for redelivery");
                }
            }
            Ok(other) => debug!(kind = other.kind(), "ignoring client-only frame"),
            Err(err) => {
                let preview: String = text.chars().take(FRAME_PREVIEW_CHARS).collect();
                warn!(transport, error = %err, "dropping undecodable frame");
                debug!(transport, frame = %preview, "undecodable frame");
            }
        }
    }

    fn ack(&mut self, transport: TransportId, id: &str) {
        let current = self.current.as_ref().map(TransportHandle::id);
        if !self.state.is_connected() || current != Some(transport) {
            debug!(transport, message_id = %id, "ack dropped, transport no longer current");
            return;
        }
        self.send_current(&Envelope::ack(id));
    }

    fn send_current(&self, envelope: &Envelope) {
        let Some(current) = &self.current else {
            return;
        };
        if !current.send(envelope.encode()) {
            debug!(transport = current.id(), kind = envelope.kind(), "send on closed transport");
        }
    }
}
