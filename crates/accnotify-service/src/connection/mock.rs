//! Scripted in-memory transport for exercising the connection actor.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::transport::{Connector, TaggedEvent, TransportEvent, TransportHandle, TransportId};

/// Hands every opened transport to the test through a channel.
pub struct MockConnector {
    opened: mpsc::UnboundedSender<MockTransport>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockTransport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { opened: tx }, rx)
    }
}

impl Connector for MockConnector {
    fn open(
        &self,
        url: &str,
        id: TransportId,
        events: mpsc::Sender<TaggedEvent>,
        cancel: CancellationToken,
    ) -> TransportHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let _ = self.opened.send(MockTransport {
            id,
            url: url.to_string(),
            events,
            cancel: cancel.clone(),
            sent: Arc::new(Mutex::new(outbound_rx)),
        });
        TransportHandle::new(id, outbound_tx, cancel)
    }
}

/// The remote end of one transport.
#[derive(Clone)]
pub struct MockTransport {
    pub id: TransportId,
    pub url: String,
    events: mpsc::Sender<TaggedEvent>,
    cancel: CancellationToken,
    sent: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
}

impl MockTransport {
    async fn emit(&self, event: TransportEvent) {
        let _ = self
            .events
            .send(TaggedEvent {
                transport: self.id,
                event,
            })
            .await;
    }

    pub async fn open(&self) {
        self.emit(TransportEvent::Opened).await;
    }

    pub async fn close(&self, code: u16, reason: &str) {
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
        })
        .await;
    }

    pub async fn fail(&self, error: &str) {
        self.emit(TransportEvent::Failed(error.to_string())).await;
    }

    pub async fn frame(&self, text: &str) {
        self.emit(TransportEvent::Frame(text.to_string())).await;
    }

    /// Frames the client has written so far.
    pub fn sent(&self) -> Vec<String> {
        let mut rx = self.sent.lock();
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(text);
        }
        out
    }

    /// True once the client has closed or abandoned this transport.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
