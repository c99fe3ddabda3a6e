use accnotify_core::device_state::{BackgroundCapability, DeviceStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use crate::connection::{ConnectionState, StatusSurface};

#[derive(Debug, Default)]
pub(crate) struct ServiceState {
    pub(crate) connected: bool,
    pub(crate) state: &'static str,
    pub(crate) status_text: Option<&'static str>,
    pub(crate) registered: bool,
    pub(crate) device_key: Option<String>,
    pub(crate) messages_received: u64,
    pub(crate) last_message_at: Option<DateTime<Utc>>,
    pub(crate) last_transition_at: Option<DateTime<Utc>>,
    pub(crate) background: Option<BackgroundCapability>,
}

/// Status shared between the connection actor, the delivery worker and the
/// status socket.
#[derive(Clone)]
pub struct SharedStatus {
    inner: Arc<Mutex<ServiceState>>,
    show_status_text: bool,
}

impl SharedStatus {
    pub fn new(registered: bool, device_key: Option<String>, show_status_text: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ServiceState {
                state: ConnectionState::Disconnected.label(),
                registered,
                device_key,
                ..Default::default()
            })),
            show_status_text,
        }
    }

    pub fn record_message(&self) {
        let mut guard = self.inner.lock();
        guard.messages_received += 1;
        guard.last_message_at = Some(Utc::now());
    }

    pub fn set_background(&self, capability: BackgroundCapability) {
        self.inner.lock().background = Some(capability);
    }

    pub fn snapshot(&self) -> DeviceStatus {
        let guard = self.inner.lock();
        DeviceStatus {
            connected: guard.connected,
            state: guard.state.to_string(),
            status_text: guard.status_text.map(str::to_string),
            registered: guard.registered,
            device_key: guard.device_key.clone(),
            messages_received: guard.messages_received,
            last_message_at: guard
                .last_message_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            last_transition_at: guard
                .last_transition_at
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            background: guard.background.clone(),
        }
    }
}

impl StatusSurface for SharedStatus {
    fn show(&self, state: &ConnectionState) {
        let mut guard = self.inner.lock();
        guard.connected = state.is_connected();
        guard.state = state.label();
        guard.last_transition_at = Some(Utc::now());
        if self.show_status_text {
            let text = state.status_text();
            if guard.status_text != Some(text) {
                info!(status = text, "service status");
            }
            guard.status_text = Some(text);
        }
    }
}
