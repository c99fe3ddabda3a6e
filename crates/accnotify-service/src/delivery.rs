//! Delivery pipeline: decrypt, persist, notify, then acknowledge.
//!
//! A single worker drains the inbound queue so messages are handled in
//! receipt order. The ack is only sent once the message is durably stored;
//! a crash before that point means the server redelivers.

use accnotify_core::crypto;
use accnotify_core::keys::KeyProvider;
use accnotify_core::message::{Message, DEFAULT_TITLE};
use accnotify_core::store::{MessageStore, UpsertOutcome};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{AckSender, InboundMessage};
use crate::service_state::SharedStatus;

const MAX_CONCURRENT_WEBHOOKS: usize = 16;

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn persist(&self, message: &Message) -> Result<UpsertOutcome>;
}

#[async_trait]
impl MessageSink for MessageStore {
    async fn persist(&self, message: &Message) -> Result<UpsertOutcome> {
        Ok(self.upsert(message).await?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub message_id: String,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Notification {
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.message_id.clone(),
            title: message.display_title().to_string(),
            body: message.display_body().to_string(),
            group: message.group.clone(),
            url: message.url.clone(),
        }
    }
}

/// Renders a notification to the user. Must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Writes notifications to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: &Notification) {
        info!(
            message_id = %n.message_id,
            title = %n.title,
            group = n.group.as_deref().unwrap_or(""),
            url = n.url.as_deref().unwrap_or(""),
            "notification"
        );
    }
}

/// POSTs each notification as JSON (fire-and-forget).
#[derive(Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
    semaphore: Arc<Semaphore>,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let parsed = url.parse::<reqwest::Url>()?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            anyhow::bail!("webhook url must be http(s) with a host: {url}");
        }
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()?,
            url: url.to_string(),
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_WEBHOOKS)),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: &Notification) {
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            warn!("webhook concurrency limit reached, dropping notification");
            return;
        };
        let http = self.http.clone();
        let url = self.url.clone();
        let body = notification.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match http.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(status = %resp.status(), "webhook delivered")
                }
                Ok(resp) => warn!(status = %resp.status(), "webhook returned non-success"),
                Err(err) => warn!(error = %err, "webhook POST failed"),
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Stored, notified and acknowledged.
    Delivered,
    /// Already stored: refreshed and acknowledged without a second notification.
    Redelivered,
    /// Undecryptable with nothing to fall back to: acknowledged, not stored.
    Suppressed,
    /// Not stored, so not acknowledged; the server will redeliver.
    PersistFailed,
}

pub struct DeliveryPipeline {
    keys: Arc<dyn KeyProvider>,
    sink: Arc<dyn MessageSink>,
    notifiers: Vec<Arc<dyn Notifier>>,
    acks: AckSender,
    status: Option<SharedStatus>,
}

impl DeliveryPipeline {
    pub fn new(keys: Arc<dyn KeyProvider>, sink: Arc<dyn MessageSink>, acks: AckSender) -> Self {
        Self {
            keys,
            sink,
            notifiers: Vec::new(),
            acks,
            status: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn with_status(mut self, status: SharedStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Build the stored record. `None` means the message has to be suppressed.
    pub fn resolve(&self, inbound: &InboundMessage) -> Option<Message> {
        let data = &inbound.data;
        let mut message = Message::new(inbound.id.clone(), Utc::now().timestamp_millis());
        message.title = data.title.clone();
        message.body = data.body.clone();
        message.group = data.group.clone();
        message.icon = data.icon.clone();
        message.url = data.url.clone();
        message.sound = data.sound.clone();
        message.badge = data.badge.unwrap_or(0);
        message.encrypted_content = data.encrypted_content.clone();

        let Some(sealed) = data.encrypted_content.as_deref() else {
            return Some(message);
        };

        match self.decrypt(&inbound.id, sealed) {
            Some(plaintext) => {
                apply_decrypted(&mut message, &plaintext);
                message.decrypted_content = Some(plaintext);
                Some(message)
            }
            None if message.title.is_some() || message.body.is_some() => {
                debug!(message_id = %inbound.id, "falling back to cleartext fields");
                Some(message)
            }
            None => None,
        }
    }

    fn decrypt(&self, message_id: &str, sealed: &str) -> Option<String> {
        let Some(key) = self.keys.private_key() else {
            warn!(message_id, "encrypted message received but no private key is available");
            return None;
        };
        match crypto::decrypt(sealed, &key) {
            Ok(plaintext) => Some(plaintext),
            Err(err) if err.is_foreign_key() => {
                warn!(
                    message_id,
                    "payload sealed for a different key; re-register after a key reset"
                );
                None
            }
            Err(err) => {
                warn!(message_id, cause = err.kind().as_str(), "encrypted content undecryptable");
                None
            }
        }
    }

    pub async fn deliver(&self, inbound: InboundMessage) -> DeliveryOutcome {
        let Some(message) = self.resolve(&inbound) else {
            warn!(message_id = %inbound.id, "suppressing undecryptable message");
            self.acks.ack(inbound.transport, &inbound.id);
            return DeliveryOutcome::Suppressed;
        };

        let outcome = match self.sink.persist(&message).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(message_id = %inbound.id, error = %err, "persist failed, withholding ack");
                return DeliveryOutcome::PersistFailed;
            }
        };

        let result = match outcome {
            UpsertOutcome::Inserted => {
                let notification = Notification::from_message(&message);
                for notifier in &self.notifiers {
                    notifier.notify(&notification);
                }
                if let Some(status) = &self.status {
                    status.record_message();
                }
                DeliveryOutcome::Delivered
            }
            UpsertOutcome::Replaced => {
                debug!(message_id = %inbound.id, "redelivered message, not notifying again");
                DeliveryOutcome::Redelivered
            }
        };
        self.acks.ack(inbound.transport, &inbound.id);
        result
    }
}

/// Decrypted content overrides cleartext title/body. Non-JSON content is
/// taken as the body when none was sent in the clear.
fn apply_decrypted(message: &mut Message, plaintext: &str) {
    match serde_json::from_str::<Value>(plaintext) {
        Ok(Value::Object(fields)) => {
            let text = |name: &str| {
                fields
                    .get(name)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            if let Some(title) = text("title") {
                message.title = Some(title);
            }
            if let Some(body) = text("body") {
                message.body = Some(body);
            }
        }
        _ => {
            if message.body.is_none() {
                message.body = Some(plaintext.to_string());
            }
        }
    }
}

/// Drain `inbound` in order until cancelled.
pub fn spawn_delivery_worker(
    pipeline: DeliveryPipeline,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = inbound.recv() => next,
            };
            let Some(message) = next else { break };
            let id = message.id.clone();
            let outcome = pipeline.deliver(message).await;
            debug!(message_id = %id, ?outcome, "delivery finished");
        }
        debug!("delivery worker stopped");
    })
}
