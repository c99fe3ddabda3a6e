use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Title shown when a message carries none.
pub const DEFAULT_TITLE: &str = "Accnotify";

/// A delivered notification as kept in local history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub title: Option<String>,
    pub body: Option<String>,
    #[sqlx(rename = "group_name")]
    pub group: Option<String>,
    pub icon: Option<String>,
    pub url: Option<String>,
    pub sound: Option<String>,
    pub badge: i64,
    pub encrypted_content: Option<String>,
    pub decrypted_content: Option<String>,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub is_read: bool,
}

impl Message {
    pub fn new(message_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            message_id: message_id.into(),
            title: None,
            body: None,
            group: None,
            icon: None,
            url: None,
            sound: None,
            badge: 0,
            encrypted_content: None,
            decrypted_content: None,
            timestamp,
            is_read: false,
        }
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(DEFAULT_TITLE)
    }

    pub fn display_body(&self) -> &str {
        self.body.as_deref().unwrap_or_default()
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }
}
