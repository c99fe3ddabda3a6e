use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundCapability {
    pub granted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_reason: Option<String>,
}

impl BackgroundCapability {
    pub fn granted() -> Self {
        Self {
            granted: true,
            denied_reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            denied_reason: Some(reason.into()),
        }
    }
}

/// Snapshot served on the status socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub connected: bool,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    pub registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_key: Option<String>,
    pub messages_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background: Option<BackgroundCapability>,
}

impl DeviceStatus {
    pub fn error(message: &str) -> serde_json::Value {
        serde_json::json!({"error": message})
    }
}
