use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "https://an.trah.cn";
/// Shortest interval an OS scheduler will honour for a periodic job.
pub const MIN_JOB_INTERVAL_SECS: u64 = 15 * 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretBackend {
    #[default]
    Keyring,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
    pub connect_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub network_settle_ms: u64,
    pub network_probe_secs: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter_ratio: 0.2,
            connect_timeout_secs: 10,
            ping_interval_secs: 30,
            network_settle_ms: 1_000,
            network_probe_secs: 15,
        }
    }
}

impl ReconnectSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn network_settle(&self) -> Duration {
        Duration::from_millis(self.network_settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveSettings {
    pub alarm_interval_secs: u64,
    pub job_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub start_throttle_secs: u64,
    pub restart_delay_secs: u64,
    pub wake_lock_secs: u64,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        Self {
            alarm_interval_secs: 3 * 60,
            job_interval_secs: MIN_JOB_INTERVAL_SECS,
            heartbeat_interval_secs: 5 * 60,
            start_throttle_secs: 60,
            restart_delay_secs: 5,
            wake_lock_secs: 2 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub servers: Vec<String>,
    pub registered: bool,
    pub service_enabled: bool,
    pub show_status_notification: bool,
    pub heartbeat_enabled: bool,
    pub secret_backend: SecretBackend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    pub reconnect: ReconnectSettings,
    pub keep_alive: KeepAliveSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.into(),
            servers: vec![DEFAULT_SERVER_URL.into()],
            registered: false,
            service_enabled: true,
            show_status_notification: true,
            heartbeat_enabled: false,
            secret_backend: SecretBackend::Keyring,
            retention_days: None,
            webhook_url: None,
            device_name: None,
            reconnect: ReconnectSettings::default(),
            keep_alive: KeepAliveSettings::default(),
        }
    }
}

impl ClientSettings {
    pub fn validate(&self) -> Result<()> {
        validate_server_url(&self.server_url)?;
        let r = &self.reconnect;
        if r.base_delay_ms == 0 || r.max_delay_ms == 0 {
            bail!("reconnect delays must be non-zero");
        }
        if r.base_delay_ms > r.max_delay_ms {
            bail!(
                "reconnect base delay {}ms exceeds max delay {}ms",
                r.base_delay_ms,
                r.max_delay_ms
            );
        }
        if !(0.0..1.0).contains(&r.jitter_ratio) {
            bail!("jitter ratio must be within [0, 1)");
        }
        if r.connect_timeout_secs == 0 || r.ping_interval_secs == 0 || r.network_probe_secs == 0 {
            bail!("connection timeouts and intervals must be non-zero");
        }
        let k = &self.keep_alive;
        if k.alarm_interval_secs == 0 || k.heartbeat_interval_secs == 0 || k.wake_lock_secs == 0
        {
            bail!("keep-alive intervals must be non-zero");
        }
        if k.job_interval_secs < MIN_JOB_INTERVAL_SECS {
            bail!(
                "periodic job interval must be at least {}s",
                MIN_JOB_INTERVAL_SECS
            );
        }
        if let Some(url) = &self.webhook_url {
            validate_server_url(url)?;
        }
        Ok(())
    }

    /// Make `url` the active server, remembering it in the history list.
    pub fn use_server(&mut self, url: &str) -> Result<()> {
        let url = normalize_server_url(url);
        validate_server_url(&url)?;
        if !self.servers.contains(&url) {
            self.servers.push(url.clone());
        }
        if self.server_url != url {
            self.server_url = url;
            self.registered = false;
        }
        Ok(())
    }

    pub fn add_server(&mut self, url: &str) -> Result<()> {
        let url = normalize_server_url(url);
        validate_server_url(&url)?;
        if !self.servers.contains(&url) {
            self.servers.push(url);
        }
        Ok(())
    }

    /// Removing the active server switches to the first remaining entry, or
    /// the default server when the list empties.
    pub fn remove_server(&mut self, url: &str) -> bool {
        let url = normalize_server_url(url);
        let before = self.servers.len();
        self.servers.retain(|s| *s != url);
        let removed = self.servers.len() != before;
        if removed && self.server_url == url {
            let next = self
                .servers
                .first()
                .cloned()
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
            if !self.servers.contains(&next) {
                self.servers.push(next.clone());
            }
            self.server_url = next;
            self.registered = false;
        }
        removed
    }

    pub fn websocket_url(&self, device_key: &str) -> String {
        websocket_url(&self.server_url, device_key)
    }

    pub fn push_url(&self, device_key: &str) -> String {
        format!("{}/push/{}", normalize_server_url(&self.server_url), device_key)
    }

    /// Apply `ACCNOTIFY_SERVER_URL` if set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("ACCNOTIFY_SERVER_URL") {
            if !url.trim().is_empty() {
                self.server_url = normalize_server_url(&url);
            }
        }
    }
}

pub fn normalize_server_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn validate_server_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => bail!("server url must be an http(s) url: {url}"),
    }
}

/// `http` maps to `ws`, `https` to `wss`.
pub fn websocket_url(server_url: &str, device_key: &str) -> String {
    let base = normalize_server_url(server_url);
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base
    };
    format!("{base}/ws?key={device_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ClientSettings::default().validate().unwrap();
    }

    #[test]
    fn websocket_url_derivation() {
        assert_eq!(
            websocket_url("https://an.trah.cn/", "abc"),
            "wss://an.trah.cn/ws?key=abc"
        );
        assert_eq!(
            websocket_url("http://10.0.0.2:8080", "k"),
            "ws://10.0.0.2:8080/ws?key=k"
        );
    }

    #[test]
    fn rejects_bad_configuration() {
        let mut s = ClientSettings::default();
        s.server_url = "ftp://example".into();
        assert!(s.validate().is_err());

        let mut s = ClientSettings::default();
        s.reconnect.base_delay_ms = 120_000;
        assert!(s.validate().is_err());

        let mut s = ClientSettings::default();
        s.reconnect.jitter_ratio = 1.0;
        assert!(s.validate().is_err());

        let mut s = ClientSettings::default();
        s.keep_alive.job_interval_secs = 60;
        assert!(s.validate().is_err());
    }

    #[test]
    fn server_history() {
        let mut s = ClientSettings::default();
        s.registered = true;
        s.use_server("http://localhost:8080/").unwrap();
        assert_eq!(s.server_url, "http://localhost:8080");
        assert!(!s.registered);
        assert_eq!(s.servers.len(), 2);

        assert!(s.remove_server("http://localhost:8080"));
        assert_eq!(s.server_url, DEFAULT_SERVER_URL);

        assert!(s.remove_server(DEFAULT_SERVER_URL));
        assert_eq!(s.server_url, DEFAULT_SERVER_URL);
        assert_eq!(s.servers, vec![DEFAULT_SERVER_URL.to_string()]);
        assert!(!s.remove_server("http://unknown"));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let s: ClientSettings =
            serde_json::from_str(r#"{"server_url":"http://h","reconnect":{"base_delay_ms":500}}"#)
                .unwrap();
        assert_eq!(s.server_url, "http://h");
        assert_eq!(s.reconnect.base_delay_ms, 500);
        assert_eq!(s.reconnect.max_delay_ms, 60_000);
        assert_eq!(s.keep_alive, KeepAliveSettings::default());
        assert!(s.service_enabled);
    }
}
