//! Network reactivity.
//!
//! Desktop hosts have no portable "default network changed" callback, so the
//! monitor polls server reachability and turns edges into connection
//! manager notifications. A live connection is never torn down from here;
//! transport ping/pong decides whether it is dead.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::ConnectionHandle;

/// Consecutive failed probes before the network counts as lost.
pub const LOST_AFTER_FAILURES: u32 = 3;

#[async_trait]
pub trait Reachability: Send + Sync {
    async fn reachable(&self) -> bool;
}

/// TCP reachability of the push server's host and port.
#[derive(Debug, Clone)]
pub struct ReachabilityProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl ReachabilityProbe {
    pub fn from_server_url(server_url: &str, timeout: Duration) -> Result<Self> {
        let url =
            Url::parse(server_url).map_err(|e| anyhow!("invalid server url {server_url}: {e}"))?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("server url has no host: {server_url}"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("server url has no port: {server_url}"))?;
        Ok(Self {
            host,
            port,
            timeout,
        })
    }
}

#[async_trait]
impl Reachability for ReachabilityProbe {
    async fn reachable(&self) -> bool {
        matches!(
            timeout(self.timeout, TcpStream::connect((self.host.as_str(), self.port))).await,
            Ok(Ok(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkChange {
    Available,
    Lost,
}

/// Edge detector over successive reachability observations. Loss is only
/// reported after `lost_after` failures in a row.
#[derive(Debug)]
pub struct NetworkMonitor {
    last: Option<bool>,
    failures: u32,
    lost_after: u32,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(LOST_AFTER_FAILURES)
    }
}

impl NetworkMonitor {
    pub fn new(lost_after: u32) -> Self {
        Self {
            last: None,
            failures: 0,
            lost_after: lost_after.max(1),
        }
    }

    pub fn observe(&mut self, reachable: bool) -> Option<NetworkChange> {
        if reachable {
            self.failures = 0;
            // Starting up reachable is the normal case; the service connects
            // on its own.
            return match self.last.replace(true) {
                Some(false) => Some(NetworkChange::Available),
                _ => None,
            };
        }
        self.failures = self.failures.saturating_add(1);
        if self.failures < self.lost_after || self.last == Some(false) {
            return None;
        }
        self.last = Some(false);
        Some(NetworkChange::Lost)
    }
}

pub fn spawn_network_monitor(
    probe: Arc<dyn Reachability>,
    period: Duration,
    handle: ConnectionHandle,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = NetworkMonitor::default();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let reachable = tokio::select! {
                _ = cancel.cancelled() => return,
                r = probe.reachable() => r,
            };
            match monitor.observe(reachable) {
                Some(NetworkChange::Available) => {
                    info!("network available");
                    handle.network_available();
                }
                Some(NetworkChange::Lost) if handle.is_connected() => {
                    debug!("server unreachable but connection is up; leaving it to ping");
                }
                Some(NetworkChange::Lost) => {
                    info!("network lost");
                    handle.network_lost();
                }
                None => debug!(reachable, "network unchanged"),
            }
        }
    })
}
