//! Local control socket.
//!
//! A client writes one JSON request, shuts down its write half and reads one
//! JSON reply. An empty request is a status query.

use crate::connection::ConnectionHandle;
use crate::keepalive::TriggerGate;
use crate::service_state::SharedStatus;
use accnotify_core::device_state::DeviceStatus;
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(unix)]
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};

#[cfg(unix)]
const MAX_REQUEST_BYTES: u64 = 1024;
#[cfg(unix)]
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    Status,
    /// Reopen the keep-alive triggers and connect.
    Enable,
    /// User-initiated disconnect. Triggers stay armed but parked.
    Disable,
    /// Exit without scheduling a restart.
    Stop,
}

#[derive(Debug, Error)]
pub enum StatusServerError {
    #[error("another service instance is already running ({0})")]
    AlreadyRunning(PathBuf),

    #[error("status socket io: {0}")]
    Io(#[from] std::io::Error),

    #[error("status socket is only available on unix")]
    Unsupported,
}

/// Exclusive lock held for the lifetime of the service process. Released
/// when dropped or when the process exits.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, StatusServerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        fs2::FileExt::try_lock_exclusive(&file).map_err(|err| {
            if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                StatusServerError::AlreadyRunning(path.to_path_buf())
            } else {
                StatusServerError::Io(err)
            }
        })?;
        Ok(Self { _file: file })
    }

    /// True while another holder has the lock at `path`.
    pub fn is_held(path: &Path) -> bool {
        matches!(
            Self::acquire(path),
            Err(StatusServerError::AlreadyRunning(_))
        )
    }
}

/// The running service as seen by control requests.
#[derive(Clone)]
pub struct ServiceControl {
    connection: ConnectionHandle,
    gate: TriggerGate,
    stop: CancellationToken,
}

impl ServiceControl {
    pub fn new(connection: ConnectionHandle, gate: TriggerGate, stop: CancellationToken) -> Self {
        Self {
            connection,
            gate,
            stop,
        }
    }

    pub fn apply(&self, request: ControlRequest) {
        match request {
            ControlRequest::Status => {}
            ControlRequest::Enable => {
                info!("service enabled");
                self.gate.set(true);
                self.connection.connect();
            }
            ControlRequest::Disable => {
                info!("service disabled");
                self.gate.set(false);
                self.connection.disconnect();
            }
            ControlRequest::Stop => {
                info!("stop requested");
                self.stop.cancel();
            }
        }
    }
}

/// Bind the control socket. A stale socket file is replaced; one that a live
/// service still answers on is left alone.
#[cfg(unix)]
pub fn spawn_status_server(
    socket_path: PathBuf,
    status: SharedStatus,
    control: ServiceControl,
) -> Result<JoinHandle<()>, StatusServerError> {
    if socket_path.exists() {
        if std::os::unix::net::UnixStream::connect(&socket_path).is_ok() {
            return Err(StatusServerError::AlreadyRunning(socket_path));
        }
        let _ = std::fs::remove_file(&socket_path);
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    use std::os::unix::fs::PermissionsExt;
    let listener = UnixListener::bind(&socket_path)?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;

    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => serve(stream, &status, &control).await,
                Err(err) => {
                    tracing::error!(error = %err, "status ipc accept error");
                    break;
                }
            }
        }
    });

    Ok(task)
}

#[cfg(not(unix))]
pub fn spawn_status_server(
    _: PathBuf,
    _: SharedStatus,
    _: ServiceControl,
) -> Result<JoinHandle<()>, StatusServerError> {
    Err(StatusServerError::Unsupported)
}

#[cfg(unix)]
async fn serve(mut stream: UnixStream, status: &SharedStatus, control: &ServiceControl) {
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(err) => {
            reply(&mut stream, &DeviceStatus::error(&err.to_string())).await;
            return;
        }
    };
    debug!(?request, "control request");
    match request {
        ControlRequest::Status => {
            let snapshot = serde_json::to_value(status.snapshot()).unwrap_or_else(|err| {
                DeviceStatus::error(&format!("invalid state: {err}"))
            });
            reply(&mut stream, &snapshot).await;
        }
        other => {
            // Reply first: a stop tears the service down.
            reply(&mut stream, &serde_json::json!({"ok": true})).await;
            control.apply(other);
        }
    }
}

#[cfg(unix)]
async fn read_request(stream: &mut UnixStream) -> Result<ControlRequest> {
    let mut buf = Vec::new();
    let mut limited = (&mut *stream).take(MAX_REQUEST_BYTES);
    let read = limited.read_to_end(&mut buf);
    tokio::time::timeout(REQUEST_TIMEOUT, read)
        .await
        .map_err(|_| anyhow!("request timed out"))??;
    if buf.iter().all(u8::is_ascii_whitespace) {
        return Ok(ControlRequest::Status);
    }
    serde_json::from_slice(&buf).map_err(|err| anyhow!("invalid request: {err}"))
}

#[cfg(unix)]
async fn reply(stream: &mut UnixStream, value: &serde_json::Value) {
    if let Ok(bytes) = serde_json::to_vec(value) {
        let _ = stream.write_all(&bytes).await;
    }
    let _ = stream.shutdown().await;
}

#[cfg(unix)]
async fn request(socket_path: &Path, request: ControlRequest) -> Result<serde_json::Value> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| anyhow!("service not reachable at {}: {e}", socket_path.display()))?;
    stream.write_all(&serde_json::to_vec(&request)?).await?;
    stream.shutdown().await?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let value: serde_json::Value = serde_json::from_slice(&buf)?;
    if let Some(err) = value.get("error").and_then(|e| e.as_str()) {
        return Err(anyhow!("service reported error: {err}"));
    }
    Ok(value)
}

#[cfg(not(unix))]
async fn request(_: &Path, _: ControlRequest) -> Result<serde_json::Value> {
    Err(anyhow!("control socket is only available on unix"))
}

pub async fn query_status(socket_path: &Path) -> Result<DeviceStatus> {
    let value = request(socket_path, ControlRequest::Status).await?;
    Ok(serde_json::from_value(value)?)
}

pub async fn send_control(socket_path: &Path, control: ControlRequest) -> Result<()> {
    request(socket_path, control).await.map(|_| ())
}

/// Ask the running service to exit and wait for its instance lock to be
/// released. Returns false when no service answered.
pub async fn stop_service(socket_path: &Path, lock_path: &Path, wait: Duration) -> Result<bool> {
    if send_control(socket_path, ControlRequest::Stop).await.is_err() {
        return Ok(false);
    }
    let deadline = Instant::now() + wait;
    while InstanceLock::is_held(lock_path) {
        if Instant::now() >= deadline {
            bail!("service did not stop within {}s", wait.as_secs());
        }
        sleep(Duration::from_millis(50)).await;
    }
    Ok(true)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::connection::mock::{MockConnector, MockTransport};
    use crate::connection::{
        spawn_connection_manager, BackoffPolicy, ConnectionConfig, ConnectionState, StatusSurface,
    };
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn control() -> (
        ServiceControl,
        ConnectionHandle,
        mpsc::UnboundedReceiver<MockTransport>,
    ) {
        let (connector, opened) = MockConnector::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (handle, _task) = spawn_connection_manager(
            ConnectionConfig {
                url: "ws://push.test/ws?key=dk".into(),
                backoff: BackoffPolicy::default(),
                network_settle: Duration::from_secs(1),
            },
            Arc::new(connector),
            tx,
            None,
            CancellationToken::new(),
        );
        let control = ServiceControl::new(
            handle.clone(),
            TriggerGate::default(),
            CancellationToken::new(),
        );
        (control, handle, opened)
    }

    fn status() -> SharedStatus {
        SharedStatus::new(true, Some("dk".into()), false)
    }

    #[tokio::test]
    async fn serves_snapshot_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.sock");
        let status = status();
        status.show(&ConnectionState::Connected);
        let (control, _, _) = control();
        let task = spawn_status_server(path.clone(), status, control).unwrap();

        let snap = query_status(&path).await.unwrap();
        assert!(snap.connected);
        assert_eq!(snap.state, "connected");
        assert_eq!(snap.device_key.as_deref(), Some("dk"));
        task.abort();
    }

    #[tokio::test]
    async fn missing_socket_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(query_status(&dir.path().join("none.sock")).await.is_err());
    }

    #[tokio::test]
    async fn live_socket_is_not_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.sock");
        let (first_control, _, _) = control();
        let first = spawn_status_server(path.clone(), status(), first_control).unwrap();

        let (second_control, _, _) = control();
        let second = spawn_status_server(
            path.clone(),
            SharedStatus::new(false, Some("other".into()), false),
            second_control,
        );
        assert!(matches!(second, Err(StatusServerError::AlreadyRunning(_))));
        let snap = query_status(&path).await.unwrap();
        assert_eq!(snap.device_key.as_deref(), Some("dk"));
        first.abort();
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let (control, _, _) = control();
        let task = spawn_status_server(path.clone(), status(), control).unwrap();
        assert!(query_status(&path).await.is_ok());
        task.abort();
    }

    #[test]
    fn instance_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.lock");
        assert!(!InstanceLock::is_held(&path));

        let held = InstanceLock::acquire(&path).unwrap();
        assert!(matches!(
            InstanceLock::acquire(&path),
            Err(StatusServerError::AlreadyRunning(_))
        ));
        assert!(InstanceLock::is_held(&path));

        drop(held);
        assert!(!InstanceLock::is_held(&path));
    }

    #[tokio::test]
    async fn disable_disconnects_and_enable_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.sock");
        let (control, handle, mut opened) = control();
        let gate = control.gate.clone();
        let task = spawn_status_server(path.clone(), status(), control).unwrap();

        handle.connect();
        let transport = opened.recv().await.unwrap();
        transport.open().await;
        handle
            .watch_state()
            .wait_for(ConnectionState::is_connected)
            .await
            .unwrap();

        send_control(&path, ControlRequest::Disable).await.unwrap();
        handle
            .watch_state()
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert!(transport.is_closed());
        assert!(!gate.is_open());

        send_control(&path, ControlRequest::Enable).await.unwrap();
        let fresh = opened.recv().await.unwrap();
        assert_ne!(fresh.id, transport.id);
        assert!(gate.is_open());
        task.abort();
    }

    #[tokio::test]
    async fn stop_is_answered_before_the_token_fires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.sock");
        let (control, _, _) = control();
        let stop = control.stop.clone();
        let task = spawn_status_server(path.clone(), status(), control).unwrap();

        send_control(&path, ControlRequest::Stop).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), stop.cancelled())
            .await
            .unwrap();
        task.abort();
    }

    #[tokio::test]
    async fn garbage_request_gets_an_error_reply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.sock");
        let (control, _, _) = control();
        let task = spawn_status_server(path.clone(), status(), control).unwrap();

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"{\"nope\":1}").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert!(value.get("error").is_some());
        task.abort();
    }
}
