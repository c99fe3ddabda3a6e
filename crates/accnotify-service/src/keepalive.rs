//! Keep-alive coordination.
//!
//! Three independent triggers re-enter the connection logic: a short-period
//! alarm, a periodic check-and-start job, and an opt-in coarse heartbeat.
//! Any one of them is enough to converge on a connected client, so each
//! swallows its own failures and keeps going.

use accnotify_core::paths::{instance_lock_path, log_dir};
use accnotify_core::settings::KeepAliveSettings;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;
use crate::status::{self, InstanceLock};

/// Best-effort hold on CPU availability while a trigger runs.
pub trait WakeLock: Send + Sync {
    fn acquire(&self, timeout: Duration);
    fn release(&self);
}

/// Desktop hosts do not suspend a running process mid-check; nothing to hold.
pub struct NoopWakeLock;

impl WakeLock for NoopWakeLock {
    fn acquire(&self, timeout: Duration) {
        debug!(timeout_secs = timeout.as_secs(), "wake lock acquired");
    }

    fn release(&self) {
        debug!("wake lock released");
    }
}

/// Parks the triggers while the user has the service disabled. They stay
/// armed and resume once the gate reopens.
#[derive(Debug, Clone)]
pub struct TriggerGate(Arc<AtomicBool>);

impl TriggerGate {
    pub fn new(open: bool) -> Self {
        Self(Arc::new(AtomicBool::new(open)))
    }

    pub fn set(&self, open: bool) {
        self.0.store(open, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for TriggerGate {
    fn default() -> Self {
        Self::new(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning,
    Started,
}

/// Makes sure the connection service is resident and trying to connect.
#[async_trait]
pub trait ServiceStarter: Send + Sync {
    async fn ensure_started(&self) -> Result<StartOutcome>;
}

/// Starter for triggers running inside the service process itself.
pub struct InProcessStarter {
    handle: ConnectionHandle,
}

impl InProcessStarter {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ServiceStarter for InProcessStarter {
    async fn ensure_started(&self) -> Result<StartOutcome> {
        if self.handle.state().is_active() {
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.handle.connect();
        Ok(StartOutcome::Started)
    }
}

/// Starter for the out-of-process watchdog: probes the status socket and
/// launches `run` when nothing answers.
pub struct ProcessStarter {
    exe: PathBuf,
    data_dir: PathBuf,
    socket: PathBuf,
}

impl ProcessStarter {
    pub fn new(exe: PathBuf, data_dir: PathBuf, socket: PathBuf) -> Self {
        Self {
            exe,
            data_dir,
            socket,
        }
    }

    pub fn run_command(&self) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("--data-dir").arg(&self.data_dir).arg("run");
        cmd
    }
}

#[async_trait]
impl ServiceStarter for ProcessStarter {
    async fn ensure_started(&self) -> Result<StartOutcome> {
        // A service that holds the lock but has not bound its socket yet is
        // still starting.
        if status::query_status(&self.socket).await.is_ok()
            || InstanceLock::is_held(&instance_lock_path(&self.data_dir))
        {
            return Ok(StartOutcome::AlreadyRunning);
        }
        spawn_detached(self.run_command(), &self.data_dir)?;
        info!(exe = %self.exe.display(), "service process started");
        Ok(StartOutcome::Started)
    }
}

/// Spawn `cmd` in its own process group with stderr appended to
/// `<data_dir>/logs/service.log`.
fn spawn_detached(mut cmd: Command, data_dir: &Path) -> Result<()> {
    let logs = log_dir(data_dir);
    std::fs::create_dir_all(&logs)?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs.join("service.log"))?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd.spawn()
        .map_err(|e| anyhow!("spawn {:?}: {e}", cmd.get_program()))?;
    Ok(())
}

/// Stop the service holding the instance lock, if any, then start a fresh
/// one through `starter`.
pub async fn restart_service(
    socket: &Path,
    lock: &Path,
    starter: &dyn ServiceStarter,
    wait: Duration,
) -> Result<StartOutcome> {
    if status::stop_service(socket, lock, wait).await? {
        info!("running service stopped for restart");
    }
    starter.ensure_started().await
}

/// `watchdog --delay <secs>` for the current executable.
pub fn watchdog_command(exe: PathBuf, data_dir: PathBuf, delay: Duration) -> Command {
    let mut cmd = Command::new(exe);
    cmd.arg("--data-dir")
        .arg(data_dir)
        .arg("watchdog")
        .arg("--delay")
        .arg(delay.as_secs().to_string());
    cmd
}

/// Arm a one-shot restart that outlives this process.
pub fn schedule_restart(exe: PathBuf, data_dir: PathBuf, delay: Duration) -> Result<()> {
    spawn_detached(watchdog_command(exe, data_dir.clone(), delay), &data_dir)?;
    info!(delay_secs = delay.as_secs(), "restart scheduled");
    Ok(())
}

/// At most one start per `min_gap`.
pub struct StartThrottle {
    min_gap: Duration,
    last: Mutex<Option<Instant>>,
}

impl StartThrottle {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last: Mutex::new(None),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock();
        match *last {
            Some(prev) if now.duration_since(prev) < self.min_gap => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

pub struct KeepAliveCoordinator {
    settings: KeepAliveSettings,
    handle: ConnectionHandle,
    starter: Arc<dyn ServiceStarter>,
    wake_lock: Arc<dyn WakeLock>,
    heartbeat_enabled: bool,
    gate: TriggerGate,
}

/// Trigger tasks; cancelling the token passed to `arm` stops them all.
pub struct KeepAliveTasks {
    pub alarm: JoinHandle<()>,
    pub job: JoinHandle<()>,
    pub heartbeat: Option<JoinHandle<()>>,
}

impl KeepAliveTasks {
    pub fn abort(&self) {
        self.alarm.abort();
        self.job.abort();
        if let Some(task) = &self.heartbeat {
            task.abort();
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl KeepAliveCoordinator {
    pub fn new(
        settings: KeepAliveSettings,
        handle: ConnectionHandle,
        starter: Arc<dyn ServiceStarter>,
        wake_lock: Arc<dyn WakeLock>,
        heartbeat_enabled: bool,
    ) -> Self {
        Self {
            settings,
            handle,
            starter,
            wake_lock,
            heartbeat_enabled,
            gate: TriggerGate::default(),
        }
    }

    #[must_use]
    pub fn with_gate(mut self, gate: TriggerGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn arm(self, cancel: CancellationToken) -> KeepAliveTasks {
        let alarm = spawn_alarm(
            Duration::from_secs(self.settings.alarm_interval_secs),
            Duration::from_secs(self.settings.wake_lock_secs),
            self.handle.clone(),
            self.wake_lock.clone(),
            self.gate.clone(),
            cancel.clone(),
        );
        let job = spawn_job(
            Duration::from_secs(self.settings.job_interval_secs),
            self.starter.clone(),
            self.gate.clone(),
            cancel.clone(),
        );
        let heartbeat = self.heartbeat_enabled.then(|| {
            spawn_heartbeat(
                Duration::from_secs(self.settings.heartbeat_interval_secs),
                Arc::new(StartThrottle::new(Duration::from_secs(
                    self.settings.start_throttle_secs,
                ))),
                self.starter.clone(),
                self.gate.clone(),
                cancel.clone(),
            )
        });
        info!(
            alarm_secs = self.settings.alarm_interval_secs,
            job_secs = self.settings.job_interval_secs,
            heartbeat = self.heartbeat_enabled,
            "keep-alive triggers armed"
        );
        KeepAliveTasks {
            alarm,
            job,
            heartbeat,
        }
    }
}

fn spawn_alarm(
    period: Duration,
    wake_timeout: Duration,
    handle: ConnectionHandle,
    wake_lock: Arc<dyn WakeLock>,
    gate: TriggerGate,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !gate.is_open() {
                debug!("service disabled, alarm skipped");
                continue;
            }
            wake_lock.acquire(wake_timeout);
            debug!(state = handle.state().label(), "keep-alive alarm fired");
            handle.keep_alive();
            wake_lock.release();
        }
    })
}

fn spawn_job(
    period: Duration,
    starter: Arc<dyn ServiceStarter>,
    gate: TriggerGate,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !gate.is_open() {
                debug!("service disabled, periodic job skipped");
                continue;
            }
            match starter.ensure_started().await {
                Ok(outcome) => debug!(?outcome, "periodic job check"),
                Err(err) => warn!(error = %err, "periodic job failed to start service"),
            }
        }
    })
}

fn spawn_heartbeat(
    period: Duration,
    throttle: Arc<StartThrottle>,
    starter: Arc<dyn ServiceStarter>,
    gate: TriggerGate,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !gate.is_open() {
                continue;
            }
            if !throttle.try_acquire() {
                debug!("heartbeat start throttled");
                continue;
            }
            match starter.ensure_started().await {
                Ok(outcome) => debug!(?outcome, "heartbeat check"),
                Err(err) => warn!(error = %err, "heartbeat failed to start service"),
            }
        }
    })
}

/// systemd user units running the watchdog on the periodic-job interval;
/// `Persistent=true` catches up on checks missed while powered off.
pub fn systemd_units(exe: &Path, data_dir: &Path, job_interval: Duration) -> (String, String) {
    let service = format!(
        "[Unit]\nDescription=Accnotify push client check-and-start\n\n\
         [Service]\nType=oneshot\nExecStart={} --data-dir {} watchdog\n",
        exe.display(),
        data_dir.display()
    );
    let timer = format!(
        "[Unit]\nDescription=Periodic Accnotify check-and-start\n\n\
         [Timer]\nOnBootSec=1min\nOnUnitActiveSec={}s\nPersistent=true\n\n\
         [Install]\nWantedBy=timers.target\n",
        job_interval.as_secs()
    );
    (service, timer)
}
