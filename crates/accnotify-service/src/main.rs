use accnotify_core::crypto;
use accnotify_core::keys::{KeyManager, KeyProvider};
use accnotify_core::paths::{
    data_dir, database_path, instance_lock_path, secrets_path, settings_path, status_socket_path,
};
use accnotify_core::secure_storage::{FileSecretStore, KeyringStore, SecretStore};
use accnotify_core::settings::{ClientSettings, SecretBackend};
use accnotify_core::storage::{load_or_init_settings, save_settings};
use accnotify_core::store::MessageStore;
use anyhow::{anyhow, Result};
use chrono::SecondsFormat;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use accnotify_service::capability::{default_probes, probe_background_capability};
use accnotify_service::connection::{
    spawn_connection_manager, ConnectionConfig, WebSocketConnector,
};
use accnotify_service::delivery::{
    spawn_delivery_worker, DeliveryPipeline, LogNotifier, WebhookNotifier,
};
use accnotify_service::keepalive::{
    restart_service, schedule_restart, systemd_units, InProcessStarter, KeepAliveCoordinator,
    NoopWakeLock, ProcessStarter, ServiceStarter, StartOutcome, TriggerGate,
};
use accnotify_service::network::{spawn_network_monitor, ReachabilityProbe};
use accnotify_service::registration::{default_device_name, RegistrationClient};
use accnotify_service::retention::{prune, spawn_retention_loop};
use accnotify_service::service_state::SharedStatus;
use accnotify_service::status::{
    self, ControlRequest, InstanceLock, ServiceControl, StatusServerError,
};

/// How long `register` and `reset-key` wait for a running service to exit.
const STOP_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about = "Accnotify push notification client", long_about = None)]
struct Cli {
    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create settings and device keys
    Init,
    /// Register this device with the push server
    Register {
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Run the background service
    Run,
    /// Query the running service
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Start the service if it is not running
    Watchdog {
        #[arg(long)]
        delay: Option<u64>,
    },
    /// Issue a new device key (and key pair with --all)
    ResetKey {
        #[arg(long)]
        all: bool,
    },
    /// Allow the service to be started and restarted
    Enable,
    /// Stop restarting the service
    Disable,
    /// Coarse heartbeat trigger
    Heartbeat {
        #[arg(value_enum)]
        mode: Toggle,
    },
    #[command(subcommand)]
    Server(ServerCommand),
    #[command(subcommand)]
    Messages(MessagesCommand),
    /// Round-trip a sealed message through the local key pair
    Selftest,
    /// Print systemd user units for the periodic check
    Units,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
enum ServerCommand {
    List,
    Add { url: String },
    Remove { url: String },
    Use { url: String },
}

#[derive(Subcommand, Debug)]
enum MessagesCommand {
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    Read { id: String },
    ReadAll,
    Delete { id: String },
    Clear,
    Prune {
        #[arg(long)]
        days: Option<u32>,
    },
}

struct Context {
    data_dir: PathBuf,
    settings: ClientSettings,
}

impl Context {
    fn load(data_dir_override: Option<PathBuf>) -> Result<Self> {
        let data = match data_dir_override {
            Some(dir) => dir,
            None => data_dir()?,
        };
        std::fs::create_dir_all(&data)?;
        let mut settings = load_or_init_settings(&settings_path(&data))?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(Self {
            data_dir: data,
            settings,
        })
    }

    fn save(&self) -> Result<()> {
        save_settings(&settings_path(&self.data_dir), &self.settings)
    }

    fn keys(&self) -> KeyManager {
        let store: Arc<dyn SecretStore> = match self.settings.secret_backend {
            SecretBackend::Keyring => {
                Arc::new(KeyringStore::new(self.data_dir.display().to_string()))
            }
            SecretBackend::File => Arc::new(FileSecretStore::new(secrets_path(&self.data_dir))),
        };
        KeyManager::new(store)
    }

    async fn store(&self) -> Result<MessageStore> {
        Ok(MessageStore::open(&database_path(&self.data_dir)).await?)
    }

    fn device_key(&self, keys: &KeyManager) -> Result<String> {
        keys.device_key()
            .ok_or_else(|| anyhow!("device key missing; run init first"))
    }

    fn socket(&self) -> PathBuf {
        status_socket_path(&self.data_dir)
    }

    fn starter(&self) -> Result<ProcessStarter> {
        Ok(ProcessStarter::new(
            std::env::current_exe()?,
            self.data_dir.clone(),
            self.socket(),
        ))
    }

    /// Replace a running service that still holds an outdated binding, or
    /// start one if none is running.
    async fn restart_service(&self) {
        let result = match self.starter() {
            Ok(starter) => {
                restart_service(
                    &self.socket(),
                    &instance_lock_path(&self.data_dir),
                    &starter,
                    STOP_WAIT,
                )
                .await
            }
            Err(err) => Err(err),
        };
        match result {
            Ok(StartOutcome::Started) => println!("Service restarted"),
            Ok(StartOutcome::AlreadyRunning) => {}
            Err(err) => warn!(error = %err, "could not restart service"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut ctx = Context::load(cli.data_dir)?;
    match cli.command {
        Commands::Init => init_command(&ctx),
        Commands::Register { server, name } => register_command(&mut ctx, server, name).await,
        Commands::Run => run_command(ctx).await,
        Commands::Status { json } => status_command(&ctx, json).await,
        Commands::Watchdog { delay } => watchdog_command(&ctx, delay).await,
        Commands::ResetKey { all } => reset_key_command(&mut ctx, all).await,
        Commands::Enable => set_enabled(&mut ctx, true).await,
        Commands::Disable => set_enabled(&mut ctx, false).await,
        Commands::Heartbeat { mode } => {
            ctx.settings.heartbeat_enabled = matches!(mode, Toggle::On);
            ctx.save()?;
            println!(
                "Heartbeat {} (takes effect on next service start)",
                if ctx.settings.heartbeat_enabled { "on" } else { "off" }
            );
            Ok(())
        }
        Commands::Server(cmd) => server_command(&mut ctx, cmd),
        Commands::Messages(cmd) => messages_command(&ctx, cmd).await,
        Commands::Selftest => selftest_command(&ctx),
        Commands::Units => {
            let exe = std::env::current_exe()?;
            let (service, timer) = systemd_units(
                &exe,
                &ctx.data_dir,
                Duration::from_secs(ctx.settings.keep_alive.job_interval_secs),
            );
            println!("# accnotify-watchdog.service\n{service}");
            println!("# accnotify-watchdog.timer\n{timer}");
            Ok(())
        }
    }
}

fn init_command(ctx: &Context) -> Result<()> {
    let keys = ctx.keys();
    let created = keys.ensure_keys_exist()?;
    let device_key = ctx.device_key(&keys)?;
    println!(
        "{} in {}",
        if created { "Keys created" } else { "Keys already present" },
        ctx.data_dir.display()
    );
    println!("Device key: {device_key}");
    println!("Push URL: {}", ctx.settings.push_url(&device_key));
    Ok(())
}

async fn register_command(
    ctx: &mut Context,
    server: Option<String>,
    name: Option<String>,
) -> Result<()> {
    if let Some(url) = server {
        ctx.settings.use_server(&url)?;
    }
    let keys = ctx.keys();
    keys.ensure_keys_exist()?;
    let device_key = ctx.device_key(&keys)?;
    let public_key = keys
        .public_key_pem()
        .ok_or_else(|| anyhow!("public key missing; run init first"))?;
    let name = name
        .or_else(|| ctx.settings.device_name.clone())
        .or_else(default_device_name);

    let client = RegistrationClient::new(&ctx.settings.server_url)?;
    let confirmed = client
        .register(&device_key, &public_key, name.as_deref())
        .await
        .map_err(|err| anyhow!("registration with {} failed: {err}", ctx.settings.server_url))?;
    if confirmed != device_key {
        keys.set_device_key(&confirmed)?;
    }
    ctx.settings.registered = true;
    ctx.save()?;
    println!("Registered with {}", ctx.settings.server_url);
    println!("Push URL: {}", ctx.settings.push_url(&confirmed));

    if !ctx.settings.service_enabled {
        return Ok(());
    }
    let current = match status::query_status(&ctx.socket()).await {
        Ok(running) => {
            running.registered && running.device_key.as_deref() == Some(confirmed.as_str())
        }
        Err(_) => false,
    };
    if !current {
        ctx.restart_service().await;
    }
    Ok(())
}

async fn run_command(ctx: Context) -> Result<()> {
    let _instance = InstanceLock::acquire(&instance_lock_path(&ctx.data_dir))?;
    let settings = ctx.settings.clone();
    let keys = Arc::new(ctx.keys());
    keys.ensure_keys_exist()?;
    let device_key = ctx.device_key(&keys)?;
    if !settings.registered {
        warn!("device is not registered; run `register` to receive pushes");
    }

    let store = ctx.store().await?;
    if let Some(days) = settings.retention_days {
        if let Err(err) = prune(&store, days).await {
            warn!(error = %err, "startup retention failed");
        }
    }

    let shared = SharedStatus::new(
        settings.registered,
        Some(device_key.clone()),
        settings.show_status_notification,
    );
    let capability = probe_background_capability(&default_probes());
    if let Some(reason) = &capability.denied_reason {
        warn!(reason = %reason, "background execution not guaranteed");
    }
    shared.set_background(capability);

    let cancel = CancellationToken::new();
    let reconnect = &settings.reconnect;
    let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
    let connector = Arc::new(WebSocketConnector::new(
        reconnect.connect_timeout(),
        reconnect.ping_interval(),
    ));
    let (handle, manager_task) = spawn_connection_manager(
        ConnectionConfig::from_settings(&settings, &device_key),
        connector,
        deliveries_tx,
        Some(Arc::new(shared.clone())),
        cancel.child_token(),
    );

    let mut pipeline =
        DeliveryPipeline::new(keys.clone(), Arc::new(store.clone()), handle.ack_sender())
            .with_notifier(Arc::new(LogNotifier))
            .with_status(shared.clone());
    if let Some(url) = &settings.webhook_url {
        pipeline = pipeline.with_notifier(Arc::new(WebhookNotifier::new(url)?));
    }
    let delivery_task = spawn_delivery_worker(pipeline, deliveries_rx, cancel.child_token());

    let gate = TriggerGate::new(settings.service_enabled);
    let keep_alive = KeepAliveCoordinator::new(
        settings.keep_alive.clone(),
        handle.clone(),
        Arc::new(InProcessStarter::new(handle.clone())),
        Arc::new(NoopWakeLock),
        settings.heartbeat_enabled,
    )
    .with_gate(gate.clone())
    .arm(cancel.child_token());

    let probe =
        ReachabilityProbe::from_server_url(&settings.server_url, reconnect.connect_timeout())?;
    let network_task = spawn_network_monitor(
        Arc::new(probe),
        Duration::from_secs(reconnect.network_probe_secs),
        handle.clone(),
        cancel.child_token(),
    );

    let retention_task = settings.retention_days.map(|days| {
        spawn_retention_loop(
            store.clone(),
            days,
            Duration::from_secs(settings.keep_alive.job_interval_secs),
            cancel.child_token(),
        )
    });

    let stop = CancellationToken::new();
    let control = ServiceControl::new(handle.clone(), gate.clone(), stop.clone());
    let status_task = match status::spawn_status_server(ctx.socket(), shared.clone(), control) {
        Ok(task) => Some(task),
        Err(err @ StatusServerError::AlreadyRunning(_)) => {
            cancel.cancel();
            return Err(err.into());
        }
        Err(err) => {
            warn!(error = %err, "status socket disabled");
            None
        }
    };

    if gate.is_open() {
        handle.connect();
    } else {
        info!("service disabled; waiting for `enable`");
    }
    info!(server = %settings.server_url, "service started");
    let requested = tokio::select! {
        res = wait_for_shutdown() => {
            res?;
            false
        }
        _ = stop.cancelled() => true,
    };
    info!(requested, "service stopping");

    // Re-read so a `disable` issued while running is honoured.
    let enabled = load_or_init_settings(&settings_path(&ctx.data_dir))
        .map(|s| s.service_enabled)
        .unwrap_or(settings.service_enabled);
    if enabled && !requested {
        let exe = std::env::current_exe()?;
        let delay = Duration::from_secs(settings.keep_alive.restart_delay_secs);
        if let Err(err) = schedule_restart(exe, ctx.data_dir.clone(), delay) {
            warn!(error = %err, "could not schedule restart");
        }
    }

    handle.shutdown();
    cancel.cancel();
    keep_alive.abort();
    let _ = manager_task.await;
    let _ = delivery_task.await;
    let _ = network_task.await;
    if let Some(task) = retention_task {
        task.abort();
    }
    if let Some(task) = status_task {
        task.abort();
    }
    let _ = std::fs::remove_file(ctx.socket());
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};
    let mut term = unix_signal(SignalKind::terminate())?;
    tokio::select! {
        res = signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    signal::ctrl_c().await?;
    Ok(())
}

async fn status_command(ctx: &Context, json: bool) -> Result<()> {
    let snapshot = status::query_status(&ctx.socket()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    println!("State:      {}", snapshot.state);
    if let Some(text) = &snapshot.status_text {
        println!("Status:     {text}");
    }
    println!("Registered: {}", snapshot.registered);
    if let Some(key) = &snapshot.device_key {
        println!("Device key: {key}");
    }
    println!("Received:   {}", snapshot.messages_received);
    if let Some(at) = &snapshot.last_message_at {
        println!("Last msg:   {at}");
    }
    if let Some(bg) = &snapshot.background {
        match &bg.denied_reason {
            Some(reason) => println!("Background: denied ({reason})"),
            None => println!("Background: granted"),
        }
    }
    Ok(())
}

async fn watchdog_command(ctx: &Context, delay: Option<u64>) -> Result<()> {
    if let Some(secs) = delay {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
    // The user may have disabled the service during the delay.
    let settings = load_or_init_settings(&settings_path(&ctx.data_dir))?;
    if !settings.service_enabled {
        info!("service disabled; watchdog exiting");
        return Ok(());
    }
    let outcome = ctx.starter()?.ensure_started().await?;
    info!(?outcome, "watchdog check");
    Ok(())
}

async fn reset_key_command(ctx: &mut Context, all: bool) -> Result<()> {
    let keys = ctx.keys();
    if all {
        keys.regenerate_all_keys()?;
        println!(
            "Key pair and device key regenerated; earlier payloads can no longer be decrypted"
        );
    } else {
        keys.regenerate_device_key()?;
        println!("Device key regenerated");
    }
    ctx.settings.registered = false;
    ctx.save()?;
    println!("Run `register` to bind the new key");

    // A running service would keep its socket on the old key.
    if ctx.settings.service_enabled && status::query_status(&ctx.socket()).await.is_ok() {
        ctx.restart_service().await;
    }
    Ok(())
}

async fn set_enabled(ctx: &mut Context, enabled: bool) -> Result<()> {
    ctx.settings.service_enabled = enabled;
    ctx.save()?;
    println!("Service {}", if enabled { "enabled" } else { "disabled" });

    let request = if enabled {
        ControlRequest::Enable
    } else {
        ControlRequest::Disable
    };
    match status::send_control(&ctx.socket(), request).await {
        Ok(()) => println!("Running service updated"),
        Err(_) if enabled => {
            let outcome = ctx.starter()?.ensure_started().await?;
            info!(?outcome, "service start after enable");
        }
        Err(_) => {}
    }
    Ok(())
}

fn server_command(ctx: &mut Context, cmd: ServerCommand) -> Result<()> {
    match cmd {
        ServerCommand::List => {
            for server in &ctx.settings.servers {
                let marker = if *server == ctx.settings.server_url { "*" } else { " " };
                println!("{marker} {server}");
            }
            return Ok(());
        }
        ServerCommand::Add { url } => ctx.settings.add_server(&url)?,
        ServerCommand::Remove { url } => {
            if !ctx.settings.remove_server(&url) {
                return Err(anyhow!("server not in list: {url}"));
            }
        }
        ServerCommand::Use { url } => ctx.settings.use_server(&url)?,
    }
    ctx.save()?;
    println!("Active server: {}", ctx.settings.server_url);
    if !ctx.settings.registered {
        println!("Not registered with this server; run `register`");
    }
    Ok(())
}

async fn messages_command(ctx: &Context, cmd: MessagesCommand) -> Result<()> {
    let store = ctx.store().await?;
    match cmd {
        MessagesCommand::List { limit } => {
            for m in store.recent(limit).await? {
                let when = m
                    .received_at()
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_default();
                let flag = if m.is_read { " " } else { "*" };
                println!(
                    "{flag} {} {when} {}: {}",
                    m.message_id,
                    m.display_title(),
                    m.display_body()
                );
            }
            println!("{} unread", store.unread_count().await?);
        }
        MessagesCommand::Read { id } => store.mark_read(&id).await?,
        MessagesCommand::ReadAll => {
            println!("{} marked read", store.mark_all_read().await?);
        }
        MessagesCommand::Delete { id } => {
            if !store.delete(&id).await? {
                return Err(anyhow!("no message with id {id}"));
            }
        }
        MessagesCommand::Clear => {
            println!("{} deleted", store.delete_all().await?);
        }
        MessagesCommand::Prune { days } => {
            let days = days
                .or(ctx.settings.retention_days)
                .ok_or_else(|| anyhow!("no retention configured; pass --days"))?;
            println!("{} pruned", prune(&store, days).await?);
        }
    }
    Ok(())
}

fn selftest_command(ctx: &Context) -> Result<()> {
    let keys = ctx.keys();
    keys.ensure_keys_exist()?;
    let public = keys
        .public_key_pem()
        .ok_or_else(|| anyhow!("public key missing"))?;
    let private = keys
        .private_key()
        .ok_or_else(|| anyhow!("private key missing"))?;
    let sample = r#"{"title":"selftest","body":"ok"}"#;
    let sealed = crypto::encrypt_for_pem(sample, &public)?;
    let opened = crypto::decrypt(&sealed, &private)?;
    if opened != sample {
        return Err(anyhow!("selftest round trip mismatch"));
    }
    println!("Selftest passed: {} byte payload sealed and opened", sealed.len());
    Ok(())
}
