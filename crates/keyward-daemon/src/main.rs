//! Background daemon that watches removable volumes and runs key actions.

use anyhow::{Context, Result};
use clap::Parser;
use keyward_core::{
    config::{KeywardConfig, SharedConfig, WatchCfg, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH},
    dispatch::{Dispatcher, ProcessLauncher},
    engine::{Engine, EngineEvent},
    logging,
    volumes::MountTable,
    MarkerClassifier,
};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use tokio::{
    select, signal,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task,
    time::{interval, Duration, MissedTickBehavior},
};

mod devices;
#[cfg(target_os = "linux")]
mod linux;
mod notify;

use devices::{BlockEvent, DeviceMap};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Command-line options for the watcher service.
#[derive(Parser, Debug)]
#[command(
    name = "keyward-daemon",
    version,
    about = "Runs configured commands when security keys are plugged or unplugged."
)]
struct Args {
    /// Path to the keyward configuration file.
    #[arg(short, long, env = CONFIG_PATH_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Ignore kernel device notifications and rely on polling alone.
    #[arg(long)]
    poll_only: bool,
}

/// Entry point for the Tokio runtime; logs failures before exit.
#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

/// Load configuration, start the producers, and wait for shutdown.
async fn run() -> Result<()> {
    logging::init("info");

    let args = Args::parse();
    let config = KeywardConfig::load_or_bootstrap(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;

    if config.path != args.config {
        warn!(
            "configuration missing at {}; using bootstrap at {}",
            args.config.display(),
            config.path.display()
        );
    }
    for issue in config.validate() {
        warn!("config: {issue}");
    }

    info!(
        "keyward daemon booting (config: {}, {} key(s) registered)",
        config.path.display(),
        config.keys.len()
    );

    let watch = config.watch.clone();
    let shared = Arc::new(SharedConfig::new(config));
    let volumes = Arc::new(MountTable::from_config(&watch));

    let (event_tx, event_rx) = mpsc::channel::<EngineEvent>();
    notify::spawn_reporter(event_rx, shared.clone()).context("start event reporter")?;
    notify::announce_startup(&shared);

    let engine = Arc::new(Engine::new(
        Arc::new(MarkerClassifier::from_config(volumes.clone(), &watch)),
        Dispatcher::new(shared.clone(), Arc::new(ProcessLauncher)),
        Arc::new(event_tx),
    ));

    let (device_tx, device_rx) = unbounded_channel();
    if args.poll_only {
        info!("device notifications disabled; polling every {:?}", watch.poll_interval());
        drop(device_tx);
    } else {
        start_device_watch(device_tx)?;
    }
    tokio::spawn(forward_device_events(
        engine.clone(),
        Arc::new(DeviceMap::new(watch.mount_wait())),
        device_rx,
    ));

    let poll_handle = tokio::spawn(poll_volumes(engine.clone(), volumes, watch));
    let reload_handle = tokio::spawn(reload_on_hangup(shared.clone()));

    select! {
        res = poll_handle => res?,
        res = reload_handle => res??,
        res = shutdown_signal() => {
            res?;
            info!("received shutdown signal");
        }
    }

    info!("{} key(s) present at shutdown", engine.snapshot().len());
    Ok(())
}

#[cfg(target_os = "linux")]
fn start_device_watch(events: UnboundedSender<BlockEvent>) -> Result<()> {
    linux::spawn_monitor(events).map(|_| ())
}

#[cfg(not(target_os = "linux"))]
fn start_device_watch(events: UnboundedSender<BlockEvent>) -> Result<()> {
    drop(events);
    warn!("device notifications are only supported on Linux; relying on polling");
    Ok(())
}

/// Hand every device event to its own blocking task; the mount wait and the
/// marker read both block.
async fn forward_device_events(
    engine: Arc<Engine>,
    devices: Arc<DeviceMap>,
    mut events: UnboundedReceiver<BlockEvent>,
) {
    while let Some(event) = events.recv().await {
        let engine = engine.clone();
        let devices = devices.clone();
        task::spawn_blocking(move || {
            if let Some(signal) = devices.resolve(event) {
                engine.handle(signal);
            }
        });
    }
    info!("device notifications stopped; polling continues");
}

/// Periodic fallback producer. The first tick fires immediately, which doubles
/// as the startup scan.
async fn poll_volumes(engine: Arc<Engine>, volumes: Arc<MountTable>, watch: WatchCfg) {
    let mut ticker = interval(watch.poll_interval().max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let engine = engine.clone();
        let volumes = volumes.clone();
        if let Err(err) = task::spawn_blocking(move || engine.poll_once(volumes.as_ref())).await {
            warn!("poll pass aborted: {err}");
        }
    }
}

/// Reload keys and notification settings on SIGHUP. Watch settings need a restart.
#[cfg(unix)]
async fn reload_on_hangup(config: Arc<SharedConfig>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    while hangup.recv().await.is_some() {
        let config = config.clone();
        match task::spawn_blocking(move || config.reload()).await? {
            Ok(count) => info!("configuration reloaded ({count} key(s) registered)"),
            Err(err) => warn!("configuration reload failed; keeping previous settings: {err}"),
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn reload_on_hangup(_config: Arc<SharedConfig>) -> Result<()> {
    std::future::pending().await
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let mut terminate = unix_signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    select! {
        res = signal::ctrl_c() => res?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    signal::ctrl_c().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_arguments_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn config_flag_overrides_default_path() {
        let args = Args::try_parse_from(["keyward-daemon", "--config", "/tmp/k.toml", "--poll-only"])
            .unwrap();
        assert_eq!(args.config, PathBuf::from("/tmp/k.toml"));
        assert!(args.poll_only);
    }
}
