//! Long-running monitor mode
//!
//! Hosts the reconfiguration controller and maps process signals onto it:
//! - SIGHUP reloads the configuration file and restarts the scheduler
//! - SIGTERM/SIGINT (Ctrl+C elsewhere) stop after the in-flight cycle
//! - A status summary is logged at a fixed interval

use anyhow::{Context, Result};
use ipmonitor_core::config::{self, ConfigProvider, ScanConfig};
use ipmonitor_core::{
    PingProbe, ReconfigurationController, RestartOutcome, ScanContext, SegmentStatus,
    SharedConfig, StatusStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

enum SignalEvent {
    Reload,
    Shutdown(&'static str),
}

#[cfg(unix)]
struct Signals {
    hangup: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            hangup: signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?,
            terminate: signal(SignalKind::terminate())
                .context("Failed to register SIGTERM handler")?,
            interrupt: signal(SignalKind::interrupt())
                .context("Failed to register SIGINT handler")?,
        })
    }

    async fn next(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.hangup.recv() => SignalEvent::Reload,
            _ = self.terminate.recv() => SignalEvent::Shutdown("SIGTERM"),
            _ = self.interrupt.recv() => SignalEvent::Shutdown("SIGINT"),
        }
    }
}

// No reload signal outside unix; only Ctrl+C is handled
#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> Result<Self> {
        Ok(Signals)
    }

    async fn next(&mut self) -> SignalEvent {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
        SignalEvent::Shutdown("Ctrl+C")
    }
}

/// Run the scheduler until a shutdown signal arrives
pub async fn run_daemon(config_path: Option<PathBuf>, status_interval_secs: u64) -> Result<()> {
    let scan_config = load_scan_config(config_path.as_deref())?;
    tracing::info!(
        "Starting monitor: {} active segments, {} parallel sweeps",
        scan_config.active_targets().len(),
        scan_config.max_concurrent_scans()
    );

    let provider = Arc::new(SharedConfig::new(scan_config));
    let controller = Arc::new(ReconfigurationController::new(ScanContext::new(
        provider.clone(),
        Arc::new(StatusStore::new()),
        Arc::new(PingProbe::new()),
    )));

    // Capacity problems are the only fatal startup error
    controller
        .start()
        .await
        .context("Failed to start the scan scheduler")?;

    let mut signals = Signals::install()?;
    let mut status_timer = interval(Duration::from_secs(status_interval_secs.max(1)));
    status_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick, nothing has been scanned yet
    status_timer.tick().await;

    loop {
        tokio::select! {
            event = signals.next() => match event {
                SignalEvent::Reload => reload(&controller, &provider, config_path.as_deref()),
                SignalEvent::Shutdown(name) => {
                    tracing::info!("Received {}, stopping after the current cycle", name);
                    break;
                }
            },
            _ = status_timer.tick() => log_status_summary(&controller, provider.as_ref()),
        }
    }

    controller.shutdown().await;
    tracing::info!("Monitor stopped");
    Ok(())
}

fn load_scan_config(config_path: Option<&Path>) -> Result<ScanConfig> {
    let loaded = config::load_config(config_path)?;
    tracing::info!(
        "Configuration from {}{}",
        loaded.source,
        loaded
            .path
            .as_ref()
            .map(|p| format!(" ({})", p.display()))
            .unwrap_or_default()
    );
    Ok(ScanConfig::from_file(&loaded.file)?)
}

/// Swap in the file's current contents and restart in the background.
///
/// A file that no longer validates leaves the running configuration alone.
fn reload(
    controller: &Arc<ReconfigurationController>,
    provider: &Arc<SharedConfig>,
    config_path: Option<&Path>,
) {
    tracing::info!("Received SIGHUP, reloading configuration");
    let scan_config = match load_scan_config(config_path) {
        Ok(scan_config) => scan_config,
        Err(e) => {
            tracing::error!("Reload failed, keeping current configuration: {:#}", e);
            return;
        }
    };
    provider.replace(scan_config);

    let controller = Arc::clone(controller);
    tokio::spawn(async move {
        match controller.request_restart().await {
            Ok(RestartOutcome::Restarted { generation }) => {
                tracing::info!("Scheduler restarted as generation {}", generation)
            }
            Ok(RestartOutcome::Superseded) => {
                tracing::debug!("Restart superseded by a later reload")
            }
            Err(e) => tracing::error!("Restart failed: {}", e),
        }
    });
}

fn log_status_summary(controller: &ReconfigurationController, provider: &dyn ConfigProvider) {
    let config = provider.current();
    let state = controller.state();
    tracing::info!(
        "Status: generation {} {}, {} cycles completed",
        state.generation(),
        state.phase(),
        state.cycles_completed()
    );

    let now = chrono::Utc::now();
    for target in config.active_targets() {
        let label = config.description(target.id);
        match controller.store().get(target.id) {
            SegmentStatus::Scanned(snapshot) => tracing::info!(
                "  {}: {}/{} online, scanned {}s ago",
                label,
                snapshot.online_count(),
                snapshot.devices.len(),
                (now - snapshot.scanned_at).num_seconds()
            ),
            SegmentStatus::Unscanned => tracing::info!("  {}: not scanned yet", label),
        }
    }
}
