//! IP Monitor CLI - headless VLAN reachability monitoring agent
//!
//! This binary can:
//! - Run the background scan scheduler (for systemd integration)
//! - Sweep segments once and print what answered
//! - Validate and show the scan configuration

mod daemon;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ipmonitor_core::config::{self, LoadedConfig, ScanConfig};
use ipmonitor_core::{
    PingProbe, RunState, ScanContext, Scheduler, SegmentId, SegmentStatus, SharedConfig,
    StatusStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "ipmonitor")]
#[command(author = "IP Monitor Team")]
#[command(version)]
#[command(about = "Background reachability monitoring of VLAN segments")]
#[command(long_about = "
IP Monitor periodically ping-sweeps a set of VLAN segments and keeps the
latest reachability snapshot for each one.

Quick start:
  1. Create a config:    ipmonitor config --init
  2. Check it:           ipmonitor check-config
  3. Try one sweep:      ipmonitor scan --segment 70
  4. Start monitoring:   ipmonitor run

While running, send SIGHUP to reload the configuration file.
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Configuration file (overrides IPMONITOR_CONFIG and the per-user file)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the background scan scheduler until interrupted
    #[command(alias = "daemon")]
    Run {
        /// Seconds between status summaries in the log
        #[arg(long, default_value = "300")]
        status_interval: u64,
    },

    /// Sweep segments once and print the results
    Scan {
        /// Segment to sweep (repeatable). Defaults to every active segment.
        #[arg(short, long = "segment")]
        segments: Vec<SegmentId>,
    },

    /// Validate the configuration file and report every problem found
    CheckConfig,

    /// Show configuration paths and effective settings
    Config {
        /// Write the default configuration to the config file path if none exists
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("ipmonitor={},ipmonitor_core={}", log_level, log_level).into()),
        )
        .with_target(false)
        .init();

    match &cli.command {
        Commands::Run { status_interval } => {
            daemon::run_daemon(cli.config.clone(), *status_interval).await
        }
        Commands::Scan { segments } => cmd_scan(&cli, segments).await,
        Commands::CheckConfig => cmd_check_config(&cli),
        Commands::Config { init: true } => cmd_config_init(&cli),
        Commands::Config { init: false } => cmd_config(&cli),
    }
}

fn load(cli: &Cli) -> Result<(LoadedConfig, ScanConfig)> {
    let loaded = config::load_config(cli.config.as_deref())?;
    let scan = ScanConfig::from_file(&loaded.file).with_context(|| match &loaded.path {
        Some(path) => format!("Invalid configuration in {}", path.display()),
        None => "Invalid built-in configuration".to_string(),
    })?;
    Ok((loaded, scan))
}

async fn cmd_scan(cli: &Cli, segments: &[SegmentId]) -> Result<()> {
    let (_, scan_config) = load(cli)?;
    let scan_config = if segments.is_empty() {
        scan_config
    } else {
        scan_config.restricted_to(segments)?
    };
    let targets = scan_config.active_targets().to_vec();

    if targets.is_empty() {
        match cli.format {
            OutputFormat::Text => println!("No segments to scan."),
            OutputFormat::Json => println!("{}", serde_json::json!({ "segments": [] })),
        }
        return Ok(());
    }

    if let OutputFormat::Text = cli.format {
        println!(
            "Scanning {} segments ({} at a time)...",
            targets.len(),
            scan_config.max_concurrent_scans()
        );
    }

    let provider = Arc::new(SharedConfig::new(scan_config.clone()));
    let store = Arc::new(StatusStore::new());
    let state = Arc::new(RunState::new());
    let scheduler = Scheduler::new(
        state.generation(),
        ScanContext::new(provider, Arc::clone(&store), Arc::new(PingProbe::new())),
        state,
        CancellationToken::new(),
    );
    let report = scheduler.run_cycle().await?;

    match cli.format {
        OutputFormat::Text => {
            println!();
            for target in &targets {
                let label = scan_config.description(target.id);
                match store.get(target.id) {
                    SegmentStatus::Scanned(snapshot) => {
                        println!(
                            "{} [{}]: {} online",
                            label,
                            target.range(),
                            snapshot.online_count()
                        );
                        for device in snapshot.online() {
                            match &device.device_type {
                                Some(kind) => println!("  {:15} {}", device.address, kind),
                                None => println!("  {}", device.address),
                            }
                        }
                    }
                    SegmentStatus::Unscanned => {
                        println!("{} [{}]: scan failed", label, target.range());
                    }
                }
            }
            println!();
            println!("Completed in {:.1}s", report.elapsed.as_secs_f64());
        }
        OutputFormat::Json => {
            let results: Vec<_> = targets
                .iter()
                .map(|target| match store.get(target.id) {
                    SegmentStatus::Scanned(snapshot) => serde_json::json!({
                        "segment": target.id,
                        "range": target.range(),
                        "description": scan_config.description(target.id),
                        "online_count": snapshot.online_count(),
                        "snapshot": snapshot.as_ref(),
                    }),
                    SegmentStatus::Unscanned => serde_json::json!({
                        "segment": target.id,
                        "range": target.range(),
                        "description": scan_config.description(target.id),
                        "error": "scan failed",
                    }),
                })
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "segments": results,
                    "failed": report.failed,
                    "elapsed_secs": report.elapsed.as_secs_f64(),
                })
            );
        }
    }

    Ok(())
}

fn cmd_check_config(cli: &Cli) -> Result<()> {
    let loaded = config::load_config(cli.config.as_deref())?;
    let report = config::check(&loaded.file);
    let origin = loaded
        .path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "built-in defaults".to_string());

    match cli.format {
        OutputFormat::Text => {
            println!("Checking {} ({})", origin, loaded.source);
            println!("{}", report.message());
            for issue in &report.issues {
                println!("  - {}", issue);
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "config_file": loaded.path,
                    "source": loaded.source.to_string(),
                    "intervals_tested": report.intervals_tested,
                    "valid": report.valid,
                    "issues": report.issues,
                    "message": report.message(),
                })
            );
        }
    }

    if !report.valid {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_config_init(cli: &Cli) -> Result<()> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => config::get_config_file_path()
            .context("Could not determine the configuration directory")?,
    };

    if path.exists() {
        match cli.format {
            OutputFormat::Text => println!("Config file already exists: {}", path.display()),
            OutputFormat::Json => println!(
                "{}",
                serde_json::json!({ "status": "exists", "config_file": path })
            ),
        }
        return Ok(());
    }

    let mut file = config::ConfigFile::default();
    config::save_config_file(&path, &mut file)?;

    match cli.format {
        OutputFormat::Text => println!("Wrote default configuration to {}", path.display()),
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "status": "created",
                "config_file": path,
                "last_updated": file.system.last_updated,
            })
        ),
    }
    Ok(())
}

fn cmd_config(cli: &Cli) -> Result<()> {
    let (loaded, scan_config) = load(cli)?;
    let config_path = loaded
        .path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(config::get_config_file_path_string);

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:      {} (from {})", config_path, loaded.source);
            println!("Base prefix:      {}", loaded.file.network.base_prefix);
            println!("Concurrency:      {}", scan_config.max_concurrent_scans());
            println!("Probe timeout:    {}s", scan_config.probe_timeout().as_secs());
            println!("Retry attempts:   {}", scan_config.retry_attempts());
            println!("Restart grace:    {}s", scan_config.restart_grace().as_secs());
            if !loaded.file.system.last_updated.is_empty() {
                println!("Last updated:     {}", loaded.file.system.last_updated);
            }
            println!();
            println!("Active segments:");
            for target in scan_config.active_targets() {
                println!(
                    "  {:>3}  {:18} every {:>3}s  {}",
                    target.id,
                    target.range(),
                    scan_config.interval_for(target.id).as_secs(),
                    scan_config.description(target.id)
                );
            }
            println!();
            println!("Environment variables:");
            println!("  IPMONITOR_CONFIG - Path to the configuration file");
            println!("  RUST_LOG         - Log filter (e.g. ipmonitor_core=debug)");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            let segments: Vec<_> = scan_config
                .active_targets()
                .iter()
                .map(|target| {
                    serde_json::json!({
                        "segment": target.id,
                        "range": target.range(),
                        "interval_secs": scan_config.interval_for(target.id).as_secs(),
                        "description": scan_config.description(target.id),
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "config_file": config_path,
                    "source": loaded.source.to_string(),
                    "base_prefix": loaded.file.network.base_prefix,
                    "max_concurrent_scans": scan_config.max_concurrent_scans(),
                    "probe_timeout_secs": scan_config.probe_timeout().as_secs(),
                    "retry_attempts": scan_config.retry_attempts(),
                    "restart_grace_secs": scan_config.restart_grace().as_secs(),
                    "last_updated": loaded.file.system.last_updated,
                    "segments": segments,
                })
            );
        }
    }

    Ok(())
}
