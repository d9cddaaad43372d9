//! RF-IDS Monitor
//!
//! Main application entry point: loads configuration, opens the radio and
//! runs the scan engine until Ctrl+C or a fatal stop.

use anyhow::{bail, Result};
use clap::Parser;
use rfids_hal::{HardwareDevice, RtlSdr, SdrConfig, WelchEstimator};
use rfids_sensors::{BaselineStore, DetectionLog, EngineSnapshot, ScanEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[allow(dead_code)]
mod config;

use config::AppConfig;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "rfids")]
#[command(version = "0.1.0")]
#[command(about = "RF intrusion detection monitor", long_about = None)]
struct Args {
    /// Configuration file (default: standard search paths)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Learn a new baseline instead of loading the saved one
    #[arg(long)]
    force_new_baseline: bool,

    /// RTL-SDR device index
    #[arg(short, long, default_value_t = 0)]
    device: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging();

    tracing::info!("╔══════════════════════════════════════════╗");
    tracing::info!("║     RF Intrusion Detection System        ║");
    tracing::info!("║            Version 0.1.0                 ║");
    tracing::info!("╚══════════════════════════════════════════╝");

    // Load configuration
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    config.force_new_baseline |= args.force_new_baseline;
    tracing::info!("Configuration loaded from {:?}", config.config_path);

    config.filter_frequencies();
    if config.frequencies.is_empty() {
        bail!("No tunable frequencies configured");
    }

    let output_dir = config.output_path();
    std::fs::create_dir_all(&output_dir)?;

    // Open the radio
    tracing::info!("Opening RTL-SDR #{}...", args.device);
    let sdr_config = SdrConfig {
        center_frequency: (config.frequencies[0] * 1e6).round() as u64,
        sample_rate: config.sample_rate.round() as u32,
        gain: config.gain.unwrap_or(0),
        agc: config.gain.is_none(),
    };
    let mut sdr = RtlSdr::with_config(args.device, sdr_config)?;
    sdr.init()?;

    let baselines = load_baselines(&config);
    let detection_log = DetectionLog::new(&output_dir)?;
    tracing::info!("Detection logs in {:?}", output_dir);

    let mut engine = ScanEngine::new(config.engine_config(), Box::new(sdr), Box::new(WelchEstimator::default()))
        .with_baselines(baselines)
        .with_proximity(config.proximity.detector())
        .with_detection_log(detection_log);
    for dispatcher in config.alerts.dispatchers() {
        engine = engine.with_dispatcher(dispatcher);
    }

    let snapshots = engine.subscribe();
    let stop = engine.stop_handle();

    print_system_status(&config).await;

    tracing::info!("Monitoring {} frequencies", config.frequencies.len());
    tracing::info!("Press Ctrl+C to stop");

    let status_task = tokio::spawn(report_status(snapshots));
    let mut engine_task = tokio::task::spawn_blocking(move || engine.run());

    // Wait for shutdown signal
    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            stop.request_stop();
            engine_task.await?
        }
        reason = &mut engine_task => reason?,
    };
    status_task.abort();

    tracing::info!("RF-IDS shutdown complete");

    if reason.is_failure() {
        bail!("Monitoring stopped: {}", reason);
    }
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rfids=debug,rfids_hal=debug,rfids_sensors=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false))
        .init();
}

/// Saved baselines, unless a fresh one was requested or none can be read
fn load_baselines(config: &AppConfig) -> BaselineStore {
    let path = config.baseline_path();

    if config.force_new_baseline {
        tracing::info!("Forcing a new baseline");
        return BaselineStore::new();
    }
    if !path.exists() {
        tracing::info!("No saved baseline; one will be learned per frequency");
        return BaselineStore::new();
    }

    match BaselineStore::load(&path) {
        Ok(store) => {
            let missing = store.missing(&config.frequencies);
            if !missing.is_empty() {
                tracing::info!("Baseline will be created for new frequencies: {:?}", missing);
            }
            store
        }
        Err(e) => {
            tracing::error!("Error loading baseline: {}", e);
            BaselineStore::new()
        }
    }
}

/// Periodic one-line summary from the engine snapshot
async fn report_status(mut snapshots: watch::Receiver<Arc<EngineSnapshot>>) {
    let mut interval = tokio::time::interval(STATUS_INTERVAL);
    interval.tick().await;

    loop {
        interval.tick().await;
        if snapshots.has_changed().is_err() {
            break;
        }
        let snapshot = snapshots.borrow_and_update().clone();
        let uptime = snapshot.uptime();
        tracing::info!(
            scans = snapshot.scan_count,
            alerts = snapshot.alert_count,
            signal_db = ?snapshot.signal_db,
            "Uptime {}:{:02}:{:02} | {}",
            uptime.num_hours(),
            uptime.num_minutes() % 60,
            uptime.num_seconds() % 60,
            snapshot.status
        );
    }
}

async fn print_system_status(config: &AppConfig) {
    use sysinfo::System;

    let mut sys = System::new_all();
    sys.refresh_all();

    let frequencies = config.frequencies.iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    tracing::info!("╭─────────────── System Status ───────────────╮");
    tracing::info!("│ Hostname: {:>32} │", System::host_name().unwrap_or_default());
    tracing::info!("│ OS: {:>38} │", System::name().unwrap_or_default());
    tracing::info!("│ Kernel: {:>34} │", System::kernel_version().unwrap_or_default());
    tracing::info!("│ CPU: {:>37} │", sys.cpus().first().map(|c| c.brand()).unwrap_or("Unknown"));
    tracing::info!("│ Memory: {:>26} MB / {} MB │",
        sys.used_memory() / 1024 / 1024,
        sys.total_memory() / 1024 / 1024);
    tracing::info!("├──────────────── Configuration ────────────────┤");
    tracing::info!("│ Frequencies (MHz): {:>23} │", frequencies);
    tracing::info!("│ Threshold: {:>28} dB │", config.threshold);
    tracing::info!("│ Scan Interval: {:>25} s │", config.scan_interval_secs);
    tracing::info!("│ Proximity: {:>30} │", if config.proximity.enabled { "enabled" } else { "disabled" });
    tracing::info!("│ Output: {:>34} │", config.output_dir);
    tracing::info!("╰──────────────────────────────────────────────╯");
}
