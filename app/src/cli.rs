//! RF-IDS CLI Tool
//!
//! Command-line interface for browsing detection logs, inspecting the
//! baseline and calibrating proximity detection.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rfids_hal::{sdr, HardwareDevice, PsdEstimator, RtlSdr, SdrConfig, SdrDevice, WelchEstimator};
use rfids_sensors::{BaselineStore, DetectionLog, DeviceCalibration, DeviceClass, LogKind, LogTable, Spectrum};
use std::path::PathBuf;

#[allow(dead_code)]
mod config;

use config::AppConfig;

/// Log entries shown per page
const PAGE_SIZE: usize = 15;

#[derive(Parser)]
#[command(name = "rfids-cli")]
#[command(author = "RF-IDS Team")]
#[command(version = "0.1.0")]
#[command(about = "RF Intrusion Detection System CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: standard search paths)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Browse detection logs, newest first
    Logs {
        /// Show the proximity log instead of spectral anomalies
        #[arg(short, long)]
        proximity: bool,

        /// Page number, starting at 1
        #[arg(short = 'n', long, default_value_t = 1)]
        page: usize,

        /// Output format (json, table)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show the saved baseline
    Baseline,

    /// Calibrate proximity detection with a reference device at the alert distance
    Calibrate {
        /// Device class (wireless, cellular)
        #[arg(long)]
        class: DeviceClass,

        /// Reference frequency in MHz
        #[arg(long)]
        frequency: f64,

        /// Alert distance in feet (default: configured threshold)
        #[arg(long)]
        distance: Option<f64>,

        /// RTL-SDR device index
        #[arg(short, long, default_value_t = 0)]
        device: u32,
    },

    /// Generate sample configuration
    Config {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// System information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let load_config = || match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };

    match &cli.command {
        Commands::Logs { proximity, page, format } => {
            show_logs(&load_config()?, *proximity, *page, format)?;
        }

        Commands::Baseline => {
            show_baseline(&load_config()?)?;
        }

        Commands::Calibrate { class, frequency, distance, device } => {
            calibrate(load_config()?, *class, *frequency, *distance, *device)?;
        }

        Commands::Config { output } => {
            generate_config(output.clone())?;
        }

        Commands::Info => {
            show_info()?;
        }
    }

    Ok(())
}

fn show_logs(config: &AppConfig, proximity: bool, page: usize, format: &str) -> Result<()> {
    let log = DetectionLog::new(&config.output_path())?;
    let kind = if proximity { LogKind::Proximity } else { LogKind::Anomaly };
    let table = log.load(kind)?;

    if table.rows.is_empty() {
        println!("No log entries found in {:?}.", log.path(kind));
        return Ok(());
    }

    let pages = table.page_count(PAGE_SIZE);
    let page = page.clamp(1, pages);
    let rows = table.page(page - 1, PAGE_SIZE);

    match format {
        "json" => {
            let entries: Vec<serde_json::Map<String, serde_json::Value>> = rows.iter()
                .map(|row| {
                    table.headers.iter()
                        .zip(row.iter())
                        .map(|(h, v)| (h.clone(), serde_json::Value::String(v.clone())))
                        .collect()
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            match kind {
                LogKind::Anomaly => print_anomaly_rows(&table, rows),
                LogKind::Proximity => print_proximity_rows(&table, rows),
            }
            println!("\nPage {}/{} ({} entries)", page, pages, table.rows.len());
        }
    }

    Ok(())
}

fn column<'a>(table: &LogTable, row: &'a [String], name: &str) -> &'a str {
    table.headers.iter()
        .position(|h| h == name)
        .and_then(|i| row.get(i))
        .map(String::as_str)
        .unwrap_or("")
}

fn print_anomaly_rows(table: &LogTable, rows: &[Vec<String>]) {
    println!("╭─────────────────────────────────────────────────────────────────────────────────────╮");
    println!("│                                  Anomaly Log                                        │");
    println!("├─────────────────────┬────────────┬────────────┬──────────┬────────────┬─────────────┤");
    println!("│ Time                │ Center MHz │ Bin MHz    │ Diff dB  │ Increase % │ Distance ft │");
    println!("├─────────────────────┼────────────┼────────────┼──────────┼────────────┼─────────────┤");

    for row in rows {
        println!("│ {:19} │ {:>10} │ {:>10} │ {:>8} │ {:>10} │ {:>11} │",
            column(table, row, "timestamp"),
            column(table, row, "center_freq"),
            column(table, row, "anomaly_freq"),
            column(table, row, "difference_db"),
            column(table, row, "signal_increase_pct"),
            column(table, row, "estimated_distance"));
    }

    println!("╰─────────────────────┴────────────┴────────────┴──────────┴────────────┴─────────────╯");
}

fn print_proximity_rows(table: &LogTable, rows: &[Vec<String>]) {
    println!("╭──────────────────────────────────────────────────────────────────────────────────────────╮");
    println!("│                                   Proximity Log                                          │");
    println!("├─────────────────────┬─────────────────────┬──────────┬────────────┬──────────┬───────────┤");
    println!("│ Time                │ First Seen          │ Device   │ Freq MHz   │ Power dB │ Status    │");
    println!("├─────────────────────┼─────────────────────┼──────────┼────────────┼──────────┼───────────┤");

    for row in rows {
        let status = match column(table, row, "status") {
            "alert" => "ALERT",
            "early_detection" => "early",
            other => other,
        };
        println!("│ {:19} │ {:19} │ {:8} │ {:>10} │ {:>8} │ {:9} │",
            column(table, row, "timestamp"),
            column(table, row, "first_seen"),
            truncate(column(table, row, "device_type"), 8),
            column(table, row, "frequency"),
            column(table, row, "power_db"),
            status);
    }

    println!("╰─────────────────────┴─────────────────────┴──────────┴────────────┴──────────┴───────────╯");
}

fn show_baseline(config: &AppConfig) -> Result<()> {
    let path = config.baseline_path();
    if !path.exists() {
        println!("No baseline saved at {:?}. Start the monitor to learn one.", path);
        return Ok(());
    }

    let store = BaselineStore::load(&path)?;

    println!("╭──────────────────────────────────────────────────────╮");
    println!("│                       Baseline                       │");
    println!("├──────────────┬────────────┬──────────────┬───────────┤");
    println!("│ Frequency    │ Bins       │ Mean dB      │ Captures  │");
    println!("├──────────────┼────────────┼──────────────┼───────────┤");

    for frequency in store.frequencies() {
        if let Some(baseline) = store.get(frequency) {
            println!("│ {:>8} MHz │ {:>10} │ {:>12.2} │ {:>9} │",
                frequency,
                baseline.len(),
                baseline.mean_power_db(),
                baseline.sample_count);
        }
    }

    println!("╰──────────────┴────────────┴──────────────┴───────────╯");
    println!("\nCreated: {}", store.created_at().with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"));

    let missing = store.missing(&config.frequencies);
    if !missing.is_empty() {
        println!("Not yet learned: {:?}", missing);
    }

    Ok(())
}

fn calibrate(mut config: AppConfig, class: DeviceClass, frequency: f64, distance: Option<f64>, device: u32) -> Result<()> {
    let distance = distance.unwrap_or_else(|| config.proximity.distance_threshold(class));

    println!("Calibrating {} at {} MHz.", class.describe(), frequency);
    println!("Hold the reference device {} feet from the antenna...", distance);

    let sdr_config = SdrConfig {
        center_frequency: (frequency * 1e6).round() as u64,
        sample_rate: config.sample_rate.round() as u32,
        gain: config.gain.unwrap_or(0),
        agc: config.gain.is_none(),
    };
    let mut sdr = RtlSdr::with_config(device, sdr_config)?;
    sdr.init()?;

    let samples = sdr.read_samples(config.num_samples);
    sdr.close()?;
    let samples = samples?;

    let (offsets, power_db) = WelchEstimator::default()
        .estimate(&samples, sdr.sample_rate_hz() / 1e6, config.fft_size)?;
    let capture = Spectrum::from_baseband(frequency, offsets, power_db)?;
    let calibration = DeviceCalibration::from_capture(frequency, &capture, distance)?;

    config.proximity.set_calibration(class, &calibration);
    let path = config.save_path();
    config.save(&path)
        .with_context(|| format!("Failed to write calibration to {:?}", path))?;

    println!("\nReference power: {:.2} dB (early detection below {:.2} dB)",
        calibration.reference_power_db,
        calibration.extended_reference_db());
    println!("Alert distance: {} ft", calibration.alert_distance_ft);
    println!("Calibration written to: {:?}", path);
    if config.proximity.calibration_needed {
        println!("Calibrate the other device class to enable proximity detection.");
    }

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let example = format!(
        "# RF-IDS Configuration File\n\
         #\n\
         # Copy this file to /etc/rfids/config.toml or ~/.config/rfids/config.toml\n\
         # Frequencies are in MHz, threshold in dB, gain in tenths of dB (omit for AGC).\n\n{}",
        AppConfig::example()
    );

    if let Some(path) = output {
        std::fs::write(&path, example)?;
        println!("Configuration written to: {:?}", path);
    } else {
        println!("{}", example);
    }

    Ok(())
}

fn show_info() -> Result<()> {
    use sysinfo::System;

    let mut sys = System::new_all();
    sys.refresh_all();

    println!("╭──────────────────────────────────────────────────────────────╮");
    println!("│                 RF-IDS System Information                    │");
    println!("╰──────────────────────────────────────────────────────────────╯\n");

    println!("System:");
    println!("  Hostname: {}", System::host_name().unwrap_or_default());
    println!("  OS: {} {}",
        System::name().unwrap_or_default(),
        System::os_version().unwrap_or_default());
    println!("  Kernel: {}", System::kernel_version().unwrap_or_default());

    println!("\nHardware:");
    println!("  CPU: {}", sys.cpus().first().map(|c| c.brand()).unwrap_or("Unknown"));
    println!("  Cores: {}", sys.cpus().len());
    println!("  Memory: {} MB total, {} MB used",
        sys.total_memory() / 1024 / 1024,
        sys.used_memory() / 1024 / 1024);

    println!("\nRF-IDS:");
    println!("  Version: 0.1.0");
    println!("  HAL Version: 0.1.0");
    println!("  Sensors Version: 0.1.0");

    let devices = sdr::enumerate_devices();
    println!("\nRadio:");
    if devices.is_empty() {
        println!("  RTL-SDR: ✗ (simulated device will be used)");
    } else {
        println!("  RTL-SDR: ✓ {} device(s) at index {:?}", devices.len(), devices);
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max.saturating_sub(3)).collect::<String>())
    }
}
