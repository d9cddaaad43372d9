//! Alert dispatch
//!
//! Hand-off point to outbound notification transports. Delivery is best
//! effort: failures are logged and never interrupt monitoring.

use crate::scoring::{strongest, Anomaly};
use crate::DeviceClass;
use serde::{Deserialize, Serialize};

/// Alert-eligible detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlertEvent {
    SpectralAnomaly {
        center_freq: f64,
        anomalies: Vec<Anomaly>,
    },
    ProximityBreach {
        class: DeviceClass,
        distance_ft: f64,
        power_db: f64,
        signal_increase_pct: f64,
        frequency_mhz: f64,
    },
}

impl AlertEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AlertEvent::SpectralAnomaly { .. } => "spectral_anomaly",
            AlertEvent::ProximityBreach { .. } => "proximity_breach",
        }
    }

    pub fn title(&self) -> String {
        match self {
            AlertEvent::SpectralAnomaly { center_freq, anomalies } => {
                format!("RF-IDS Alert: {} anomalies at {} MHz", anomalies.len(), center_freq)
            }
            AlertEvent::ProximityBreach { class, .. } => {
                format!("RF-IDS PROXIMITY ALERT: {} detected", class.describe())
            }
        }
    }

    /// One-line summary built around the strongest deviation
    pub fn summary(&self) -> String {
        match self {
            AlertEvent::SpectralAnomaly { center_freq, anomalies } => {
                let (increase, distance) = strongest(anomalies)
                    .map(|a| (a.signal_increase_pct, format_distance(a.estimated_distance_ft)))
                    .unwrap_or((0.0, "unknown".to_string()));
                format!(
                    "{} anomalies detected at {} MHz (Signal: +{:.1}%, Dist: {} ft)",
                    anomalies.len(), center_freq, increase, distance
                )
            }
            AlertEvent::ProximityBreach { class, distance_ft, signal_increase_pct, .. } => {
                format!(
                    "{} within {} feet (Signal: +{:.1}%)",
                    class.describe(), distance_ft, signal_increase_pct
                )
            }
        }
    }

    /// Multi-line detail for transports with room for it
    pub fn body(&self) -> String {
        match self {
            AlertEvent::SpectralAnomaly { center_freq, anomalies } => {
                let mut body = format!(
                    "Frequency band: {} MHz\nDetected {} anomalies:\n",
                    center_freq, anomalies.len()
                );
                for (i, a) in anomalies.iter().enumerate() {
                    body.push_str(&format!(
                        "{}. Frequency: {:.3} MHz, Difference: {:.2} dB, Signal Increase: +{:.1}%",
                        i + 1, a.bin_frequency, a.difference_db, a.signal_increase_pct
                    ));
                    if let Some(d) = a.estimated_distance_ft {
                        body.push_str(&format!(", Est. Distance: ~{} feet", d));
                    }
                    body.push('\n');
                }
                body
            }
            AlertEvent::ProximityBreach { class, distance_ft, power_db, signal_increase_pct, frequency_mhz } => {
                format!(
                    "A {} is within {} feet of the sensor!\nDetection frequency: {} MHz\nSignal strength: {:.2} dB\nSignal increase: +{:.1}%\n",
                    class.describe(), distance_ft, frequency_mhz, power_db, signal_increase_pct
                )
            }
        }
    }
}

fn format_distance(distance: Option<f64>) -> String {
    distance.map(|d| d.to_string()).unwrap_or_else(|| "unknown".to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to run notification command {command}: {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Notification rejected: {0}")]
    Rejected(String),
}

/// Outbound notification transport
pub trait AlertDispatcher: Send {
    fn name(&self) -> &str;

    fn dispatch(&self, event: &AlertEvent) -> Result<(), DispatchError>;
}

/// Send an event to every dispatcher, logging failures.
///
/// Returns how many dispatchers accepted it.
pub fn dispatch_all(dispatchers: &[Box<dyn AlertDispatcher>], event: &AlertEvent) -> usize {
    let mut delivered = 0;
    for dispatcher in dispatchers {
        match dispatcher.dispatch(event) {
            Ok(()) => delivered += 1,
            Err(e) => tracing::error!(dispatcher = dispatcher.name(), "Alert dispatch failed: {}", e),
        }
    }
    delivered
}

/// Writes alerts to the log
pub struct LoggingDispatcher;

impl AlertDispatcher for LoggingDispatcher {
    fn name(&self) -> &str {
        "log"
    }

    fn dispatch(&self, event: &AlertEvent) -> Result<(), DispatchError> {
        match event {
            AlertEvent::SpectralAnomaly { .. } => tracing::warn!(kind = event.kind(), "ALERT: {}", event.summary()),
            AlertEvent::ProximityBreach { .. } => tracing::warn!(kind = event.kind(), "PROXIMITY ALERT: {}", event.summary()),
        }
        Ok(())
    }
}

/// Runs an external command per alert, e.g. `notify-send {title} {body}`.
///
/// Placeholders `{title}`, `{summary}`, `{body}` and `{kind}` are substituted
/// in every argument. The command runs in the background and is reaped by a
/// short-lived waiter thread, which logs a non-zero exit.
pub struct CommandDispatcher {
    command: String,
    args: Vec<String>,
}

impl CommandDispatcher {
    pub fn new(command: &str, args: Vec<String>) -> Self {
        Self {
            command: command.to_string(),
            args,
        }
    }

    pub fn render_args(&self, event: &AlertEvent) -> Vec<String> {
        let title = event.title();
        let summary = event.summary();
        let body = event.body();
        self.args.iter()
            .map(|arg| {
                arg.replace("{title}", &title)
                    .replace("{summary}", &summary)
                    .replace("{body}", &body)
                    .replace("{kind}", event.kind())
            })
            .collect()
    }
}

impl AlertDispatcher for CommandDispatcher {
    fn name(&self) -> &str {
        &self.command
    }

    fn dispatch(&self, event: &AlertEvent) -> Result<(), DispatchError> {
        let args = self.render_args(event);
        tracing::debug!("Executing: {} {:?}", self.command, args);

        let mut child = std::process::Command::new(&self.command)
            .args(&args)
            .spawn()
            .map_err(|source| DispatchError::Command {
                command: self.command.clone(),
                source,
            })?;

        let command = self.command.clone();
        std::thread::Builder::new()
            .name("alert-command".to_string())
            .spawn(move || match child.wait() {
                Ok(status) if !status.success() => {
                    tracing::warn!("Notification command {} exited with {}", command, status);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Failed to wait for notification command {}: {}", command, e),
            })
            .map_err(|source| DispatchError::Command {
                command: self.command.clone(),
                source,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recording(Arc<Mutex<Vec<AlertEvent>>>);

    impl AlertDispatcher for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn dispatch(&self, event: &AlertEvent) -> Result<(), DispatchError> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Failing;

    impl AlertDispatcher for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn dispatch(&self, _event: &AlertEvent) -> Result<(), DispatchError> {
            Err(DispatchError::Rejected("smtp down".to_string()))
        }
    }

    fn anomaly(freq: f64, diff: f64, distance: Option<f64>) -> Anomaly {
        Anomaly {
            bin_frequency: freq,
            baseline_power_db: -80.0,
            current_power_db: -80.0 + diff,
            difference_db: diff,
            signal_increase_pct: 3062.3,
            estimated_distance_ft: distance,
        }
    }

    fn breach() -> AlertEvent {
        AlertEvent::ProximityBreach {
            class: DeviceClass::Cellular,
            distance_ft: 15.0,
            power_db: -25.0,
            signal_increase_pct: 1000.0,
            frequency_mhz: 850.0,
        }
    }

    #[test]
    fn failures_do_not_stop_other_dispatchers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatchers: Vec<Box<dyn AlertDispatcher>> = vec![
            Box::new(Failing),
            Box::new(Recording(seen.clone())),
            Box::new(LoggingDispatcher),
        ];

        assert_eq!(dispatch_all(&dispatchers, &breach()), 2);
        assert_eq!(seen.lock().unwrap().as_slice(), &[breach()]);
    }

    #[test]
    fn spectral_summary_uses_strongest_anomaly() {
        let event = AlertEvent::SpectralAnomaly {
            center_freq: 433.92,
            anomalies: vec![anomaly(433.9, 12.0, Some(18.0)), anomaly(433.95, 15.0, None)],
        };
        assert_eq!(
            event.summary(),
            "2 anomalies detected at 433.92 MHz (Signal: +3062.3%, Dist: unknown ft)"
        );
        assert!(event.body().contains("1. Frequency: 433.900 MHz, Difference: 12.00 dB"));
        assert!(event.body().contains("Est. Distance: ~18 feet"));
    }

    #[test]
    fn proximity_text() {
        assert_eq!(breach().summary(), "cell phone within 15 feet (Signal: +1000.0%)");
        assert_eq!(breach().title(), "RF-IDS PROXIMITY ALERT: cell phone detected");
    }

    #[test]
    fn command_placeholders_are_substituted() {
        let dispatcher = CommandDispatcher::new(
            "notify-send",
            vec!["--app-name=rfids".to_string(), "{title}".to_string(), "[{kind}] {summary}".to_string()],
        );
        let args = dispatcher.render_args(&breach());
        assert_eq!(args[0], "--app-name=rfids");
        assert_eq!(args[1], "RF-IDS PROXIMITY ALERT: cell phone detected");
        assert_eq!(args[2], "[proximity_breach] cell phone within 15 feet (Signal: +1000.0%)");
    }

    #[test]
    fn missing_command_is_a_dispatch_error() {
        let dispatcher = CommandDispatcher::new("/nonexistent/rfids-notifier", Vec::new());
        assert!(matches!(dispatcher.dispatch(&breach()), Err(DispatchError::Command { .. })));
    }

    #[cfg(target_os = "linux")]
    fn zombie_children() -> usize {
        let me = std::process::id().to_string();
        std::fs::read_dir("/proc")
            .unwrap()
            .filter_map(|entry| std::fs::read_to_string(entry.ok()?.path().join("stat")).ok())
            .filter(|stat| {
                // fields after the parenthesized command name: state, ppid, ...
                let rest = stat.rsplit_once(')').map(|(_, rest)| rest).unwrap_or("");
                let mut fields = rest.split_whitespace();
                fields.next() == Some("Z") && fields.next() == Some(me.as_str())
            })
            .count()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn finished_commands_are_reaped() {
        let dispatcher = CommandDispatcher::new("true", vec!["{kind}".to_string()]);
        for _ in 0..20 {
            dispatcher.dispatch(&breach()).unwrap();
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while zombie_children() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(zombie_children(), 0);
    }
}
