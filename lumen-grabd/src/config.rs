//! Configuration for the capture daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use lumen_core::{LeakPolicy, MonitorConfig, SinkConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GrabConfig {
    /// Capture device settings.
    pub device: DeviceSection,
    /// Lighting sink settings.
    pub sink: SinkSection,
    /// Capture loop settings.
    pub capture: CaptureSection,
    /// Resource tracker settings.
    pub tracker: TrackerSection,
    /// System monitor settings.
    pub monitor: MonitorSection,
    /// Logging settings.
    pub logging: LoggingSection,
}

/// Capture device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// DRM node to capture from. Empty = built-in default.
    pub path: String,
}

/// Lighting sink connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSection {
    /// TCP address of the lighting controller.
    pub address: String,
    /// Consecutive failures tolerated before fallback mode.
    pub max_retries: u32,
    /// Connect/registration timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Per-frame send timeout in milliseconds.
    pub send_timeout_ms: u64,
    /// Initial retry backoff in milliseconds.
    pub base_backoff_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_backoff_ms: u64,
    /// Reconnect probe cadence while in fallback, milliseconds.
    pub probe_interval_ms: u64,
    /// Origin string announced to the sink.
    pub origin: String,
    /// Priority announced to the sink.
    pub priority: i32,
}

/// Capture loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// Target capture rate, frames per second.
    pub fps: u32,
    /// Per-cycle time budget in milliseconds.
    pub cycle_budget_ms: u64,
    /// Frame queue depth between capture and delivery.
    pub queue_capacity: usize,
}

/// Resource tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSection {
    /// A handle older than this many cycles counts as a leak.
    pub leak_after_cycles: u64,
    /// "warn" reports leaks only; "force-close" also closes them.
    pub leak_policy: String,
    /// Run the leak check every N cycles.
    pub check_every_cycles: u64,
}

/// System monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub enabled: bool,
    /// Sampling interval in milliseconds.
    pub interval_ms: u64,
    /// Substring identifying the co-resident player process.
    pub player_pattern: String,
    /// Memory-use percentage treated as anomalous.
    pub memory_threshold_pct: u8,
    /// GEM object count treated as anomalous.
    pub gem_warn_threshold: usize,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Console log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Diagnostic log file path.
    pub diagnostic_log: String,
    /// Resource-tracker dump written on abnormal termination.
    pub dump_path: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            path: String::new(),
        }
    }
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:19400".into(),
            max_retries: 10,
            connect_timeout_ms: 3000,
            send_timeout_ms: 3000,
            base_backoff_ms: 100,
            max_backoff_ms: 5000,
            probe_interval_ms: 30_000,
            origin: "lumen".into(),
            priority: 64,
        }
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            fps: 20,
            cycle_budget_ms: 500,
            queue_capacity: 4,
        }
    }
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            leak_after_cycles: 3,
            leak_policy: "warn".into(),
            check_every_cycles: 100,
        }
    }
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            player_pattern: "kodi".into(),
            memory_threshold_pct: 90,
            gem_warn_threshold: 100,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            diagnostic_log: "lumen-grabd.log".into(),
            dump_path: "lumen-tracker-dump.json".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl GrabConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// The device path, if overridden.
    pub fn device_path(&self) -> Option<PathBuf> {
        if self.device.path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.device.path))
        }
    }

    pub fn to_sink_config(&self) -> SinkConfig {
        SinkConfig {
            address: self.sink.address.clone(),
            max_retries: self.sink.max_retries,
            connect_timeout: Duration::from_millis(self.sink.connect_timeout_ms),
            send_timeout: Duration::from_millis(self.sink.send_timeout_ms),
            base_backoff: Duration::from_millis(self.sink.base_backoff_ms.max(1)),
            max_backoff: Duration::from_millis(self.sink.max_backoff_ms.max(1)),
            probe_interval: Duration::from_millis(self.sink.probe_interval_ms.max(1000)),
            origin: self.sink.origin.clone(),
            priority: self.sink.priority,
        }
    }

    pub fn to_monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_millis(self.monitor.interval_ms.max(100)),
            player_pattern: self.monitor.player_pattern.clone(),
            memory_threshold_pct: self.monitor.memory_threshold_pct,
            gem_warn_threshold: self.monitor.gem_warn_threshold,
            ..MonitorConfig::default()
        }
    }

    pub fn leak_policy(&self) -> LeakPolicy {
        match self.tracker.leak_policy.as_str() {
            "force-close" => LeakPolicy::ForceClose,
            _ => LeakPolicy::Warn,
        }
    }

    /// Capture rate clamped to something sane.
    pub fn fps(&self) -> u32 {
        self.capture.fps.clamp(1, 60)
    }

    pub fn cycle_budget(&self) -> Duration {
        Duration::from_millis(self.capture.cycle_budget_ms.max(10))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = GrabConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("address"));
        assert!(text.contains("fps"));
        assert!(text.contains("leak_after_cycles"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = GrabConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: GrabConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.sink.address, "127.0.0.1:19400");
        assert_eq!(parsed.capture.fps, 20);
        assert_eq!(parsed.tracker.leak_after_cycles, 3);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let parsed: GrabConfig = toml::from_str("[sink]\nmax_retries = 2\n").unwrap();
        assert_eq!(parsed.sink.max_retries, 2);
        assert_eq!(parsed.sink.address, "127.0.0.1:19400");
        assert_eq!(parsed.capture.queue_capacity, 4);
    }

    #[test]
    fn fps_is_clamped() {
        let mut cfg = GrabConfig::default();
        cfg.capture.fps = 500;
        assert_eq!(cfg.fps(), 60);
        cfg.capture.fps = 0;
        assert_eq!(cfg.fps(), 1);
    }

    #[test]
    fn leak_policy_parses() {
        let mut cfg = GrabConfig::default();
        assert_eq!(cfg.leak_policy(), LeakPolicy::Warn);
        cfg.tracker.leak_policy = "force-close".into();
        assert_eq!(cfg.leak_policy(), LeakPolicy::ForceClose);
        cfg.tracker.leak_policy = "garbage".into();
        assert_eq!(cfg.leak_policy(), LeakPolicy::Warn);
    }

    #[test]
    fn empty_device_path_means_default() {
        let cfg = GrabConfig::default();
        assert!(cfg.device_path().is_none());

        let mut cfg = GrabConfig::default();
        cfg.device.path = "/dev/dri/card0".into();
        assert_eq!(cfg.device_path(), Some(PathBuf::from("/dev/dri/card0")));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = GrabConfig::load(&dir.path().join("nope.toml"));
        assert_eq!(cfg.capture.fps, 20);
    }
}
