//! Independent observer of the co-resident video player and
//! kernel-level resource counts.
//!
//! Runs as its own periodic task and communicates with the rest of
//! the system only through log events. Samples are classified as
//! routine (buffered) or anomalous (logged immediately); the player
//! crashing or restarting is observed and logged, never acted on.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::diag::DiagnosticLogger;

// ── Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Substring matched against `/proc/<pid>/cmdline` to find the
    /// co-resident player.
    pub player_pattern: String,
    /// Memory-use percentage above which a sample is anomalous.
    pub memory_threshold_pct: u8,
    /// GEM object count above which a sample is anomalous.
    pub gem_warn_threshold: usize,
    /// Root of the proc filesystem (overridable for tests).
    pub proc_root: PathBuf,
    /// DRM debugfs directory for the captured card.
    pub dri_debugfs: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            player_pattern: "kodi".to_string(),
            memory_threshold_pct: 90,
            gem_warn_threshold: 100,
            proc_root: PathBuf::from("/proc"),
            dri_debugfs: PathBuf::from("/sys/kernel/debug/dri/0"),
        }
    }
}

// ── HealthSnapshot ───────────────────────────────────────────────

/// One observation. Immutable; superseded by later snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub load_avg: f64,
    pub memory_used_pct: u8,
    /// Pids of the co-resident player, if running.
    pub player_pids: BTreeSet<u32>,
    /// DRM client count from debugfs, when readable.
    pub drm_clients: Option<usize>,
    /// Outstanding GEM object count from debugfs, when readable.
    pub gem_objects: Option<usize>,
    pub taken_at: Instant,
}

/// Why a sample was classified anomalous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    DrmClientCountChanged { from: usize, to: usize },
    MemoryAboveThreshold { pct: u8 },
    GemObjectsHigh { count: usize },
    PlayerVanished,
    /// The player disappeared and came back under different pids.
    PlayerRestarted {
        old: BTreeSet<u32>,
        new: BTreeSet<u32>,
    },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DrmClientCountChanged { from, to } => {
                write!(f, "DRM client count changed {from} -> {to}")
            }
            Self::MemoryAboveThreshold { pct } => write!(f, "memory use {pct}% above threshold"),
            Self::GemObjectsHigh { count } => write!(f, "high GEM object count: {count}"),
            Self::PlayerVanished => write!(f, "player process disappeared"),
            Self::PlayerRestarted { old, new } => {
                write!(f, "player restarted: pids {old:?} -> {new:?}")
            }
        }
    }
}

/// Compare a sample against its predecessor.
pub fn classify(
    config: &MonitorConfig,
    prev: Option<&HealthSnapshot>,
    cur: &HealthSnapshot,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();

    if cur.memory_used_pct >= config.memory_threshold_pct {
        anomalies.push(Anomaly::MemoryAboveThreshold {
            pct: cur.memory_used_pct,
        });
    }
    if let Some(count) = cur.gem_objects {
        if count >= config.gem_warn_threshold {
            anomalies.push(Anomaly::GemObjectsHigh { count });
        }
    }

    let Some(prev) = prev else {
        return anomalies;
    };

    if let (Some(from), Some(to)) = (prev.drm_clients, cur.drm_clients) {
        if from != to {
            anomalies.push(Anomaly::DrmClientCountChanged { from, to });
        }
    }

    if !prev.player_pids.is_empty() {
        if cur.player_pids.is_empty() {
            anomalies.push(Anomaly::PlayerVanished);
        } else if prev.player_pids.is_disjoint(&cur.player_pids) {
            anomalies.push(Anomaly::PlayerRestarted {
                old: prev.player_pids.clone(),
                new: cur.player_pids.clone(),
            });
        }
    }

    anomalies
}

// ── SystemMonitor ────────────────────────────────────────────────

pub struct SystemMonitor {
    config: MonitorConfig,
    logger: Arc<DiagnosticLogger>,
    running: Arc<AtomicBool>,
    last: Option<HealthSnapshot>,
}

impl SystemMonitor {
    pub fn new(config: MonitorConfig, logger: Arc<DiagnosticLogger>) -> Self {
        Self {
            config,
            logger,
            running: Arc::new(AtomicBool::new(true)),
            last: None,
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// The most recent sample.
    pub fn last_snapshot(&self) -> Option<&HealthSnapshot> {
        self.last.as_ref()
    }

    /// Sample periodically until stopped.
    pub async fn run(&mut self) {
        self.logger.state("MONITOR", "system monitoring started");

        while self.running.load(Ordering::SeqCst) {
            self.tick();
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = Self::wait_for_stop(&self.running) => break,
            }
        }

        self.logger.state("MONITOR", "system monitoring stopped");
    }

    /// Take one sample, classify it, and log accordingly.
    pub fn tick(&mut self) {
        let snapshot = self.sample();
        let anomalies = classify(&self.config, self.last.as_ref(), &snapshot);

        if anomalies.is_empty() {
            self.logger.detail(
                "HEALTH",
                &format!(
                    "load {:.2}, mem {}%, player pids {:?}, drm clients {:?}, gem {:?}",
                    snapshot.load_avg,
                    snapshot.memory_used_pct,
                    snapshot.player_pids,
                    snapshot.drm_clients,
                    snapshot.gem_objects
                ),
            );
        } else {
            for anomaly in &anomalies {
                self.logger.warn("HEALTH", &anomaly.to_string());
            }
        }

        self.log_player_resources(&snapshot);
        self.log_memory_pressure();
        self.last = Some(snapshot);
    }

    /// Take a snapshot of the system right now.
    pub fn sample(&self) -> HealthSnapshot {
        HealthSnapshot {
            load_avg: self.read_load_avg(),
            memory_used_pct: self.read_memory_used_pct(),
            player_pids: self.scan_player_pids(),
            drm_clients: self.read_debugfs_count("clients"),
            gem_objects: self.read_debugfs_count("gem_names"),
            taken_at: Instant::now(),
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    fn read_load_avg(&self) -> f64 {
        std::fs::read_to_string(self.config.proc_root.join("loadavg"))
            .ok()
            .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse().ok()))
            .unwrap_or(0.0)
    }

    fn read_memory_used_pct(&self) -> u8 {
        let Ok(meminfo) = std::fs::read_to_string(self.config.proc_root.join("meminfo")) else {
            return 0;
        };
        let mut total = 0u64;
        let mut available = 0u64;
        for line in meminfo.lines() {
            if line.starts_with("MemTotal:") {
                total = extract_kb(line);
            } else if line.starts_with("MemAvailable:") {
                available = extract_kb(line);
            }
        }
        if total == 0 {
            return 0;
        }
        ((total.saturating_sub(available)) * 100 / total) as u8
    }

    /// Find the co-resident player by scanning process command lines.
    fn scan_player_pids(&self) -> BTreeSet<u32> {
        let mut pids = BTreeSet::new();
        let Ok(entries) = std::fs::read_dir(&self.config.proc_root) else {
            return pids;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let cmdline_path = entry.path().join("cmdline");
            let Ok(raw) = std::fs::read(&cmdline_path) else {
                continue;
            };
            let cmdline = String::from_utf8_lossy(&raw);
            if cmdline.contains(&self.config.player_pattern) {
                pids.insert(pid);
            }
        }
        pids
    }

    /// Parse a debugfs table, counting its non-header lines.
    fn read_debugfs_count(&self, file: &str) -> Option<usize> {
        let text = std::fs::read_to_string(self.config.dri_debugfs.join(file)).ok()?;
        Some(text.lines().count().saturating_sub(1))
    }

    /// Buffered detail for the player's own resource use.
    fn log_player_resources(&self, snapshot: &HealthSnapshot) {
        for &pid in &snapshot.player_pids {
            let proc_dir = self.config.proc_root.join(pid.to_string());

            if let Ok(status) = std::fs::read_to_string(proc_dir.join("status")) {
                for line in status.lines() {
                    if line.starts_with("VmRSS:") {
                        self.logger.detail(
                            "PLAYER",
                            &format!("pid {pid}: RSS {} MB", extract_kb(line) / 1024),
                        );
                    }
                }
            }

            if let Ok(fd_dir) = std::fs::read_dir(proc_dir.join("fd")) {
                let count = fd_dir.count();
                self.logger
                    .detail("PLAYER", &format!("pid {pid}: {count} fds"));
            }
        }
    }

    /// PSI stall figures, when the kernel exposes them.
    fn log_memory_pressure(&self) {
        let path = self.config.proc_root.join("pressure/memory");
        if let Ok(pressure) = std::fs::read_to_string(path) {
            for line in pressure.lines() {
                if line.starts_with("full") {
                    self.logger.detail("PRESSURE", line);
                }
            }
        }
    }

    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

fn extract_kb(line: &str) -> u64 {
    line.split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

// ── Tests ────────────────────────────────────────────────────────
