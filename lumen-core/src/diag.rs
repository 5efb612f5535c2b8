//! Tiered diagnostic event recorder.
//!
//! Two write paths:
//!
//! - **immediate** — synchronously appended and flushed to the log
//!   file; used for error/warning events and state transitions, and
//!   mirrored to `tracing` so the console stays informative.
//! - **buffered** — held in a fixed-size ring of the most recent
//!   entries; the ring is persisted when an immediate error fires
//!   (trailing context) or when the periodic summary runs.
//!
//! Routine per-cycle successes are never logged individually: they are
//! counted and folded into a once-per-minute summary line.
//!
//! Log line format:
//! ```text
//! [<unix_millis>] +<elapsed>ms [<CATEGORY>] <message>
//! ```

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Default ring capacity (most recent buffered events kept).
pub const DEFAULT_RING_CAPACITY: usize = 100;

/// Summary cadence.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

/// Milestone cadence in completed cycles.
const MILESTONE_EVERY: u64 = 500;

// ── DiagnosticEvent ──────────────────────────────────────────────

/// A single recorded event. Immutable once created.
#[derive(Debug, Clone)]
pub struct DiagnosticEvent {
    pub timestamp_ms: u64,
    pub elapsed_ms: u64,
    pub category: String,
    pub message: String,
    /// Whether this event took the immediate path.
    pub immediate: bool,
}

impl DiagnosticEvent {
    fn render(&self) -> String {
        format!(
            "[{}] +{}ms [{}] {}",
            self.timestamp_ms, self.elapsed_ms, self.category, self.message
        )
    }
}

// ── DiagnosticLogger ─────────────────────────────────────────────

/// Concurrency-safe append-only recorder shared by all components.
///
/// Internally mutexed; the buffered path takes a single short lock so
/// the capture hot path stays cheap.
pub struct DiagnosticLogger {
    writer: Mutex<BufWriter<File>>,
    ring: Mutex<VecDeque<DiagnosticEvent>>,
    ring_capacity: usize,
    started: Instant,
    captures: AtomicU64,
    last_summary: Mutex<Instant>,
}

impl DiagnosticLogger {
    /// Open (append) the diagnostic log at `path`.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        Self::with_ring_capacity(path, DEFAULT_RING_CAPACITY)
    }

    pub fn with_ring_capacity(path: &Path, ring_capacity: usize) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let logger = Self {
            writer: Mutex::new(BufWriter::new(file)),
            ring: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity,
            started: Instant::now(),
            captures: AtomicU64::new(0),
            last_summary: Mutex::new(Instant::now()),
        };

        logger.state("SESSION", "=== capture session start ===");
        logger.state("SESSION", &format!("pid {}", std::process::id()));
        Ok(logger)
    }

    // ── Immediate path ───────────────────────────────────────────

    /// Error event: persisted immediately, then the buffered ring is
    /// persisted alongside it as trailing context.
    pub fn error(&self, category: &str, message: &str) {
        tracing::error!(target: "lumen::diag", "[{category}] {message}");
        self.write_immediate(category, message);
        self.dump_ring("recent events before error");
    }

    pub fn warn(&self, category: &str, message: &str) {
        tracing::warn!(target: "lumen::diag", "[{category}] {message}");
        self.write_immediate(category, message);
    }

    /// State transitions and other notable-but-healthy events.
    pub fn state(&self, category: &str, message: &str) {
        tracing::info!(target: "lumen::diag", "[{category}] {message}");
        self.write_immediate(category, message);
    }

    // ── Buffered path ────────────────────────────────────────────

    /// Routine event: held in the ring, persisted later in bulk.
    pub fn detail(&self, category: &str, message: &str) {
        let event = self.make_event(category, message, false);
        if let Ok(mut ring) = self.ring.lock() {
            if ring.len() >= self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(event);
        }
    }

    // ── Counters and summaries ───────────────────────────────────

    /// Count one successful capture cycle; emits milestone and summary
    /// lines at their cadences instead of logging the cycle itself.
    pub fn capture_success(&self) {
        let count = self.captures.fetch_add(1, Ordering::Relaxed) + 1;
        if count % MILESTONE_EVERY == 0 {
            self.state("MILESTONE", &format!("{count} cycles completed"));
        }
        self.maybe_summary();
    }

    /// Completed capture cycles so far.
    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::Relaxed)
    }

    /// Emit the periodic summary if the interval elapsed. Also
    /// persists the current ring so buffered events eventually land on
    /// disk even without an error.
    pub fn maybe_summary(&self) {
        let due = {
            let Ok(mut last) = self.last_summary.lock() else {
                return;
            };
            if last.elapsed() >= SUMMARY_INTERVAL {
                *last = Instant::now();
                true
            } else {
                false
            }
        };

        if due {
            let mins = self.started.elapsed().as_secs() / 60;
            let captures = self.captures();
            self.dump_ring("periodic flush");
            self.state(
                "SUMMARY",
                &format!("running for {mins} min, {captures} cycles completed"),
            );
        }
    }

    /// Flush any pending writes to disk.
    pub fn flush(&self) {
        self.dump_ring("shutdown flush");
        if let Ok(mut w) = self.writer.lock() {
            let _ = w.flush();
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    fn make_event(&self, category: &str, message: &str, immediate: bool) -> DiagnosticEvent {
        DiagnosticEvent {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            category: category.to_string(),
            message: message.to_string(),
            immediate,
        }
    }

    fn write_immediate(&self, category: &str, message: &str) {
        let event = self.make_event(category, message, true);
        if let Ok(mut w) = self.writer.lock() {
            let _ = writeln!(w, "{}", event.render());
            let _ = w.flush();
        }
    }

    /// Persist and drain the ring as one context block.
    fn dump_ring(&self, label: &str) {
        let drained: Vec<DiagnosticEvent> = match self.ring.lock() {
            Ok(mut ring) => ring.drain(..).collect(),
            Err(_) => return,
        };
        if drained.is_empty() {
            return;
        }
        if let Ok(mut w) = self.writer.lock() {
            let _ = writeln!(w, "--- {label} ({} entries) ---", drained.len());
            for event in &drained {
                let _ = writeln!(w, "{}", event.render());
            }
            let _ = writeln!(w, "--- end ---");
            let _ = w.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger_in(dir: &tempfile::TempDir) -> (DiagnosticLogger, std::path::PathBuf) {
        let path = dir.path().join("diag.log");
        (DiagnosticLogger::new(&path).unwrap(), path)
    }

    #[test]
    fn immediate_events_hit_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, path) = logger_in(&dir);

        logger.warn("TEST", "something odd");
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[TEST] something odd"));
    }

    #[test]
    fn error_persists_ring_context() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, path) = logger_in(&dir);

        logger.detail("CYCLE", "frame 1 ok");
        logger.detail("CYCLE", "frame 2 ok");

        // Buffered entries must not be on disk yet.
        let before = std::fs::read_to_string(&path).unwrap();
        assert!(!before.contains("frame 1 ok"));

        logger.error("CAPTURE", "export failed");

        let after = std::fs::read_to_string(&path).unwrap();
        assert!(after.contains("export failed"));
        assert!(after.contains("frame 1 ok"));
        assert!(after.contains("frame 2 ok"));
        assert!(after.contains("recent events before error"));
    }

    #[test]
    fn ring_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        let logger = DiagnosticLogger::with_ring_capacity(&path, 3).unwrap();

        for i in 0..10 {
            logger.detail("CYCLE", &format!("event {i}"));
        }
        logger.error("TEST", "boom");

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("event 6"));
        assert!(text.contains("event 7"));
        assert!(text.contains("event 9"));
    }

    #[test]
    fn ring_drained_after_dump() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, path) = logger_in(&dir);

        logger.detail("CYCLE", "only once");
        logger.error("TEST", "first");
        logger.error("TEST", "second");

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("only once").count(), 1);
    }

    #[test]
    fn capture_counter_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, _path) = logger_in(&dir);

        for _ in 0..42 {
            logger.capture_success();
        }
        assert_eq!(logger.captures(), 42);
    }

    #[test]
    fn concurrent_buffered_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.log");
        let logger = std::sync::Arc::new(DiagnosticLogger::new(&path).unwrap());

        let mut handles = Vec::new();
        for t in 0..4 {
            let logger = std::sync::Arc::clone(&logger);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    logger.detail("CYCLE", &format!("t{t} e{i}"));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        logger.error("TEST", "dump now");
        let text = std::fs::read_to_string(&path).unwrap();
        // The ring holds the most recent entries; the dump must contain
        // exactly one context block with at most the ring capacity.
        assert!(text.contains("dump now"));
        assert!(text.matches("--- end ---").count() >= 1);
    }
}
