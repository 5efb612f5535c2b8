//! Authoritative table of currently-open kernel handles.
//!
//! Every handle a capture cycle opens is registered here before use
//! and deregistered when closed. The table is the primary correctness
//! mechanism for kernel-side cleanup — destructors are only a
//! backstop. After every completed cycle the open count must return
//! to its pre-cycle baseline, success or failure alike.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::diag::DiagnosticLogger;
use crate::handles::HandleKind;

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct HandleRecord {
    owner_cycle: u64,
    opened_at: Instant,
}

/// Point-in-time view of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub open_count: usize,
    pub oldest_open_age: Option<Duration>,
}

/// A handle that outlived the configured cycle threshold.
#[derive(Debug, Clone)]
pub struct LeakReport {
    pub kind: HandleKind,
    pub id: u32,
    pub age: Duration,
    pub owner_cycle: u64,
}

/// What to do with handles that trip the leak threshold.
///
/// Warn-only is the default: a stale handle might still be referenced
/// by the co-resident video client, and closing it out from under that
/// client is worse than carrying the leak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeakPolicy {
    #[default]
    Warn,
    ForceClose,
}

/// Serialisable form of the open table, for the abnormal-exit dump.
#[derive(Debug, Serialize)]
struct DumpEntry {
    kind: HandleKind,
    id: u32,
    owner_cycle: u64,
    age_ms: u64,
}

// ── ResourceTracker ──────────────────────────────────────────────

/// Shared, mutex-protected handle table.
pub struct ResourceTracker {
    open: Mutex<HashMap<(HandleKind, u32), HandleRecord>>,
    logger: Arc<DiagnosticLogger>,
}

impl ResourceTracker {
    pub fn new(logger: Arc<DiagnosticLogger>) -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
            logger,
        }
    }

    /// Register a batch of handles for `cycle` atomically, before any
    /// of them is used. A crash mid-cycle then still leaves the table
    /// with an accurate record of what was open.
    pub fn track_batch(&self, cycle: u64, handles: &[(HandleKind, u32)]) {
        let Ok(mut open) = self.open.lock() else {
            return;
        };
        let now = Instant::now();
        for &(kind, id) in handles {
            open.insert(
                (kind, id),
                HandleRecord {
                    owner_cycle: cycle,
                    opened_at: now,
                },
            );
        }
        let total = open.len();
        drop(open);
        self.logger.detail(
            "TRACK",
            &format!("cycle {cycle}: +{} handles (open: {total})", handles.len()),
        );
    }

    /// Register a single handle (prime fds become known one export at
    /// a time).
    pub fn track(&self, cycle: u64, kind: HandleKind, id: u32) {
        self.track_batch(cycle, &[(kind, id)]);
    }

    /// Deregister a closed handle. Returns `false` (and warns) if the
    /// handle was not in the table, meaning bookkeeping drifted.
    pub fn untrack(&self, kind: HandleKind, id: u32) -> bool {
        let Ok(mut open) = self.open.lock() else {
            return false;
        };
        let removed = open.remove(&(kind, id)).is_some();
        let total = open.len();
        drop(open);

        if removed {
            self.logger
                .detail("TRACK", &format!("-{kind} {id} (open: {total})"));
        } else {
            self.logger
                .warn("TRACK", &format!("untrack of unknown {kind} {id}"));
        }
        removed
    }

    /// Current open count and the age of the oldest open handle.
    pub fn snapshot(&self) -> TrackerSnapshot {
        let Ok(open) = self.open.lock() else {
            return TrackerSnapshot {
                open_count: 0,
                oldest_open_age: None,
            };
        };
        TrackerSnapshot {
            open_count: open.len(),
            oldest_open_age: open.values().map(|r| r.opened_at.elapsed()).max(),
        }
    }

    /// Report handles whose owning cycle is at least
    /// `leak_after_cycles` behind `current_cycle`.
    ///
    /// With [`LeakPolicy::Warn`] the handles stay open and are only
    /// reported (id, age, owner) for forensics. With
    /// [`LeakPolicy::ForceClose`] each leak is handed to `closer` and
    /// removed from the table.
    pub fn check_leaks(
        &self,
        current_cycle: u64,
        leak_after_cycles: u64,
        policy: LeakPolicy,
        mut closer: impl FnMut(HandleKind, u32),
    ) -> Vec<LeakReport> {
        let leaks: Vec<LeakReport> = {
            let Ok(open) = self.open.lock() else {
                return Vec::new();
            };
            open.iter()
                .filter(|(_, rec)| current_cycle.saturating_sub(rec.owner_cycle) >= leak_after_cycles)
                .map(|(&(kind, id), rec)| LeakReport {
                    kind,
                    id,
                    age: rec.opened_at.elapsed(),
                    owner_cycle: rec.owner_cycle,
                })
                .collect()
        };

        for leak in &leaks {
            self.logger.warn(
                "LEAK",
                &format!(
                    "{} {} open for {:?} (owner cycle {})",
                    leak.kind, leak.id, leak.age, leak.owner_cycle
                ),
            );
            if policy == LeakPolicy::ForceClose {
                closer(leak.kind, leak.id);
                self.untrack(leak.kind, leak.id);
            }
        }
        leaks
    }

    /// Best-effort close of everything still open, for shutdown.
    /// Returns how many handles were swept.
    pub fn shutdown_sweep(&self, mut closer: impl FnMut(HandleKind, u32)) -> usize {
        let remaining: Vec<(HandleKind, u32)> = {
            let Ok(mut open) = self.open.lock() else {
                return 0;
            };
            open.drain().map(|(key, _)| key).collect()
        };

        for &(kind, id) in &remaining {
            closer(kind, id);
        }

        if remaining.is_empty() {
            self.logger.state("TRACK", "shutdown: no open handles");
        } else {
            self.logger.warn(
                "TRACK",
                &format!("shutdown: swept {} still-open handles", remaining.len()),
            );
        }
        remaining.len()
    }

    /// Serialise the open table for the abnormal-termination dump.
    pub fn dump_json(&self) -> String {
        let entries: Vec<DumpEntry> = match self.open.lock() {
            Ok(open) => open
                .iter()
                .map(|(&(kind, id), rec)| DumpEntry {
                    kind,
                    id,
                    owner_cycle: rec.owner_cycle,
                    age_ms: rec.opened_at.elapsed().as_millis() as u64,
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (ResourceTracker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let logger = Arc::new(DiagnosticLogger::new(&dir.path().join("diag.log")).unwrap());
        (ResourceTracker::new(logger), dir)
    }

    #[test]
    fn batch_then_untrack_returns_to_baseline() {
        let (t, _dir) = tracker();
        assert_eq!(t.snapshot().open_count, 0);

        t.track_batch(
            1,
            &[
                (HandleKind::GemHandle, 10),
                (HandleKind::GemHandle, 11),
                (HandleKind::PrimeFd, 5),
            ],
        );
        assert_eq!(t.snapshot().open_count, 3);

        assert!(t.untrack(HandleKind::GemHandle, 10));
        assert!(t.untrack(HandleKind::GemHandle, 11));
        assert!(t.untrack(HandleKind::PrimeFd, 5));
        assert_eq!(t.snapshot().open_count, 0);
    }

    #[test]
    fn untrack_unknown_is_flagged() {
        let (t, _dir) = tracker();
        assert!(!t.untrack(HandleKind::GemHandle, 99));
    }

    #[test]
    fn same_id_different_kind_are_distinct() {
        let (t, _dir) = tracker();
        t.track(1, HandleKind::GemHandle, 7);
        t.track(1, HandleKind::PrimeFd, 7);
        assert_eq!(t.snapshot().open_count, 2);
        assert!(t.untrack(HandleKind::PrimeFd, 7));
        assert_eq!(t.snapshot().open_count, 1);
    }

    #[test]
    fn leak_detection_warn_only_keeps_handles() {
        let (t, _dir) = tracker();
        t.track(1, HandleKind::GemHandle, 42);

        // Current cycle far ahead of the owner cycle.
        let leaks = t.check_leaks(10, 3, LeakPolicy::Warn, |_, _| {
            panic!("warn policy must not close")
        });
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].id, 42);
        assert_eq!(leaks[0].owner_cycle, 1);

        // Still open afterwards.
        assert_eq!(t.snapshot().open_count, 1);
    }

    #[test]
    fn leak_detection_respects_threshold() {
        let (t, _dir) = tracker();
        t.track(8, HandleKind::GemHandle, 1);
        let leaks = t.check_leaks(10, 3, LeakPolicy::Warn, |_, _| {});
        assert!(leaks.is_empty());
    }

    #[test]
    fn force_close_policy_sweeps_leaks() {
        let (t, _dir) = tracker();
        t.track(1, HandleKind::GemHandle, 42);

        let mut closed = Vec::new();
        let leaks = t.check_leaks(10, 3, LeakPolicy::ForceClose, |kind, id| {
            closed.push((kind, id));
        });
        assert_eq!(leaks.len(), 1);
        assert_eq!(closed, vec![(HandleKind::GemHandle, 42)]);
        assert_eq!(t.snapshot().open_count, 0);
    }

    #[test]
    fn shutdown_sweep_closes_everything() {
        let (t, _dir) = tracker();
        t.track_batch(
            3,
            &[(HandleKind::GemHandle, 1), (HandleKind::PrimeFd, 2)],
        );

        let mut closed = Vec::new();
        let swept = t.shutdown_sweep(|kind, id| closed.push((kind, id)));
        assert_eq!(swept, 2);
        assert_eq!(closed.len(), 2);
        assert_eq!(t.snapshot().open_count, 0);
    }

    #[test]
    fn dump_json_lists_open_handles() {
        let (t, _dir) = tracker();
        t.track(5, HandleKind::GemHandle, 33);
        let dump = t.dump_json();
        assert!(dump.contains("33"));
        assert!(dump.contains("GemHandle"));
    }

    #[test]
    fn oldest_open_age_tracks_the_first_handle() {
        let (t, _dir) = tracker();
        assert!(t.snapshot().oldest_open_age.is_none());
        t.track(1, HandleKind::GemHandle, 1);
        std::thread::sleep(Duration::from_millis(10));
        t.track(1, HandleKind::GemHandle, 2);
        let snap = t.snapshot();
        assert!(snap.oldest_open_age.unwrap() >= Duration::from_millis(10));
    }
}
