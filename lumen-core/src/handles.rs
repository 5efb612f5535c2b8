//! Kernel-scoped buffer identifiers.
//!
//! GEM handles and prime fds are allocated by the kernel on every
//! capture cycle and are never reclaimed automatically — each one must
//! be closed explicitly, on every path out of the cycle. The `Drop`
//! impls here are a last-resort backstop only; the capture engine and
//! resource tracker own the real cleanup.

use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};

/// Which kernel namespace a tracked identifier lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum HandleKind {
    /// dma-buf file descriptor obtained via prime export.
    PrimeFd,
    /// Process-local GEM object handle.
    GemHandle,
}

impl std::fmt::Display for HandleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrimeFd => write!(f, "prime fd"),
            Self::GemHandle => write!(f, "GEM handle"),
        }
    }
}

// ── PrimeFd ──────────────────────────────────────────────────────

/// An exported dma-buf fd, tagged with the capture cycle that opened it.
#[derive(Debug)]
pub struct PrimeFd {
    file: Option<File>,
    raw: RawFd,
    cycle: u64,
}

impl PrimeFd {
    /// Wrap a freshly exported fd, owned by capture cycle `cycle`.
    pub fn new(file: File, cycle: u64) -> Self {
        let raw = file.as_raw_fd();
        Self {
            file: Some(file),
            raw,
            cycle,
        }
    }

    /// The raw descriptor value (for tracking and diagnostics).
    pub fn raw(&self) -> RawFd {
        self.raw
    }

    /// The capture cycle that opened this fd.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Borrow the underlying file for mapping. `None` once closed.
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    /// Close the descriptor. Idempotent; a second call is a no-op.
    pub fn close(&mut self) {
        self.file.take();
    }
}

impl Drop for PrimeFd {
    fn drop(&mut self) {
        if self.file.is_some() {
            // Explicit close was skipped somewhere; the fd still gets
            // closed by File's own drop, but that path is not tracked.
            tracing::warn!(
                fd = self.raw,
                cycle = self.cycle,
                "prime fd dropped while still open"
            );
        }
    }
}

// ── GemHandle ────────────────────────────────────────────────────

/// A GEM object handle returned by a framebuffer query.
///
/// Unlike [`PrimeFd`], closing requires the owning device fd, so
/// `Drop` cannot release it and only flags the omission.
#[derive(Debug)]
pub struct GemHandle {
    raw: u32,
    cycle: u64,
    closed: bool,
}

impl GemHandle {
    pub fn new(raw: u32, cycle: u64) -> Self {
        Self {
            raw,
            cycle,
            closed: false,
        }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Mark the handle closed after the device ioctl succeeded.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }
}

impl Drop for GemHandle {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(
                handle = self.raw,
                cycle = self.cycle,
                "GEM handle dropped without being closed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prime_fd_close_is_idempotent() {
        let file = tempfile::tempfile().unwrap();
        let mut fd = PrimeFd::new(file, 1);
        assert!(fd.is_open());
        fd.close();
        assert!(!fd.is_open());
        fd.close();
        assert!(!fd.is_open());
    }

    #[test]
    fn gem_handle_lifecycle() {
        let mut h = GemHandle::new(42, 7);
        assert!(h.is_open());
        assert_eq!(h.raw(), 42);
        assert_eq!(h.cycle(), 7);
        h.mark_closed();
        assert!(!h.is_open());
    }
}
