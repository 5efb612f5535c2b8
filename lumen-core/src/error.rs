//! Domain-specific error types for the capture engine.
//!
//! All fallible operations return `Result<T, LumenError>`.
//! Every error carries a severity class that drives the recovery
//! policy: recoverable errors are retried, resource errors trigger a
//! tracker resync, system errors are fatal.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the capture pipeline.
#[derive(Debug, Error)]
pub enum LumenError {
    // ── Device Errors ────────────────────────────────────────────
    /// The requested DRM device node does not exist or cannot be opened.
    #[error("DRM device not found: {0}")]
    DeviceNotFound(PathBuf),

    /// The kernel refused access to the device.
    #[error("DRM device access refused: {0}")]
    AuthFailed(String),

    /// The device lacks a capability the capture pipeline requires.
    #[error("DRM capability missing: {0}")]
    CapabilityMissing(&'static str),

    // ── Capture Errors ───────────────────────────────────────────
    /// The device is temporarily busy (another client holds it).
    #[error("DRM device busy")]
    Busy,

    /// No CRTC or plane currently scans out a framebuffer.
    #[error("no active framebuffer")]
    NoFramebuffer,

    /// The scanout pixel format has no decoder.
    #[error("unsupported pixel format: {0:#010x}")]
    DecodeUnsupported(u32),

    /// The capture cycle exceeded its time budget.
    #[error("capture timed out after {0:?}")]
    CaptureTimeout(Duration),

    // ── Resource Errors ──────────────────────────────────────────
    /// Exporting a buffer handle to a prime fd failed.
    #[error("prime export of handle {handle} failed: {source}")]
    HandleExport {
        handle: u32,
        source: std::io::Error,
    },

    /// Mapping an exported buffer into memory failed.
    #[error("plane mapping failed: {0}")]
    PlaneMap(std::io::Error),

    /// The open-handle table exceeded the configured leak threshold.
    #[error("leak threshold exceeded: {open} handles open")]
    LeakThreshold { open: usize },

    // ── Delivery Errors ──────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A send did not complete within the configured deadline.
    #[error("sink send timed out after {0:?}")]
    SendTimeout(Duration),

    /// The frame channel between capture and delivery was closed.
    #[error("frame channel closed")]
    ChannelClosed,

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Severity classification ──────────────────────────────────────

/// Recovery policy class for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried transparently; never surfaced beyond a log line.
    Recoverable,
    /// Triggers an emergency tracker resync; capture continues.
    Resource,
    /// Fatal: diagnostics flushed, process exits.
    System,
}

impl LumenError {
    /// The recovery class this error belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::DeviceNotFound(_) | Self::AuthFailed(_) | Self::CapabilityMissing(_) => {
                ErrorClass::System
            }
            Self::HandleExport { .. } | Self::PlaneMap(_) | Self::LeakThreshold { .. } => {
                ErrorClass::Resource
            }
            _ => ErrorClass::Recoverable,
        }
    }
}

impl From<String> for LumenError {
    fn from(s: String) -> Self {
        LumenError::Other(s)
    }
}

impl From<&str> for LumenError {
    fn from(s: &str) -> Self {
        LumenError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let e = LumenError::DecodeUnsupported(0x3231_564e);
        assert!(e.to_string().contains("0x3231564e"));

        let e = LumenError::LeakThreshold { open: 7 };
        assert!(e.to_string().contains('7'));
    }

    #[test]
    fn severity_classes() {
        assert_eq!(
            LumenError::DeviceNotFound(PathBuf::from("/dev/dri/card9")).class(),
            ErrorClass::System
        );
        assert_eq!(
            LumenError::HandleExport {
                handle: 3,
                source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
            }
            .class(),
            ErrorClass::Resource
        );
        assert_eq!(
            LumenError::CaptureTimeout(Duration::from_millis(50)).class(),
            ErrorClass::Recoverable
        );
        assert_eq!(LumenError::Busy.class(), ErrorClass::Recoverable);
    }

    #[test]
    fn from_string() {
        let e: LumenError = "something broke".into();
        assert!(matches!(e, LumenError::Other(_)));
    }
}
