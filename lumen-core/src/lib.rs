//! # lumen-core
//!
//! Core library for the lumen ambient-light capture engine.
//!
//! This crate contains:
//! - **Device**: `DrmDevice` — selection and validation of the DRM
//!   capture node, and the real `ScanoutSource`
//! - **Capture**: `CaptureEngine` — per-cycle framebuffer export,
//!   staging, RGB conversion, and handle cleanup
//! - **Tracker**: `ResourceTracker` — authoritative open-handle table
//! - **Queue**: `FrameQueue` — bounded drop-oldest frame hand-off
//! - **Link / Sink**: `LinkState` + `ConnectionManager` — delivery to
//!   the lighting controller with retry, backoff, and fallback
//! - **Diag**: `DiagnosticLogger` — tiered file-backed event recorder
//! - **Monitor**: `SystemMonitor` — co-resident player and kernel
//!   resource observation
//! - **Error**: `LumenError` — typed, `thiserror`-based hierarchy

pub mod capture;
pub mod device;
pub mod diag;
pub mod error;
pub mod handles;
pub mod link;
pub mod monitor;
pub mod pixel;
pub mod queue;
pub mod sink;
pub mod tracker;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use capture::{CaptureCycle, CaptureEngine, CycleOutcome, FbDescriptor, PlaneDesc, ScanoutSource};
pub use device::{DEFAULT_DEVICE, DeviceCaps, DrmDevice, MasterStatus};
pub use diag::{DiagnosticEvent, DiagnosticLogger};
pub use error::{ErrorClass, LumenError};
pub use handles::{GemHandle, HandleKind, PrimeFd};
pub use link::{FailureOutcome, LinkConfig, LinkPhase, LinkState};
pub use monitor::{Anomaly, HealthSnapshot, MonitorConfig, SystemMonitor};
pub use pixel::{PixelBuffer, PixelFormat};
pub use queue::FrameQueue;
pub use sink::{ConnectionManager, ConnectionStats, SinkConfig};
pub use tracker::{LeakPolicy, LeakReport, ResourceTracker, TrackerSnapshot};
