//! Per-cycle framebuffer capture.
//!
//! Each cycle: query the active scanout framebuffer, register every
//! returned GEM handle with the resource tracker *before* use, export
//! the backing memory as prime fds, stage the plane bytes, convert to
//! RGB, then release every handle the cycle opened — on the success
//! path and on every error path alike. Closing only part of what a
//! cycle opened is how the kernel runs out of objects and takes the
//! co-resident video client down with it.
//!
//! A framebuffer may legitimately repeat the same handle value across
//! plane slots; duplicates are exported and closed exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::diag::DiagnosticLogger;
use crate::error::LumenError;
use crate::handles::{HandleKind, PrimeFd};
use crate::pixel::{self, PixelBuffer, PixelFormat, PlaneBytes};
use crate::tracker::ResourceTracker;

// ── Scanout description ──────────────────────────────────────────

/// One plane of the active framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneDesc {
    /// GEM handle backing this plane. May repeat across planes.
    pub handle: u32,
    pub pitch: u32,
    pub offset: u32,
}

/// The framebuffer currently being scanned out.
#[derive(Debug, Clone)]
pub struct FbDescriptor {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
    /// 1–4 planes depending on the pixel format.
    pub planes: Vec<PlaneDesc>,
}

/// Device-side operations a capture cycle needs.
///
/// The real implementation wraps a DRM device; tests substitute a
/// mock to exercise the cycle and cleanup logic without hardware.
pub trait ScanoutSource {
    /// Query the active framebuffer. On success the returned GEM
    /// handles are live references owned by this process and must be
    /// closed via [`close_handle`](Self::close_handle).
    fn active_framebuffer(&mut self) -> Result<FbDescriptor, LumenError>;

    /// Export a GEM handle's backing memory as a prime fd.
    fn export_handle(&mut self, handle: u32, cycle: u64) -> Result<PrimeFd, LumenError>;

    /// Copy plane bytes from an exported buffer into `out`.
    fn read_plane(&mut self, fd: &PrimeFd, offset: u64, out: &mut [u8])
    -> Result<(), LumenError>;

    /// Close a GEM handle.
    fn close_handle(&mut self, handle: u32) -> Result<(), LumenError>;
}

// ── CaptureCycle ─────────────────────────────────────────────────

/// How a capture cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Success,
    /// The cycle failed but every opened handle was released.
    PartialFailure,
    /// Cleanup itself reported errors; tracker state may be stale.
    Fatal,
}

/// Bookkeeping for a single capture cycle. Owned exclusively by the
/// capture loop for its duration.
#[derive(Debug)]
pub struct CaptureCycle {
    pub seq: u64,
    pub started: Instant,
    pub finished: Option<Instant>,
    /// Handles this cycle opened, in open order.
    pub opened: Vec<(HandleKind, u32)>,
    pub outcome: Option<CycleOutcome>,
}

impl CaptureCycle {
    fn begin(seq: u64) -> Self {
        Self {
            seq,
            started: Instant::now(),
            finished: None,
            opened: Vec::new(),
            outcome: None,
        }
    }

    fn finish(&mut self, outcome: CycleOutcome) {
        self.finished = Some(Instant::now());
        self.outcome = Some(outcome);
    }
}

// ── Frame allocation ─────────────────────────────────────────────

/// Staging buffers reused across cycles with identical geometry.
struct FrameAlloc {
    width: u32,
    height: u32,
    fourcc: u32,
    plane_count: usize,
    plane_bufs: Vec<Vec<u8>>,
}

impl FrameAlloc {
    fn new(fb: &FbDescriptor) -> Self {
        Self {
            width: fb.width,
            height: fb.height,
            fourcc: fb.fourcc,
            plane_count: fb.planes.len(),
            plane_bufs: vec![Vec::new(); fb.planes.len()],
        }
    }

    fn compatible(&self, fb: &FbDescriptor) -> bool {
        self.width == fb.width
            && self.height == fb.height
            && self.fourcc == fb.fourcc
            && self.plane_count == fb.planes.len()
    }
}

// ── CaptureEngine ────────────────────────────────────────────────

/// Single-threaded capture engine. Exactly one cycle is in flight at
/// a time; a new cycle never begins until the previous cycle's
/// handles are fully accounted for.
pub struct CaptureEngine<S: ScanoutSource> {
    source: S,
    tracker: Arc<ResourceTracker>,
    logger: Arc<DiagnosticLogger>,
    cycle_budget: Duration,
    seq: u64,
    alloc: Option<FrameAlloc>,
    last_cycle: Option<CaptureCycle>,
}

impl<S: ScanoutSource> CaptureEngine<S> {
    pub fn new(
        source: S,
        tracker: Arc<ResourceTracker>,
        logger: Arc<DiagnosticLogger>,
        cycle_budget: Duration,
    ) -> Self {
        Self {
            source,
            tracker,
            logger,
            cycle_budget,
            seq: 0,
            alloc: None,
            last_cycle: None,
        }
    }

    /// Completed cycle count.
    pub fn cycles(&self) -> u64 {
        self.seq
    }

    /// Bookkeeping for the most recent cycle.
    pub fn last_cycle(&self) -> Option<&CaptureCycle> {
        self.last_cycle.as_ref()
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Run one capture cycle.
    pub fn capture_frame(&mut self) -> Result<PixelBuffer, LumenError> {
        self.seq += 1;
        let mut cycle = CaptureCycle::begin(self.seq);
        let baseline = self.tracker.snapshot().open_count;

        // Step 1: query. Nothing is opened until this succeeds.
        let fb = match self.source.active_framebuffer() {
            Ok(fb) => fb,
            Err(e) => {
                cycle.finish(CycleOutcome::PartialFailure);
                self.last_cycle = Some(cycle);
                return Err(e);
            }
        };

        // The query handed us live GEM handle references. Register the
        // deduplicated batch before any of them is used, so a crash
        // mid-cycle still leaves the tracker accurate.
        let unique = unique_handles(&fb.planes);
        let batch: Vec<(HandleKind, u32)> = unique
            .iter()
            .map(|&h| (HandleKind::GemHandle, h))
            .collect();
        self.tracker.track_batch(cycle.seq, &batch);
        cycle.opened.extend_from_slice(&batch);

        let mut fds: Vec<PrimeFd> = Vec::with_capacity(unique.len());
        let result = self.stage_and_convert(&fb, &unique, &mut fds, &mut cycle);

        // Steps 5/6: release everything this cycle opened, regardless
        // of how far it got.
        let close_errors = self.release_cycle(&unique, &mut fds);

        let outcome = match (&result, close_errors) {
            (Ok(_), 0) => CycleOutcome::Success,
            (_, 0) => CycleOutcome::PartialFailure,
            _ => CycleOutcome::Fatal,
        };
        cycle.finish(outcome);

        let open_now = self.tracker.snapshot().open_count;
        if open_now != baseline {
            self.logger.warn(
                "CYCLE",
                &format!(
                    "cycle {}: open handles {} != baseline {}",
                    cycle.seq, open_now, baseline
                ),
            );
        }
        self.logger.detail(
            "CYCLE",
            &format!(
                "cycle {} {:?} ({} handles, {:?})",
                cycle.seq,
                outcome,
                cycle.opened.len(),
                cycle.started.elapsed()
            ),
        );
        self.last_cycle = Some(cycle);
        result
    }

    // ── Internal ─────────────────────────────────────────────────

    fn stage_and_convert(
        &mut self,
        fb: &FbDescriptor,
        unique: &[u32],
        fds: &mut Vec<PrimeFd>,
        cycle: &mut CaptureCycle,
    ) -> Result<PixelBuffer, LumenError> {
        let format =
            PixelFormat::from_fourcc(fb.fourcc).ok_or(LumenError::DecodeUnsupported(fb.fourcc))?;

        // Step 1 (cont.): reuse the previous allocation when the
        // geometry matches; a mode switch just reallocates.
        let mut alloc = match self.alloc.take() {
            Some(a) if a.compatible(fb) => a,
            prev => {
                if let Some(prev) = prev {
                    self.logger.state(
                        "CAPTURE",
                        &format!(
                            "geometry change {}x{} ({} planes) -> {}x{} ({} planes)",
                            prev.width,
                            prev.height,
                            prev.plane_count,
                            fb.width,
                            fb.height,
                            fb.planes.len()
                        ),
                    );
                }
                FrameAlloc::new(fb)
            }
        };

        self.check_budget(cycle)?;

        // Step 2/3: export each unique handle, tracking each fd as it
        // appears.
        let mut fd_index: HashMap<u32, usize> = HashMap::with_capacity(unique.len());
        for &handle in unique {
            let fd = self.source.export_handle(handle, cycle.seq)?;
            let raw = fd.raw() as u32;
            self.tracker.track(cycle.seq, HandleKind::PrimeFd, raw);
            cycle.opened.push((HandleKind::PrimeFd, raw));
            fd_index.insert(handle, fds.len());
            fds.push(fd);
            self.check_budget(cycle)?;
        }

        // Step 4: stage plane bytes.
        for (i, plane) in fb.planes.iter().enumerate() {
            let len = format.plane_len(i, plane.pitch, fb.height);
            let buf = &mut alloc.plane_bufs[i];
            buf.resize(len, 0);

            let fd = &fds[fd_index[&plane.handle]];
            self.source.read_plane(fd, plane.offset as u64, buf)?;
            self.check_budget(cycle)?;
        }

        let plane_refs: Vec<PlaneBytes<'_>> = fb
            .planes
            .iter()
            .enumerate()
            .map(|(i, plane)| PlaneBytes {
                data: &alloc.plane_bufs[i],
                pitch: plane.pitch,
            })
            .collect();

        let mut data = Vec::new();
        pixel::convert_to_rgb(format, fb.width, fb.height, &plane_refs, &mut data)?;
        drop(plane_refs);

        let frame = PixelBuffer {
            seq: cycle.seq,
            width: fb.width,
            height: fb.height,
            data,
            captured_at: cycle.started,
        };
        self.alloc = Some(alloc);
        Ok(frame)
    }

    /// Close and untrack every fd and handle the cycle opened.
    fn release_cycle(&mut self, unique: &[u32], fds: &mut Vec<PrimeFd>) -> usize {
        let mut errors = 0;

        for fd in fds.iter_mut() {
            let raw = fd.raw() as u32;
            fd.close();
            self.tracker.untrack(HandleKind::PrimeFd, raw);
        }
        fds.clear();

        for &handle in unique {
            if let Err(e) = self.source.close_handle(handle) {
                errors += 1;
                self.logger
                    .error("CYCLE", &format!("closing GEM handle {handle}: {e}"));
            }
            self.tracker.untrack(HandleKind::GemHandle, handle);
        }
        errors
    }

    fn check_budget(&self, cycle: &CaptureCycle) -> Result<(), LumenError> {
        if cycle.started.elapsed() > self.cycle_budget {
            return Err(LumenError::CaptureTimeout(self.cycle_budget));
        }
        Ok(())
    }
}

/// Deduplicate plane handles, preserving first-seen order.
fn unique_handles(planes: &[PlaneDesc]) -> Vec<u32> {
    let mut seen = Vec::with_capacity(planes.len());
    for plane in planes {
        if !seen.contains(&plane.handle) {
            seen.push(plane.handle);
        }
    }
    seen
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Scriptable scanout device.
    struct MockScanout {
        /// Descriptors returned by successive queries.
        frames: Vec<FbDescriptor>,
        query_count: usize,
        /// Export calls per handle.
        exports: HashMap<u32, u32>,
        /// Close calls per handle.
        closes: HashMap<u32, u32>,
        /// Fail the nth export (1-based), once.
        fail_export_at: Option<usize>,
        export_count: usize,
        /// Byte written into every staged plane.
        fill: u8,
    }

    impl MockScanout {
        fn new(frames: Vec<FbDescriptor>) -> Self {
            Self {
                frames,
                query_count: 0,
                exports: HashMap::new(),
                closes: HashMap::new(),
                fail_export_at: None,
                export_count: 0,
                fill: 0x80,
            }
        }

        fn xrgb_frame(width: u32, height: u32, handles: &[u32]) -> FbDescriptor {
            FbDescriptor {
                fb_id: 1,
                width,
                height,
                fourcc: PixelFormat::Xrgb8888.fourcc(),
                planes: handles
                    .iter()
                    .map(|&handle| PlaneDesc {
                        handle,
                        pitch: width * 4,
                        offset: 0,
                    })
                    .collect(),
            }
        }

        fn nv12_frame(width: u32, height: u32, handles: [u32; 2]) -> FbDescriptor {
            FbDescriptor {
                fb_id: 2,
                width,
                height,
                fourcc: PixelFormat::Nv12.fourcc(),
                planes: vec![
                    PlaneDesc {
                        handle: handles[0],
                        pitch: width,
                        offset: 0,
                    },
                    PlaneDesc {
                        handle: handles[1],
                        pitch: width,
                        offset: width * height,
                    },
                ],
            }
        }
    }

    impl ScanoutSource for MockScanout {
        fn active_framebuffer(&mut self) -> Result<FbDescriptor, LumenError> {
            if self.frames.is_empty() {
                return Err(LumenError::NoFramebuffer);
            }
            let idx = self.query_count.min(self.frames.len() - 1);
            self.query_count += 1;
            Ok(self.frames[idx].clone())
        }

        fn export_handle(&mut self, handle: u32, cycle: u64) -> Result<PrimeFd, LumenError> {
            self.export_count += 1;
            if self.fail_export_at == Some(self.export_count) {
                return Err(LumenError::HandleExport {
                    handle,
                    source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
                });
            }
            *self.exports.entry(handle).or_default() += 1;
            Ok(PrimeFd::new(tempfile::tempfile().unwrap(), cycle))
        }

        fn read_plane(
            &mut self,
            _fd: &PrimeFd,
            _offset: u64,
            out: &mut [u8],
        ) -> Result<(), LumenError> {
            out.fill(self.fill);
            Ok(())
        }

        fn close_handle(&mut self, handle: u32) -> Result<(), LumenError> {
            *self.closes.entry(handle).or_default() += 1;
            Ok(())
        }
    }

    fn engine(mock: MockScanout) -> (CaptureEngine<MockScanout>, Arc<ResourceTracker>, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().unwrap();
        let logger = Arc::new(DiagnosticLogger::new(&dir.path().join("diag.log")).unwrap());
        let tracker = Arc::new(ResourceTracker::new(Arc::clone(&logger)));
        let engine = CaptureEngine::new(
            mock,
            Arc::clone(&tracker),
            logger,
            Duration::from_secs(5),
        );
        (engine, tracker, dir)
    }

    #[test]
    fn successful_cycle_returns_to_baseline() {
        let mock = MockScanout::new(vec![MockScanout::xrgb_frame(4, 2, &[10])]);
        let (mut engine, tracker, _dir) = engine(mock);

        let frame = engine.capture_frame().unwrap();
        assert_eq!(frame.width, 4);
        assert_eq!(frame.height, 2);
        assert_eq!(frame.data.len(), 4 * 2 * 3);

        assert_eq!(tracker.snapshot().open_count, 0);
        assert_eq!(
            engine.last_cycle().unwrap().outcome,
            Some(CycleOutcome::Success)
        );
        assert_eq!(engine.source_mut().closes[&10], 1);
    }

    #[test]
    fn repeated_handle_closed_exactly_once() {
        // NV12 with both planes backed by the same GEM handle.
        let mock = MockScanout::new(vec![MockScanout::nv12_frame(4, 4, [7, 7])]);
        let (mut engine, tracker, _dir) = engine(mock);

        engine.capture_frame().unwrap();

        assert_eq!(tracker.snapshot().open_count, 0);
        let source = engine.source_mut();
        assert_eq!(source.exports[&7], 1, "duplicate handle exported once");
        assert_eq!(source.closes[&7], 1, "duplicate handle closed once");
    }

    #[test]
    fn export_failure_still_releases_everything() {
        let mut mock = MockScanout::new(vec![MockScanout::nv12_frame(4, 4, [20, 21])]);
        mock.fail_export_at = Some(2);
        let (mut engine, tracker, _dir) = engine(mock);

        let err = engine.capture_frame().unwrap_err();
        assert!(matches!(err, LumenError::HandleExport { handle: 21, .. }));

        // Both GEM handles and the one successful fd must be released.
        assert_eq!(tracker.snapshot().open_count, 0);
        let cycle = engine.last_cycle().unwrap();
        assert_eq!(cycle.outcome, Some(CycleOutcome::PartialFailure));
        let source = engine.source_mut();
        assert_eq!(source.closes[&20], 1);
        assert_eq!(source.closes[&21], 1);
    }

    #[test]
    fn unsupported_format_still_releases_handles() {
        let mut fb = MockScanout::xrgb_frame(2, 2, &[5]);
        fb.fourcc = 0xdead_beef;
        let mock = MockScanout::new(vec![fb]);
        let (mut engine, tracker, _dir) = engine(mock);

        let err = engine.capture_frame().unwrap_err();
        assert!(matches!(err, LumenError::DecodeUnsupported(0xdead_beef)));
        assert_eq!(tracker.snapshot().open_count, 0);
        assert_eq!(engine.source_mut().closes[&5], 1);
    }

    #[test]
    fn plane_count_change_reallocates_without_error() {
        // Cycle 1: single-plane XRGB. Cycle 2: two-plane NV12 at a
        // different resolution. Cycle 3: NV12 again (reuse).
        let mock = MockScanout::new(vec![
            MockScanout::xrgb_frame(4, 2, &[1]),
            MockScanout::nv12_frame(8, 4, [2, 3]),
            MockScanout::nv12_frame(8, 4, [2, 3]),
        ]);
        let (mut engine, tracker, _dir) = engine(mock);

        let a = engine.capture_frame().unwrap();
        assert_eq!((a.width, a.height), (4, 2));
        assert_eq!(tracker.snapshot().open_count, 0);

        let b = engine.capture_frame().unwrap();
        assert_eq!((b.width, b.height), (8, 4));
        assert_eq!(tracker.snapshot().open_count, 0);

        let c = engine.capture_frame().unwrap();
        assert_eq!((c.width, c.height), (8, 4));
        assert_eq!(tracker.snapshot().open_count, 0);
        assert_eq!(engine.cycles(), 3);
    }

    #[test]
    fn budget_exhaustion_releases_handles() {
        let mock = MockScanout::new(vec![MockScanout::xrgb_frame(4, 2, &[9])]);
        let (mut engine, tracker, _dir) = engine(mock);
        engine.cycle_budget = Duration::ZERO;

        let err = engine.capture_frame().unwrap_err();
        assert!(matches!(err, LumenError::CaptureTimeout(_)));
        assert_eq!(tracker.snapshot().open_count, 0);
        assert_eq!(engine.source_mut().closes[&9], 1);
    }

    #[test]
    fn query_failure_opens_nothing() {
        let mock = MockScanout::new(Vec::new());
        let (mut engine, tracker, _dir) = engine(mock);

        let err = engine.capture_frame().unwrap_err();
        assert!(matches!(err, LumenError::NoFramebuffer));
        assert_eq!(tracker.snapshot().open_count, 0);
        assert!(engine.last_cycle().unwrap().opened.is_empty());
    }

    #[test]
    fn sequence_increases_across_failures() {
        let mock = MockScanout::new(Vec::new());
        let (mut engine, _tracker, _dir) = engine(mock);
        let _ = engine.capture_frame();
        let _ = engine.capture_frame();
        assert_eq!(engine.cycles(), 2);
    }
}
