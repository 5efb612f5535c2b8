//! Daemon core: wires the capture loop, delivery task, and system
//! monitor together and owns the shutdown sequence.
//!
//! The capture loop is single-threaded and cooperative — a new cycle
//! never begins until the previous cycle's handles are accounted for.
//! Delivery and monitoring run as independent tasks, talking to the
//! loop only through the frame queue and the shared tracker.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};

use lumen_core::{
    CaptureEngine, ConnectionManager, DiagnosticLogger, DrmDevice, ErrorClass, FrameQueue,
    HandleKind, LumenError, MasterStatus, PixelBuffer, ResourceTracker, ScanoutSource,
    SystemMonitor,
};

use crate::config::GrabConfig;

// ── GrabService ──────────────────────────────────────────────────

/// The long-running capture service.
pub struct GrabService {
    config: GrabConfig,
    running: Arc<AtomicBool>,
}

impl GrabService {
    pub fn new(config: GrabConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Handle for stopping the service from a signal task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run until stopped or a system error occurs.
    ///
    /// On a fatal error the resource-tracker dump is written before
    /// returning, so the caller only has to print the message and set
    /// the exit code.
    pub async fn run(&self) -> Result<(), LumenError> {
        let logger = Arc::new(DiagnosticLogger::new(Path::new(
            &self.config.logging.diagnostic_log,
        ))?);
        let tracker = Arc::new(ResourceTracker::new(Arc::clone(&logger)));

        let device = match DrmDevice::select(self.config.device_path().as_deref()) {
            Ok(device) => device,
            Err(e) => {
                logger.error("INIT", &format!("device selection failed: {e}"));
                logger.flush();
                return Err(e);
            }
        };
        logger.state(
            "INIT",
            &format!(
                "device {} caps {:?} ({})",
                device.path().display(),
                device.caps(),
                match device.master() {
                    MasterStatus::Master => "master",
                    MasterStatus::Auxiliary => "auxiliary, capture-only",
                },
            ),
        );

        // Delivery task.
        let queue: Arc<FrameQueue<PixelBuffer>> =
            Arc::new(FrameQueue::new(self.config.capture.queue_capacity));
        let mut manager = ConnectionManager::new(
            self.config.to_sink_config(),
            Arc::clone(&queue),
            Arc::clone(&logger),
        );
        let manager_stop = manager.stop_handle();
        let manager_task = tokio::spawn(async move {
            manager.run().await;
            manager
        });

        // Monitor task.
        let monitor_stop = if self.config.monitor.enabled {
            let mut monitor =
                SystemMonitor::new(self.config.to_monitor_config(), Arc::clone(&logger));
            let stop = monitor.stop_handle();
            tokio::spawn(async move { monitor.run().await });
            Some(stop)
        } else {
            None
        };

        // On-demand health counters via SIGUSR1.
        self.spawn_health_reporter(Arc::clone(&tracker), Arc::clone(&logger), Arc::clone(&queue));

        let mut engine = CaptureEngine::new(
            device,
            Arc::clone(&tracker),
            Arc::clone(&logger),
            self.config.cycle_budget(),
        );

        let fatal = self.capture_loop(&mut engine, &queue, &tracker, &logger).await;

        // Shutdown: stop the tasks, sweep the tracker, flush.
        if let Some(stop) = monitor_stop {
            stop.store(false, Ordering::SeqCst);
        }
        manager_stop.store(false, Ordering::SeqCst);
        if let Ok(manager) = manager_task.await {
            let stats = manager.stats();
            logger.state(
                "SINK",
                &format!(
                    "final: {} sent, {} discarded, {} reconnections, phase {}",
                    stats.frames_sent,
                    stats.frames_discarded,
                    stats.total_reconnections,
                    stats.phase
                ),
            );
        }

        let source = engine.source_mut();
        let swept = tracker.shutdown_sweep(|kind, id| {
            // Prime fds die with the process; GEM handles need the
            // device ioctl.
            if kind == HandleKind::GemHandle {
                let _ = source.close_handle(id);
            }
        });
        if swept > 0 {
            info!("shutdown sweep closed {swept} handles");
        }

        match fatal {
            Some(e) => {
                self.write_tracker_dump(&tracker, &logger);
                logger.flush();
                Err(e)
            }
            None => {
                logger.state("SESSION", "=== capture session end ===");
                logger.flush();
                Ok(())
            }
        }
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    // ── Internal ─────────────────────────────────────────────────

    /// The single-threaded capture loop. Returns the fatal error that
    /// ended it, if any.
    async fn capture_loop(
        &self,
        engine: &mut CaptureEngine<DrmDevice>,
        queue: &Arc<FrameQueue<PixelBuffer>>,
        tracker: &Arc<ResourceTracker>,
        logger: &Arc<DiagnosticLogger>,
    ) -> Option<LumenError> {
        let frame_interval = Duration::from_secs_f64(1.0 / self.config.fps() as f64);
        let leak_policy = self.config.leak_policy();
        let check_every = self.config.tracker.check_every_cycles.max(1);

        info!(
            "capturing at {} fps, sink {}",
            self.config.fps(),
            self.config.sink.address
        );

        while self.running.load(Ordering::SeqCst) {
            let loop_start = Instant::now();

            match engine.capture_frame() {
                Ok(frame) => {
                    if queue.push(frame) {
                        logger.detail("QUEUE", "delivery lagging; dropped oldest frame");
                    }
                    logger.capture_success();
                }
                Err(e) => match e.class() {
                    ErrorClass::Recoverable => {
                        logger.detail("CAPTURE", &format!("cycle {}: {e}", engine.cycles()));
                        // Avoid a tight error loop when nothing scans out.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    ErrorClass::Resource => {
                        logger.error("CAPTURE", &format!("cycle {}: {e}", engine.cycles()));
                        // Emergency resync: surface anything stale and
                        // apply the configured policy.
                        let cycles = engine.cycles();
                        let source = engine.source_mut();
                        tracker.check_leaks(
                            cycles,
                            self.config.tracker.leak_after_cycles,
                            leak_policy,
                            |kind, id| {
                                if kind == HandleKind::GemHandle {
                                    let _ = source.close_handle(id);
                                }
                            },
                        );
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    ErrorClass::System => {
                        logger.error("CAPTURE", &format!("fatal: {e}"));
                        return Some(e);
                    }
                },
            }

            // Periodic leak check, independent of errors.
            if engine.cycles() % check_every == 0 {
                let cycles = engine.cycles();
                let source = engine.source_mut();
                tracker.check_leaks(
                    cycles,
                    self.config.tracker.leak_after_cycles,
                    leak_policy,
                    |kind, id| {
                        if kind == HandleKind::GemHandle {
                            let _ = source.close_handle(id);
                        }
                    },
                );
            }

            Self::pace(loop_start, frame_interval).await;
        }

        None
    }

    fn spawn_health_reporter(
        &self,
        tracker: Arc<ResourceTracker>,
        logger: Arc<DiagnosticLogger>,
        queue: Arc<FrameQueue<PixelBuffer>>,
    ) {
        let Ok(mut usr1) = signal(SignalKind::user_defined1()) else {
            error!("SIGUSR1 handler unavailable; on-demand health counters disabled");
            return;
        };
        tokio::spawn(async move {
            while usr1.recv().await.is_some() {
                let snap = tracker.snapshot();
                logger.state(
                    "HEALTH",
                    &format!(
                        "on-demand: {} cycles, {} handles open (oldest {:?}), queue {} deep, {} dropped",
                        logger.captures(),
                        snap.open_count,
                        snap.oldest_open_age,
                        queue.len(),
                        queue.dropped()
                    ),
                );
            }
        });
    }

    fn write_tracker_dump(&self, tracker: &ResourceTracker, logger: &DiagnosticLogger) {
        let path = &self.config.logging.dump_path;
        match std::fs::write(path, tracker.dump_json()) {
            Ok(()) => logger.state("SESSION", &format!("tracker dump written to {path}")),
            Err(e) => logger.warn("SESSION", &format!("tracker dump to {path} failed: {e}")),
        }
    }

    /// Sleep for the remainder of the frame interval.
    async fn pace(loop_start: Instant, interval: Duration) {
        let elapsed = loop_start.elapsed();
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        }
    }
}

// ── Screenshot mode ──────────────────────────────────────────────

/// Capture a single frame and write it as a PNG.
pub fn capture_screenshot(config: &GrabConfig, output: &Path) -> Result<(), LumenError> {
    let logger = Arc::new(DiagnosticLogger::new(Path::new(
        &config.logging.diagnostic_log,
    ))?);
    let tracker = Arc::new(ResourceTracker::new(Arc::clone(&logger)));

    let device = DrmDevice::select(config.device_path().as_deref())?;
    let mut engine = CaptureEngine::new(device, tracker, logger, config.cycle_budget());

    let frame = engine.capture_frame()?;
    let image = image::RgbImage::from_raw(frame.width, frame.height, frame.data)
        .ok_or_else(|| LumenError::Other("captured frame has inconsistent size".into()))?;
    image
        .save(output)
        .map_err(|e| LumenError::Other(format!("writing {}: {e}", output.display())))?;

    info!("wrote {}x{} screenshot to {}", frame.width, frame.height, output.display());
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
