//! Integration tests — the capture → queue → delivery pipeline over a
//! real TCP connection on localhost, with a scripted scanout device.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use lumen_core::{
    CaptureEngine, ConnectionManager, DiagnosticLogger, FbDescriptor, FrameQueue, LumenError,
    PixelBuffer, PixelFormat, PlaneDesc, PrimeFd, ResourceTracker, ScanoutSource, SinkConfig,
};

// ── Helpers ──────────────────────────────────────────────────────

/// Minimal scanout device producing a constant 4x2 XRGB frame.
struct FixedScanout {
    handle: u32,
}

impl ScanoutSource for FixedScanout {
    fn active_framebuffer(&mut self) -> Result<FbDescriptor, LumenError> {
        Ok(FbDescriptor {
            fb_id: 1,
            width: 4,
            height: 2,
            fourcc: PixelFormat::Xrgb8888.fourcc(),
            planes: vec![PlaneDesc {
                handle: self.handle,
                pitch: 16,
                offset: 0,
            }],
        })
    }

    fn export_handle(&mut self, _handle: u32, cycle: u64) -> Result<PrimeFd, LumenError> {
        Ok(PrimeFd::new(tempfile::tempfile().unwrap(), cycle))
    }

    fn read_plane(
        &mut self,
        _fd: &PrimeFd,
        _offset: u64,
        out: &mut [u8],
    ) -> Result<(), LumenError> {
        out.fill(0x55);
        Ok(())
    }

    fn close_handle(&mut self, _handle: u32) -> Result<(), LumenError> {
        Ok(())
    }
}

fn pipeline(
    dir: &tempfile::TempDir,
) -> (
    CaptureEngine<FixedScanout>,
    Arc<ResourceTracker>,
    Arc<DiagnosticLogger>,
    std::path::PathBuf,
) {
    let log_path = dir.path().join("diag.log");
    let logger = Arc::new(DiagnosticLogger::new(&log_path).unwrap());
    let tracker = Arc::new(ResourceTracker::new(Arc::clone(&logger)));
    let engine = CaptureEngine::new(
        FixedScanout { handle: 77 },
        Arc::clone(&tracker),
        Arc::clone(&logger),
        Duration::from_secs(5),
    );
    (engine, tracker, logger, log_path)
}

async fn read_message(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

fn sink_config(address: String, max_retries: u32) -> SinkConfig {
    SinkConfig {
        address,
        max_retries,
        connect_timeout: Duration::from_millis(500),
        send_timeout: Duration::from_millis(500),
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        probe_interval: Duration::from_millis(20),
        ..SinkConfig::default()
    }
}

// ── End-to-end delivery ──────────────────────────────────────────

#[tokio::test]
async fn captured_frames_reach_the_sink() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, tracker, logger, _log) = pipeline(&dir);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let queue: Arc<FrameQueue<PixelBuffer>> = Arc::new(FrameQueue::new(4));
    let mut manager =
        ConnectionManager::new(sink_config(addr.to_string(), 3), Arc::clone(&queue), logger);
    let stop = manager.stop_handle();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let register = read_message(&mut stream).await;
        let mut frames = Vec::new();
        for _ in 0..3 {
            frames.push(read_message(&mut stream).await);
        }
        (register, frames)
    });

    let runner = tokio::spawn(async move {
        manager.run().await;
    });

    // Capture three cycles; the tracker must be clean after each.
    for _ in 0..3 {
        let frame = engine.capture_frame().unwrap();
        assert_eq!(tracker.snapshot().open_count, 0);
        queue.push(frame);
    }

    let (register, frames) = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(register[0], 0x01);
    assert_eq!(frames.len(), 3);
    for frame in &frames {
        assert_eq!(frame[0], 0x02);
        assert_eq!(u32::from_le_bytes(frame[1..5].try_into().unwrap()), 4);
        assert_eq!(u32::from_le_bytes(frame[5..9].try_into().unwrap()), 2);
        // 4x2 RGB payload.
        assert_eq!(frame.len(), 9 + 4 * 2 * 3);
    }

    stop.store(false, std::sync::atomic::Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap();
}

// ── Fallback under an unreachable sink ───────────────────────────

#[tokio::test]
async fn unreachable_sink_does_not_stall_capture() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, tracker, logger, log_path) = pipeline(&dir);

    // A port with nothing listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let queue: Arc<FrameQueue<PixelBuffer>> = Arc::new(FrameQueue::new(2));
    let mut manager =
        ConnectionManager::new(sink_config(addr.to_string(), 2), Arc::clone(&queue), logger);
    let stop = manager.stop_handle();

    let runner = tokio::spawn(async move {
        manager.run().await;
        manager
    });

    // Ten capture cycles while the sink is down. Capture must keep
    // producing frames and returning handles regardless.
    for _ in 0..10 {
        let frame = engine.capture_frame().unwrap();
        assert_eq!(tracker.snapshot().open_count, 0);
        queue.push(frame);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(engine.cycles(), 10);

    stop.store(false, std::sync::atomic::Ordering::SeqCst);
    let manager = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .unwrap()
        .unwrap();

    // With max_retries = 2, the third failed attempt enters fallback —
    // exactly once, with exactly one fallback log line.
    assert!(manager.link().is_fallback());
    assert_eq!(manager.link().fallback_entries(), 1);
    assert_eq!(manager.stats().frames_sent, 0);

    let log = std::fs::read_to_string(&log_path).unwrap();
    assert_eq!(log.matches("entering fallback").count(), 1);
}

// ── Queue behaviour under backpressure ───────────────────────────

#[tokio::test]
async fn slow_sink_drops_oldest_frames_without_blocking() {
    let queue: Arc<FrameQueue<PixelBuffer>> = Arc::new(FrameQueue::new(2));

    for seq in 0..5u64 {
        queue.push(PixelBuffer {
            seq,
            width: 1,
            height: 1,
            data: vec![0, 0, 0],
            captured_at: std::time::Instant::now(),
        });
    }

    // Only the newest two frames remain.
    assert_eq!(queue.dropped(), 3);
    assert_eq!(queue.pop().await.seq, 3);
    assert_eq!(queue.pop().await.seq, 4);
}
