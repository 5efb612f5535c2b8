//! Frame delivery to the lighting controller.
//!
//! The connection manager runs as its own task, decoupled from the
//! capture cadence by a bounded drop-oldest [`FrameQueue`]. Delivery
//! failures never reach the capture loop: they move the link through
//! backoff and, past the retry budget, into fallback — where frames
//! are discarded and low-frequency background probes keep looking for
//! the sink to come back.

pub mod codec;
pub mod proto;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::diag::DiagnosticLogger;
use crate::error::LumenError;
use crate::link::{FailureOutcome, LinkConfig, LinkPhase, LinkState};
use crate::pixel::PixelBuffer;
use crate::queue::FrameQueue;
use codec::SinkCodec;
use proto::SinkMessage;

// ── Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// TCP address of the lighting controller.
    pub address: String,
    /// Consecutive failures tolerated before fallback.
    pub max_retries: u32,
    /// TCP connect + registration deadline.
    pub connect_timeout: Duration,
    /// Per-frame send deadline, independent of capture cadence.
    pub send_timeout: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Cadence of reconnect probes while in fallback.
    pub probe_interval: Duration,
    /// Origin string announced in the registration message.
    pub origin: String,
    /// Priority announced in the registration message.
    pub priority: i32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:19400".to_string(),
            max_retries: 10,
            connect_timeout: Duration::from_secs(3),
            send_timeout: Duration::from_secs(3),
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            probe_interval: Duration::from_secs(30),
            origin: "lumen".to_string(),
            priority: 64,
        }
    }
}

/// How often the fallback-mode reminder may be logged.
const FALLBACK_NOTE_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the connection statistics summary.
const STATS_INTERVAL: Duration = Duration::from_secs(300);

// ── Stats ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub phase: String,
    pub consecutive_failures: u32,
    pub total_reconnections: u32,
    pub fallback_entries: u32,
    pub frames_sent: u64,
    pub frames_discarded: u64,
}

// ── ConnectionManager ────────────────────────────────────────────

/// Owns the sink connection and drains the frame queue.
pub struct ConnectionManager {
    config: SinkConfig,
    queue: Arc<FrameQueue<PixelBuffer>>,
    link: LinkState,
    stream: Option<Framed<TcpStream, SinkCodec>>,
    logger: Arc<DiagnosticLogger>,
    running: Arc<AtomicBool>,
    frames_sent: u64,
    frames_discarded: u64,
    last_probe: Option<Instant>,
    last_fallback_note: Option<Instant>,
}

impl ConnectionManager {
    pub fn new(
        config: SinkConfig,
        queue: Arc<FrameQueue<PixelBuffer>>,
        logger: Arc<DiagnosticLogger>,
    ) -> Self {
        let link = LinkState::new(LinkConfig {
            max_retries: config.max_retries,
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
        });
        logger.state(
            "SINK",
            &format!(
                "connection manager for {} (max retries {})",
                config.address, config.max_retries
            ),
        );
        Self {
            config,
            queue,
            link,
            stream: None,
            logger,
            running: Arc::new(AtomicBool::new(true)),
            frames_sent: 0,
            frames_discarded: 0,
            last_probe: None,
            last_fallback_note: None,
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn link(&self) -> &LinkState {
        &self.link
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            phase: self.link.phase().to_string(),
            consecutive_failures: self.link.consecutive_failures(),
            total_reconnections: self.link.total_reconnections(),
            fallback_entries: self.link.fallback_entries(),
            frames_sent: self.frames_sent,
            frames_discarded: self.frames_discarded,
        }
    }

    /// Drain the frame queue until stopped.
    pub async fn run(&mut self) {
        let mut last_stats = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            let frame = tokio::select! {
                frame = self.queue.pop() => frame,
                _ = Self::wait_for_stop(&self.running) => break,
            };
            self.deliver(frame).await;

            if last_stats.elapsed() >= STATS_INTERVAL {
                last_stats = Instant::now();
                let stats = self.stats();
                self.logger.state(
                    "SINK",
                    &format!(
                        "stats: phase {}, {} failures, {} reconnections, {} sent, {} discarded",
                        stats.phase,
                        stats.consecutive_failures,
                        stats.total_reconnections,
                        stats.frames_sent,
                        stats.frames_discarded
                    ),
                );
            }
        }

        self.stream = None;
        self.link.disconnect();
        self.logger.state("SINK", "connection manager stopped");
    }

    /// Try to get one frame to the sink. Never blocks capture: any
    /// frame that cannot be delivered right now is discarded.
    pub async fn deliver(&mut self, frame: PixelBuffer) {
        match self.link.phase() {
            LinkPhase::Connected { .. } => {
                self.send_frame(frame).await;
            }
            LinkPhase::Backoff { .. } => {
                if self.link.ready_to_retry() {
                    if self.try_connect().await {
                        self.send_frame(frame).await;
                    } else {
                        self.frames_discarded += 1;
                    }
                } else {
                    // Never send while the backoff delay is pending.
                    self.frames_discarded += 1;
                }
            }
            LinkPhase::Disconnected => {
                if self.try_connect().await {
                    self.send_frame(frame).await;
                } else {
                    self.frames_discarded += 1;
                }
            }
            LinkPhase::Fallback { .. } => {
                self.deliver_in_fallback(frame).await;
            }
            LinkPhase::Connecting => {
                // A connect attempt is not left pending across calls;
                // reaching this means it was interrupted. Drop the frame.
                self.frames_discarded += 1;
            }
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn deliver_in_fallback(&mut self, frame: PixelBuffer) {
        let probe_due = self
            .last_probe
            .is_none_or(|at| at.elapsed() >= self.config.probe_interval);

        if probe_due {
            self.last_probe = Some(Instant::now());
            self.logger.detail("SINK", "fallback probe");
            if self.try_connect().await {
                self.send_frame(frame).await;
                return;
            }
        }

        self.frames_discarded += 1;
        let note_due = self
            .last_fallback_note
            .is_none_or(|at| at.elapsed() >= FALLBACK_NOTE_INTERVAL);
        if note_due {
            self.last_fallback_note = Some(Instant::now());
            self.logger
                .state("SINK", "operating without sink - capture continues");
        }
    }

    /// Connect and register. Returns `true` once the link is
    /// established.
    async fn try_connect(&mut self) -> bool {
        if self.link.begin_connect().is_err() {
            return false;
        }
        self.logger
            .detail("SINK", &format!("connecting to {}", self.config.address));

        let connect = TcpStream::connect(&self.config.address);
        let stream = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let outcome = self.link.record_hard_failure();
                self.on_failure(outcome, &format!("connect: {e}"));
                return false;
            }
            Err(_) => {
                let outcome = self.link.record_hard_failure();
                self.on_failure(
                    outcome,
                    &format!("connect timed out after {:?}", self.config.connect_timeout),
                );
                return false;
            }
        };

        let mut framed = Framed::new(stream, SinkCodec);
        let register = SinkMessage::Register {
            origin: self.config.origin.clone(),
            priority: self.config.priority,
        };
        match tokio::time::timeout(self.config.connect_timeout, framed.send(register)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let outcome = self.link.record_hard_failure();
                self.on_failure(outcome, &format!("register: {e}"));
                return false;
            }
            Err(_) => {
                let outcome = self.link.record_hard_failure();
                self.on_failure(outcome, "register timed out");
                return false;
            }
        }

        self.stream = Some(framed);
        if self.link.established().is_err() {
            self.stream = None;
            return false;
        }
        self.logger
            .state("SINK", &format!("connected to {}", self.config.address));
        true
    }

    async fn send_frame(&mut self, frame: PixelBuffer) {
        let seq = frame.seq;
        let Some(framed) = self.stream.as_mut() else {
            self.frames_discarded += 1;
            let outcome = self.link.record_hard_failure();
            self.on_failure(outcome, "no stream while connected");
            return;
        };

        let msg = SinkMessage::from(frame);
        match tokio::time::timeout(self.config.send_timeout, framed.send(msg)).await {
            Ok(Ok(())) => {
                self.frames_sent += 1;
                self.link.record_send_success();
                self.logger.detail("SINK", &format!("frame {seq} delivered"));
                self.drain_replies();
            }
            Ok(Err(e)) => {
                // Hard I/O error: the stream is unusable.
                self.stream = None;
                self.frames_discarded += 1;
                let outcome = self.link.record_hard_failure();
                self.on_failure(outcome, &format!("send: {e}"));
            }
            Err(_) => {
                // Timeout: counts toward failures but keeps the
                // established connection until the threshold trips.
                self.frames_discarded += 1;
                let outcome = self.link.record_soft_failure();
                if !matches!(outcome, FailureOutcome::RetainConnection) {
                    self.stream = None;
                }
                self.on_failure(
                    outcome,
                    &format!("send timed out after {:?}", self.config.send_timeout),
                );
            }
        }
    }

    /// Opportunistically discard any controller replies sitting in the
    /// receive buffer.
    fn drain_replies(&mut self) {
        if let Some(framed) = self.stream.as_mut() {
            while let Some(Some(Ok(_))) = framed.next().now_or_never() {}
        }
    }

    fn on_failure(&mut self, outcome: FailureOutcome, context: &str) {
        match outcome {
            FailureOutcome::RetainConnection => {
                self.logger.warn(
                    "SINK",
                    &format!(
                        "{context} ({} consecutive failures)",
                        self.link.consecutive_failures()
                    ),
                );
            }
            FailureOutcome::Backoff(delay) => {
                self.logger.warn(
                    "SINK",
                    &format!(
                        "{context}; retry in {delay:?} ({} of {})",
                        self.link.consecutive_failures(),
                        self.config.max_retries
                    ),
                );
            }
            FailureOutcome::EnteredFallback => {
                self.logger.error(
                    "SINK",
                    &format!(
                        "{context}; entering fallback after {} failures; delivery disabled, capture continues",
                        self.link.consecutive_failures()
                    ),
                );
            }
            FailureOutcome::StillFallback => {
                self.logger.detail("SINK", &format!("fallback probe failed: {context}"));
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

// ── Tests ────────────────────────────────────────────────────────
