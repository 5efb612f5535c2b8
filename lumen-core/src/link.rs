//! Delivery link state machine.
//!
//! Models the lifecycle of the connection to the lighting sink, with
//! validated transitions that return `Result` instead of panicking.
//!
//! ```text
//!  Disconnected ──► Connecting ──► Connected
//!                       │  ▲           │ (hard I/O error)
//!                       ▼  │           ▼
//!                      Backoff ◄───────┘
//!                       │
//!                       ▼ (failure threshold exceeded)
//!                      Fallback ──► Connecting (low-frequency probe)
//! ```
//!
//! No state is skipped: `Disconnected` never jumps straight to
//! `Connected`. `consecutive_failures` resets to zero only on a
//! successful send — reconnecting alone does not clear it.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::LumenError;

// ── Config ───────────────────────────────────────────────────────

/// Retry/backoff discipline for the delivery link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Consecutive failures tolerated before entering fallback.
    pub max_retries: u32,
    /// First backoff delay.
    pub base_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Jitter applied to each backoff delay (fraction of the delay).
const BACKOFF_JITTER: f64 = 0.125;

// ── LinkPhase ────────────────────────────────────────────────────

/// The current phase of the sink link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkPhase {
    /// No connection. Initial state.
    #[default]
    Disconnected,

    /// TCP connect + registration handshake in progress.
    Connecting,

    /// Registered with the sink; frames flow.
    Connected {
        /// When the link entered `Connected`.
        since: Instant,
    },

    /// Waiting out a retry delay after a failure.
    Backoff {
        /// Earliest instant a reconnect may be attempted.
        until: Instant,
    },

    /// Delivery disabled; capture continues. Background probes retry
    /// at low frequency.
    Fallback {
        since: Instant,
    },
}

impl std::fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected { .. } => write!(f, "Connected"),
            Self::Backoff { .. } => write!(f, "Backoff"),
            Self::Fallback { .. } => write!(f, "Fallback"),
        }
    }
}

// ── Outcomes ─────────────────────────────────────────────────────

/// What a recorded failure did to the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Soft failure (send timeout); the established connection is kept.
    RetainConnection,
    /// Hard failure; wait out the given delay before reconnecting.
    Backoff(Duration),
    /// Threshold exceeded for the first time in this episode.
    EnteredFallback,
    /// A fallback probe failed; still in fallback, no new log entry.
    StillFallback,
}

// ── LinkState ────────────────────────────────────────────────────

/// Phase plus failure bookkeeping for the delivery link.
#[derive(Debug)]
pub struct LinkState {
    phase: LinkPhase,
    config: LinkConfig,
    consecutive_failures: u32,
    total_reconnections: u32,
    fallback_entries: u32,
    /// Set while a fallback episode is in progress; cleared only by a
    /// successful send, so probes cannot re-log fallback entry.
    in_fallback_episode: bool,
}

impl LinkState {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            phase: LinkPhase::Disconnected,
            config,
            consecutive_failures: 0,
            total_reconnections: 0,
            fallback_entries: 0,
            in_fallback_episode: false,
        }
    }

    pub fn phase(&self) -> &LinkPhase {
        &self.phase
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_reconnections(&self) -> u32 {
        self.total_reconnections
    }

    /// How many times the link has entered fallback.
    pub fn fallback_entries(&self) -> u32 {
        self.fallback_entries
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.phase, LinkPhase::Connected { .. })
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.phase, LinkPhase::Fallback { .. })
    }

    /// Whether a connect attempt is currently allowed.
    pub fn ready_to_retry(&self) -> bool {
        match self.phase {
            LinkPhase::Disconnected | LinkPhase::Fallback { .. } => true,
            LinkPhase::Backoff { until } => Instant::now() >= until,
            _ => false,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Connecting`.
    ///
    /// Valid from: `Disconnected`, `Backoff` (delay elapsed),
    /// `Fallback` (background probe).
    pub fn begin_connect(&mut self) -> Result<(), LumenError> {
        match self.phase {
            LinkPhase::Disconnected | LinkPhase::Fallback { .. } => {
                self.phase = LinkPhase::Connecting;
                Ok(())
            }
            LinkPhase::Backoff { until } => {
                if Instant::now() < until {
                    return Err(LumenError::Other(
                        "cannot connect: backoff delay not elapsed".into(),
                    ));
                }
                self.phase = LinkPhase::Connecting;
                Ok(())
            }
            _ => Err(LumenError::Other(
                "cannot connect: not in a connectable state".into(),
            )),
        }
    }

    /// Transition to `Connected` after TCP connect + registration.
    ///
    /// Valid from: `Connecting`. Does **not** reset the failure
    /// counter; only a successful send does that.
    pub fn established(&mut self) -> Result<(), LumenError> {
        match self.phase {
            LinkPhase::Connecting => {
                if self.consecutive_failures > 0 {
                    self.total_reconnections += 1;
                }
                self.phase = LinkPhase::Connected {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(LumenError::Other(
                "cannot establish: not in Connecting state".into(),
            )),
        }
    }

    /// A frame reached the sink. Resets the failure counter and ends
    /// any fallback episode.
    pub fn record_send_success(&mut self) {
        self.consecutive_failures = 0;
        self.in_fallback_episode = false;
    }

    /// A send on the established connection timed out. The connection
    /// is retained until the threshold trips.
    pub fn record_soft_failure(&mut self) -> FailureOutcome {
        self.consecutive_failures += 1;
        if self.consecutive_failures > self.config.max_retries {
            self.enter_fallback()
        } else {
            FailureOutcome::RetainConnection
        }
    }

    /// A connect attempt or send failed hard (connection unusable).
    pub fn record_hard_failure(&mut self) -> FailureOutcome {
        self.consecutive_failures += 1;
        if self.consecutive_failures > self.config.max_retries || self.in_fallback_episode {
            self.enter_fallback()
        } else {
            let delay = self.backoff_delay();
            self.phase = LinkPhase::Backoff {
                until: Instant::now() + delay,
            };
            FailureOutcome::Backoff(delay)
        }
    }

    /// Graceful shutdown from any state.
    pub fn disconnect(&mut self) {
        self.phase = LinkPhase::Disconnected;
    }

    // ── Internal ─────────────────────────────────────────────────

    fn enter_fallback(&mut self) -> FailureOutcome {
        let first = !self.in_fallback_episode;
        self.in_fallback_episode = true;
        self.phase = LinkPhase::Fallback {
            since: Instant::now(),
        };
        if first {
            self.fallback_entries += 1;
            FailureOutcome::EnteredFallback
        } else {
            FailureOutcome::StillFallback
        }
    }

    /// Exponential backoff with jitter: `base * 2^(n-1)`, capped at
    /// the ceiling, scaled by ±12.5%.
    fn backoff_delay(&self) -> Duration {
        let n = self.consecutive_failures.max(1);
        let raw = self
            .config
            .base_backoff
            .saturating_mul(1u32 << (n - 1).min(16));
        let capped = raw.min(self.config.max_backoff);
        let jitter = rand::thread_rng().gen_range(1.0 - BACKOFF_JITTER..=1.0 + BACKOFF_JITTER);
        capped.mul_f64(jitter)
    }
}

// ── Tests ────────────────────────────────────────────────────────
