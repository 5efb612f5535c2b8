//! Bounded frame queue between the capture loop and delivery.
//!
//! Capture must never block on delivery: `push` is non-blocking and
//! drops the *oldest* queued frame when the queue is full, so the sink
//! always sees the freshest frames the link can keep up with.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

pub struct FrameQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame without blocking. Returns `true` if an older
    /// frame was evicted to make room.
    pub fn push(&self, item: T) -> bool {
        let mut evicted = false;
        {
            let Ok(mut q) = self.inner.lock() else {
                return false;
            };
            if q.len() >= self.capacity {
                q.pop_front();
                evicted = true;
            }
            q.push_back(item);
        }
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Wait for the next frame.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().ok().and_then(|mut q| q.pop_front())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total frames evicted since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ── Tests ────────────────────────────────────────────────────────
