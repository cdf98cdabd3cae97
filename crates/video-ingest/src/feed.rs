//! Latest-frame slot shared between the capture thread and its readers.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

use crate::types::Frame;

/// The live "video element": always holds the most recent frame and nothing
/// older. Readers never block the capture thread for longer than a pointer swap.
#[derive(Clone, Default)]
pub struct VideoFeed {
    inner: Arc<FeedInner>,
}

#[derive(Default)]
struct FeedInner {
    latest: Mutex<Option<Arc<Frame>>>,
    published: AtomicU64,
    last_frame_ms: AtomicI64,
}

impl VideoFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame) {
        let timestamp_ms = frame.timestamp_ms;
        if let Ok(mut guard) = self.inner.latest.lock() {
            *guard = Some(Arc::new(frame));
        }
        self.inner.last_frame_ms.store(timestamp_ms, Ordering::Relaxed);
        self.inner.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        match self.inner.latest.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        }
    }

    pub fn frames_published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Capture timestamp of the newest frame, if any frame arrived yet.
    pub fn last_frame_at_ms(&self) -> Option<i64> {
        if self.frames_published() == 0 {
            return None;
        }
        Some(self.inner.last_frame_ms.load(Ordering::Relaxed))
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.inner.latest.lock() {
            *guard = None;
        }
    }
}
