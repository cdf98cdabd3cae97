//! Detects a capture thread that stopped delivering frames.
//!
//! The capture device keeps its own thread, so a wedged driver shows up only
//! as a feed whose newest frame stops advancing. The orchestrator polls the
//! watchdog on its sampling timer and reports the first stall; it does not
//! restart the session.

use std::time::Duration;

use chrono::Utc;
use tracing::error;
use video_ingest::{SessionId, VideoFeed};

#[derive(Debug)]
pub struct CaptureWatchdog {
    session: SessionId,
    threshold: Duration,
    stalled: bool,
}

impl CaptureWatchdog {
    pub fn new(session: SessionId, threshold: Duration) -> Self {
        Self {
            session,
            threshold,
            stalled: false,
        }
    }

    /// Returns how long the feed has been silent the first time it crosses the
    /// threshold. Fresh frames re-arm the watchdog.
    pub fn check(&mut self, feed: &VideoFeed, now_ms: i64) -> Option<Duration> {
        let last = feed.last_frame_at_ms()?;
        let silent = Duration::from_millis(now_ms.saturating_sub(last).max(0) as u64);
        if silent <= self.threshold {
            self.stalled = false;
            return None;
        }
        if self.stalled {
            return None;
        }
        self.stalled = true;
        metrics::counter!("vision_capture_stalls_total").increment(1);
        error!(
            session = %self.session,
            silent_ms = silent.as_millis() as u64,
            "capture stalled; no new frame from the camera"
        );
        Some(silent)
    }
}

/// Wall-clock milliseconds, matching the capture timestamps.
pub fn current_millis() -> i64 {
    Utc::now().timestamp_millis()
}
