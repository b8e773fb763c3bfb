//! At-the-wire deduplication of identical outbound frames.
//!
//! Downstream relays act on every telegram, so a bounced button or a
//! retrying caller must not hammer the bus with copies. The window keeps,
//! per frame byte-sequence, the monotonic timestamps of its actual writes.
//! A frame due for sending while an identical one went out within the
//! window is suppressed entirely. This applies to all outbound traffic,
//! actions included.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

/// Default suppression window.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(50);

/// Sliding-window duplicate tracker for outbound frames.
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    sends: HashMap<Vec<u8>, Vec<Instant>>,
}

impl DedupWindow {
    /// Create a tracker with the given suppression window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self { window, sends: HashMap::new() }
    }

    /// The suppression window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decide whether `frame` may be written at `now`.
    ///
    /// Returns true when an identical frame was written within the window;
    /// the caller must then drop the frame without side effects. Otherwise
    /// the write is recorded and false is returned.
    pub fn check_and_record(&mut self, frame: &[u8], now: Instant) -> bool {
        if let Some(times) = self.sends.get(frame) {
            if times.iter().any(|&t| now.duration_since(t) < self.window) {
                return true;
            }
        }
        self.sends.entry(frame.to_vec()).or_default().push(now);
        false
    }

    /// Drop timestamps older than the window and empty entries.
    ///
    /// Scheduled by the engine every two windows.
    pub fn evict(&mut self, now: Instant) {
        self.sends.retain(|_, times| {
            times.retain(|&t| now.duration_since(t) < self.window);
            !times.is_empty()
        });
    }

    /// Number of distinct frames currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.sends.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(50);

    #[tokio::test(start_paused = true)]
    async fn duplicate_within_window_is_suppressed() {
        let mut dedup = DedupWindow::new(WINDOW);
        let frame = b"<S0020044964F05D00FN>";

        assert!(!dedup.check_and_record(frame, Instant::now()));
        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(5)).await;
            assert!(dedup.check_and_record(frame, Instant::now()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_frames_both_pass() {
        let mut dedup = DedupWindow::new(WINDOW);
        let now = Instant::now();
        assert!(!dedup.check_and_record(b"<S0020044964F05D00FN>", now));
        assert!(!dedup.check_and_record(b"<S0000000000F01D00FA>", now));
    }

    #[tokio::test(start_paused = true)]
    async fn frame_passes_again_after_window() {
        let mut dedup = DedupWindow::new(WINDOW);
        let frame = b"<S0020044964F05D00FN>";

        assert!(!dedup.check_and_record(frame, Instant::now()));
        tokio::time::advance(WINDOW).await;
        assert!(!dedup.check_and_record(frame, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn suppressed_sends_are_not_recorded() {
        let mut dedup = DedupWindow::new(WINDOW);
        let frame = b"<S0020044964F05D00FN>";

        assert!(!dedup.check_and_record(frame, Instant::now()));
        tokio::time::advance(Duration::from_millis(40)).await;
        // Suppressed: must not extend the window.
        assert!(dedup.check_and_record(frame, Instant::now()));
        tokio::time::advance(Duration::from_millis(10)).await;
        // One full window after the only real write.
        assert!(!dedup.check_and_record(frame, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn evict_drops_stale_entries() {
        let mut dedup = DedupWindow::new(WINDOW);
        dedup.check_and_record(b"<A>", Instant::now());
        tokio::time::advance(Duration::from_millis(10)).await;
        dedup.check_and_record(b"<B>", Instant::now());
        assert_eq!(dedup.tracked(), 2);

        tokio::time::advance(Duration::from_millis(45)).await;
        dedup.evict(Instant::now());
        assert_eq!(dedup.tracked(), 1);

        tokio::time::advance(WINDOW).await;
        dedup.evict(Instant::now());
        assert_eq!(dedup.tracked(), 0);
    }
}
