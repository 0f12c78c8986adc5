//! Frame timing for the pacing loop.

use std::time::{Duration, Instant};

/// Tracks frame deltas and reports an averaged frame rate once per interval.
#[derive(Debug)]
pub struct FrameTimer {
    start: Instant,
    last_frame: Instant,
    window_start: Instant,
    frames_in_window: u32,
    report_interval: Duration,
}

impl FrameTimer {
    /// Create a timer that reports every `report_interval`.
    pub fn new(report_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_frame: now,
            window_start: now,
            frames_in_window: 0,
            report_interval,
        }
    }

    /// Total time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Mark a presented frame.
    ///
    /// Returns the delta since the previous frame, and the average frames per
    /// second over the last window when the report interval has elapsed.
    pub fn frame(&mut self) -> (Duration, Option<f64>) {
        self.frame_at(Instant::now())
    }

    fn frame_at(&mut self, now: Instant) -> (Duration, Option<f64>) {
        let delta = now.saturating_duration_since(self.last_frame);
        self.last_frame = now;
        self.frames_in_window += 1;

        let window = now.saturating_duration_since(self.window_start);
        if window < self.report_interval || window.is_zero() {
            return (delta, None);
        }

        let fps = f64::from(self.frames_in_window) / window.as_secs_f64();
        self.frames_in_window = 0;
        self.window_start = now;
        (delta, Some(fps))
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
