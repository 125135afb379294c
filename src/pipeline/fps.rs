use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Achieved capture rate, shared between threads (f32 stored as bits)
#[derive(Debug, Default)]
pub struct FpsGauge {
    bits: AtomicU32,
}

impl FpsGauge {
    pub fn set(&self, fps: f32) {
        self.bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    /// `None` until a full measurement window has elapsed
    pub fn get(&self) -> Option<f32> {
        let fps = f32::from_bits(self.bits.load(Ordering::Relaxed));
        (fps > 0.0).then_some(fps)
    }
}

/// Counts frames over fixed windows
pub struct FpsMeter {
    window: Duration,
    window_start: Option<Instant>,
    frames: u32,
}

impl FpsMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            window_start: None,
            frames: 0,
        }
    }

    /// Record a frame; returns the rate when a window completes
    pub fn tick(&mut self, now: Instant) -> Option<f32> {
        let start = *self.window_start.get_or_insert(now);
        self.frames += 1;
        let elapsed = now.saturating_duration_since(start);
        if elapsed < self.window {
            return None;
        }
        let fps = (self.frames - 1) as f32 / elapsed.as_secs_f32();
        self.window_start = Some(now);
        self.frames = 1;
        Some(fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measures_rate_over_window() {
        let mut meter = FpsMeter::new(Duration::from_secs(1));
        let t0 = Instant::now();
        let mut reported = None;
        for i in 0..=30u32 {
            reported = meter.tick(t0 + Duration::from_millis(i as u64 * 1000 / 30)).or(reported);
        }
        let fps = reported.unwrap();
        assert!((fps - 30.0).abs() < 0.5, "{fps}");
    }

    #[test]
    fn gauge_is_empty_until_set() {
        let gauge = FpsGauge::default();
        assert_eq!(gauge.get(), None);
        gauge.set(24.5);
        assert_eq!(gauge.get(), Some(24.5));
    }
}
