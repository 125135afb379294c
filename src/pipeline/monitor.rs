//! Day/night gate: periodically measures the latest frame's brightness and
//! arms or disarms recording.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use flume::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::capture::Frame;
use crate::BrightnessConfig;

/// Whether a detection may start a new session. Written by the monitor,
/// read by the recording controller.
#[derive(Debug, Default)]
pub struct ArmGate {
    armed: AtomicBool,
}

impl ArmGate {
    pub fn new(armed: bool) -> Self {
        Self {
            armed: AtomicBool::new(armed),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Returns true if this call changed the state
    pub fn arm(&self) -> bool {
        !self.armed.swap(true, Ordering::AcqRel)
    }

    /// Returns true if this call changed the state
    pub fn disarm(&self) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }
}

/// Most recently processed frame, replaced atomically by the processing loop
#[derive(Default)]
pub struct LatestFrame {
    slot: ArcSwapOption<Frame>,
}

impl LatestFrame {
    pub fn store(&self, frame: Frame) {
        self.slot.store(Some(Arc::new(frame)));
    }

    pub fn load(&self) -> Option<Arc<Frame>> {
        self.slot.load_full()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorDecision {
    Armed { luminance: f64 },
    Disarmed { luminance: f64 },
    Unchanged { luminance: f64 },
}

pub struct BrightnessMonitor {
    latest: Arc<LatestFrame>,
    gate: Arc<ArmGate>,
    threshold: f64,
    period: Duration,
    warmup_poll: Duration,
    last_sequence: Option<u64>,
}

impl BrightnessMonitor {
    pub fn new(latest: Arc<LatestFrame>, gate: Arc<ArmGate>, config: &BrightnessConfig) -> Self {
        Self {
            latest,
            gate,
            threshold: config.threshold,
            period: Duration::from_secs(config.period_secs),
            warmup_poll: Duration::from_millis(config.warmup_poll_ms),
            last_sequence: None,
        }
    }

    /// Measure the latest frame once. `None` when there is nothing new to measure.
    pub fn sample(&mut self) -> Option<MonitorDecision> {
        let frame = self.latest.load()?;
        if self.last_sequence == Some(frame.sequence()) {
            return None;
        }
        let luminance = frame.mean_luminance()?;
        self.last_sequence = Some(frame.sequence());

        let decision = if luminance < self.threshold {
            if self.gate.disarm() {
                info!(
                    "Brightness {:.1} below {:.1}, disarming",
                    luminance, self.threshold
                );
                MonitorDecision::Disarmed { luminance }
            } else {
                MonitorDecision::Unchanged { luminance }
            }
        } else if self.gate.arm() {
            info!(
                "Brightness {:.1} at or above {:.1}, arming",
                luminance, self.threshold
            );
            MonitorDecision::Armed { luminance }
        } else {
            MonitorDecision::Unchanged { luminance }
        };
        metrics::gauge!("scene_luminance").set(luminance);
        debug!("Brightness sample: {:?}", decision);
        Some(decision)
    }

    /// Sample every period until `stop` fires or its sender is dropped.
    /// Polls faster until the first successful measurement.
    pub fn run(mut self, stop: Receiver<()>) {
        loop {
            let wait = if self.last_sequence.is_some() {
                self.period
            } else {
                self.warmup_poll.min(self.period)
            };
            match stop.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {
                    self.sample();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Brightness monitor stopped");
    }
}
