//! Synthetic camera for dry runs and tests.
//!
//! Frames carry a virtual clock: frame `n` is stamped `start + (n - 1) * interval`
//! regardless of how fast it is produced, so session timing is reproducible.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::info;

use super::frame::{Frame, PixelFormat};
use super::{CameraProperty, FrameSource, Negotiated};
use crate::error::CameraError;

const MAX_DIMENSION: u32 = 7680;

#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// Uniform gray frame
    Solid { luma: u8 },
    /// A square sliding left to right over a uniform background
    MovingBox {
        background: u8,
        foreground: u8,
        size: u32,
    },
    /// Uniform frame whose luma is chosen per sequence number
    Scripted(fn(u64) -> u8),
}

pub struct TestPatternSource {
    pattern: TestPattern,
    width: u32,
    height: u32,
    fps: f32,
    limit: Option<u64>,
    pace: Option<Duration>,
    start: Instant,
    sequence: u64,
    open: bool,
    properties: BTreeMap<CameraProperty, i32>,
    closes: Arc<AtomicUsize>,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: f32, pattern: TestPattern) -> Self {
        info!("Opening {}x{} test pattern at {} fps", width, height, fps);
        Self {
            pattern,
            width,
            height,
            fps,
            limit: None,
            pace: None,
            start: Instant::now(),
            sequence: 0,
            open: true,
            properties: BTreeMap::new(),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// End the stream after `frames` frames
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Sleep this long before producing each frame
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Counts how many times the device was actually released
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }

    pub fn property(&self, property: CameraProperty) -> Option<i32> {
        self.properties.get(&property).copied()
    }

    fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(0.001)))
    }

    fn render(&self, sequence: u64) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        match self.pattern {
            TestPattern::Solid { luma } => vec![luma; w * h * 3],
            TestPattern::Scripted(script) => vec![script(sequence); w * h * 3],
            TestPattern::MovingBox {
                background,
                foreground,
                size,
            } => {
                let mut data = vec![background; w * h * 3];
                let size = (size as usize).min(w).min(h);
                let travel = w.saturating_sub(size).max(1);
                let x0 = (sequence as usize * 4) % travel;
                let y0 = h.saturating_sub(size) / 2;
                for y in y0..y0 + size {
                    let row = y * w * 3;
                    data[row + x0 * 3..row + (x0 + size) * 3].fill(foreground);
                }
                data
            }
        }
    }
}

impl FrameSource for TestPatternSource {
    fn read(&mut self) -> Result<Frame, CameraError> {
        if !self.open {
            return Err(CameraError::Closed);
        }
        if self.limit.is_some_and(|limit| self.sequence >= limit) {
            return Err(CameraError::CaptureFailed("end of test pattern".into()));
        }
        if let Some(pace) = self.pace {
            std::thread::sleep(pace);
        }

        self.sequence += 1;
        let timestamp = self.start + self.interval() * (self.sequence - 1) as u32;
        Ok(Frame::new(
            Bytes::from(self.render(self.sequence)),
            self.sequence,
            self.width,
            self.height,
            PixelFormat::Rgb24,
            timestamp,
        ))
    }

    fn reconfigure(&mut self, width: u32, height: u32) -> Result<Negotiated, CameraError> {
        if !self.open {
            return Err(CameraError::Closed);
        }
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(CameraError::UnsupportedConfig(format!(
                "{width}x{height} out of range"
            )));
        }
        self.width = width;
        self.height = height;
        self.negotiated().ok_or(CameraError::Closed)
    }

    /// Only image controls exist; lens and exposure controls report unsupported
    fn set_property(&mut self, property: CameraProperty, value: i32) -> Result<bool, CameraError> {
        if !self.open {
            return Err(CameraError::Closed);
        }
        match property {
            CameraProperty::Pan
            | CameraProperty::Tilt
            | CameraProperty::Focus
            | CameraProperty::FocusAuto
            | CameraProperty::Zoom
            | CameraProperty::Exposure
            | CameraProperty::AutoExposure => Ok(false),
            _ => {
                self.properties.insert(property, value);
                Ok(true)
            }
        }
    }

    fn negotiated(&self) -> Option<Negotiated> {
        self.open.then_some(Negotiated {
            width: self.width,
            height: self.height,
            fps: self.fps,
            format: PixelFormat::Rgb24,
        })
    }

    fn close(&mut self) {
        if std::mem::replace(&mut self.open, false) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
