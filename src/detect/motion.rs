//! Model-free fallback detector.
//!
//! Compares each frame against the previous one on a sparse luma grid and
//! reports a single detection around the changed area when enough of the frame
//! moved. Used when no network backend is available.

use serde::{Deserialize, Serialize};

use super::{BoundingBox, Detection, DetectionResult, Detector};
use crate::capture::{Frame, PixelFormat};
use crate::error::DetectorError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionParams {
    /// Class id reported for motion
    pub class_id: u32,
    /// Sample every `grid_step` pixels in both directions
    pub grid_step: u32,
    /// Per-sample luma difference counted as change
    pub pixel_threshold: u8,
    /// Fraction of changed samples that triggers a detection
    pub area_threshold: f32,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            class_id: 0,
            grid_step: 8,
            pixel_threshold: 25,
            area_threshold: 0.01,
        }
    }
}

pub struct MotionDetector {
    params: MotionParams,
    previous: Option<LumaGrid>,
}

struct LumaGrid {
    width: u32,
    height: u32,
    cols: u32,
    samples: Vec<u8>,
}

impl LumaGrid {
    fn sample(frame: &Frame, step: u32) -> Result<Self, DetectorError> {
        let bpp = match frame.meta.format {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Gray8 => 1,
            other => {
                return Err(DetectorError::InvalidFrame(format!(
                    "{other:?} frames are not decoded"
                )))
            }
        };
        let (w, h) = (frame.width(), frame.height());
        let stride = frame.meta.stride as usize;
        if frame.data.len() < stride * h as usize {
            return Err(DetectorError::InvalidFrame("frame buffer too short".into()));
        }

        let cols = w.div_ceil(step);
        let mut samples = Vec::with_capacity((cols * h.div_ceil(step)) as usize);
        for y in (0..h).step_by(step as usize) {
            let row = &frame.data[y as usize * stride..];
            for x in (0..w).step_by(step as usize) {
                let i = x as usize * bpp;
                let luma = if bpp == 1 {
                    row[i]
                } else {
                    // Channel order doesn't matter for a green-weighted average
                    ((row[i] as u16 + 2 * row[i + 1] as u16 + row[i + 2] as u16) / 4) as u8
                };
                samples.push(luma);
            }
        }
        Ok(Self {
            width: w,
            height: h,
            cols,
            samples,
        })
    }
}

impl MotionDetector {
    pub fn new(params: MotionParams) -> Self {
        Self {
            params: MotionParams {
                grid_step: params.grid_step.max(1),
                ..params
            },
            previous: None,
        }
    }

    fn compare(&self, previous: &LumaGrid, current: &LumaGrid) -> Option<Detection> {
        if previous.width != current.width || previous.height != current.height {
            return None;
        }

        let step = self.params.grid_step;
        let mut changed = 0usize;
        let mut bbox: Option<(u32, u32, u32, u32)> = None;
        for (i, (a, b)) in previous.samples.iter().zip(&current.samples).enumerate() {
            if a.abs_diff(*b) <= self.params.pixel_threshold {
                continue;
            }
            changed += 1;
            let x = (i as u32 % current.cols) * step;
            let y = (i as u32 / current.cols) * step;
            bbox = Some(match bbox {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }

        let fraction = changed as f32 / current.samples.len().max(1) as f32;
        if fraction < self.params.area_threshold {
            return None;
        }
        let (x0, y0, x1, y1) = bbox?;
        Some(Detection {
            class_id: self.params.class_id,
            bbox: BoundingBox {
                x0: x0 as f32,
                y0: y0 as f32,
                x1: (x1 + step).min(current.width) as f32,
                y1: (y1 + step).min(current.height) as f32,
            },
            confidence: 1.0,
        })
    }
}

impl Detector for MotionDetector {
    fn infer(&mut self, frame: &Frame) -> Result<DetectionResult, DetectorError> {
        let current = LumaGrid::sample(frame, self.params.grid_step)?;
        let detections = self
            .previous
            .as_ref()
            .and_then(|previous| self.compare(previous, &current))
            .into_iter()
            .collect();
        self.previous = Some(current);

        Ok(DetectionResult {
            frame_sequence: frame.sequence(),
            detections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn gray(seq: u64, w: u32, h: u32, fill: impl Fn(u32, u32) -> u8) -> Frame {
        let data: Vec<u8> = (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .map(|(x, y)| fill(x, y))
            .collect();
        Frame::new(data, seq, w, h, PixelFormat::Gray8, Instant::now())
    }

    #[test]
    fn first_frame_never_triggers() {
        let mut detector = MotionDetector::new(MotionParams::default());
        let result = detector.infer(&gray(1, 32, 32, |_, _| 200)).unwrap();
        assert!(result.detections.is_empty());
    }

    #[test]
    fn static_scene_is_quiet_and_changes_trigger() {
        let mut detector = MotionDetector::new(MotionParams {
            grid_step: 4,
            ..MotionParams::default()
        });
        detector.infer(&gray(1, 32, 32, |_, _| 50)).unwrap();
        let quiet = detector.infer(&gray(2, 32, 32, |_, _| 52)).unwrap();
        assert!(quiet.detections.is_empty());

        let moved = detector
            .infer(&gray(3, 32, 32, |x, y| if x >= 16 && y < 8 { 250 } else { 50 }))
            .unwrap();
        assert_eq!(moved.detections.len(), 1);
        let bbox = moved.detections[0].bbox;
        assert_eq!((bbox.x0, bbox.y0, bbox.x1, bbox.y1), (16.0, 0.0, 32.0, 8.0));
    }

    #[test]
    fn resolution_change_resets_reference() {
        let mut detector = MotionDetector::new(MotionParams::default());
        detector.infer(&gray(1, 32, 32, |_, _| 0)).unwrap();
        let result = detector.infer(&gray(2, 64, 64, |_, _| 255)).unwrap();
        assert!(result.detections.is_empty());
    }
}
