//! Detector adapters.
//!
//! The pipeline only needs to know whether a frame contains one of the target
//! classes; how the detections were produced is up to the implementation.

pub mod motion;
pub mod yolo;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::capture::Frame;
use crate::error::DetectorError;

pub use motion::MotionDetector;
pub use yolo::{InferenceBackend, YoloDetector, YoloParams};

/// Axis-aligned box in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        (self.x1 - self.x0).max(0.0) * (self.y1 - self.y0).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = BoundingBox {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
        .area();
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Detections for one frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub frame_sequence: u64,
    pub detections: Vec<Detection>,
}

/// Runs inference on a frame.
///
/// Implementations must not retain or mutate the frame. Latency is allowed to
/// vary; the processing loop never holds up acquisition while waiting.
pub trait Detector: Send {
    fn infer(&mut self, frame: &Frame) -> Result<DetectionResult, DetectorError>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn infer(&mut self, frame: &Frame) -> Result<DetectionResult, DetectorError> {
        (**self).infer(frame)
    }
}

/// Which classes count as a hit, and how sure the detector must be
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetClasses {
    pub classes: BTreeSet<u32>,
    pub min_confidence: f32,
}

impl TargetClasses {
    pub fn new(classes: impl IntoIterator<Item = u32>, min_confidence: f32) -> Self {
        Self {
            classes: classes.into_iter().collect(),
            min_confidence,
        }
    }

    pub fn is_hit(&self, result: &DetectionResult) -> bool {
        result
            .detections
            .iter()
            .any(|d| self.classes.contains(&d.class_id) && d.confidence >= self.min_confidence)
    }
}

impl Default for TargetClasses {
    fn default() -> Self {
        Self::new([0, 1], 0.0)
    }
}
