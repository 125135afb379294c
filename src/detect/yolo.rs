//! YOLO-style detector: letterbox preprocessing and output decoding around an
//! opaque network backend.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{BoundingBox, Detection, DetectionResult, Detector};
use crate::capture::Frame;
use crate::error::DetectorError;

/// Padding value used by YOLO letterboxing
const LETTERBOX_FILL: u8 = 114;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YoloParams {
    pub input_size: u32,       // 640 typical
    pub conf_threshold: f32,   // 0..1
    pub iou_threshold: f32,    // 0..1
    pub max_detections: usize, // e.g. 300
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            input_size: 640,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 100,
        }
    }
}

/// Raw network output laid out as `[4 + num_classes, anchors]`, row-major.
/// Rows 0..4 are `cx, cy, w, h` in input pixels, the rest are class scores.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub data: Vec<f32>,
    pub num_classes: usize,
    pub anchors: usize,
}

/// Runs the network on an NCHW `[1, 3, size, size]` tensor with values in 0..1
pub trait InferenceBackend: Send {
    fn forward(&mut self, input: &[f32], input_size: u32) -> Result<ModelOutput, DetectorError>;
}

/// How a frame was fitted into the square network input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl Letterbox {
    fn new(frame_width: u32, frame_height: u32, input_size: u32) -> Self {
        let scale = (input_size as f32 / frame_width as f32)
            .min(input_size as f32 / frame_height as f32);
        let new_w = (frame_width as f32 * scale).round();
        let new_h = (frame_height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((input_size as f32 - new_w) / 2.0).floor(),
            pad_y: ((input_size as f32 - new_h) / 2.0).floor(),
            frame_width,
            frame_height,
        }
    }

    /// Map a network-space `cx, cy, w, h` box back onto the frame
    fn to_frame(&self, cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
        let fw = self.frame_width as f32;
        let fh = self.frame_height as f32;
        BoundingBox {
            x0: ((cx - w / 2.0 - self.pad_x) / self.scale).clamp(0.0, fw),
            y0: ((cy - h / 2.0 - self.pad_y) / self.scale).clamp(0.0, fh),
            x1: ((cx + w / 2.0 - self.pad_x) / self.scale).clamp(0.0, fw),
            y1: ((cy + h / 2.0 - self.pad_y) / self.scale).clamp(0.0, fh),
        }
    }
}

pub struct YoloDetector<B> {
    backend: B,
    params: YoloParams,
}

impl<B: InferenceBackend> YoloDetector<B> {
    pub fn new(backend: B, params: YoloParams) -> Self {
        Self { backend, params }
    }

    /// Letterbox the frame into the network's square input
    pub fn preprocess(&self, frame: &Frame) -> Result<(Vec<f32>, Letterbox), DetectorError> {
        let rgb = frame.to_rgb_image().ok_or_else(|| {
            DetectorError::InvalidFrame(format!("{:?} frames are not decoded", frame.meta.format))
        })?;
        if rgb.width() == 0 || rgb.height() == 0 {
            return Err(DetectorError::InvalidFrame("empty frame".into()));
        }

        let size = self.params.input_size;
        let letterbox = Letterbox::new(rgb.width(), rgb.height(), size);
        let new_w = ((rgb.width() as f32 * letterbox.scale).round() as u32).clamp(1, size);
        let new_h = ((rgb.height() as f32 * letterbox.scale).round() as u32).clamp(1, size);
        let resized = imageops::resize(&rgb, new_w, new_h, FilterType::Triangle);

        let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
        imageops::replace(
            &mut canvas,
            &resized,
            letterbox.pad_x as i64,
            letterbox.pad_y as i64,
        );

        let plane = (size * size) as usize;
        let mut tensor = vec![0f32; plane * 3];
        for (i, px) in canvas.pixels().enumerate() {
            tensor[i] = px[0] as f32 / 255.0;
            tensor[plane + i] = px[1] as f32 / 255.0;
            tensor[2 * plane + i] = px[2] as f32 / 255.0;
        }
        Ok((tensor, letterbox))
    }

    /// Threshold, map back to frame space and suppress overlapping boxes
    pub fn decode(
        &self,
        output: &ModelOutput,
        letterbox: &Letterbox,
    ) -> Result<Vec<Detection>, DetectorError> {
        let rows = 4 + output.num_classes;
        if output.data.len() != rows * output.anchors {
            return Err(DetectorError::Backend(format!(
                "expected {}x{} outputs, got {}",
                rows,
                output.anchors,
                output.data.len()
            )));
        }

        let at = |row: usize, anchor: usize| output.data[row * output.anchors + anchor];
        let mut candidates = Vec::new();
        for anchor in 0..output.anchors {
            let best = (0..output.num_classes)
                .map(|class| (class, at(4 + class, anchor)))
                .max_by(|a, b| a.1.total_cmp(&b.1));
            let Some((class, score)) = best else { continue };
            if score < self.params.conf_threshold {
                continue;
            }
            candidates.push(Detection {
                class_id: class as u32,
                bbox: letterbox.to_frame(at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor)),
                confidence: score,
            });
        }

        Ok(non_max_suppression(
            candidates,
            self.params.iou_threshold,
            self.params.max_detections,
        ))
    }
}

/// Greedy per-class NMS, highest confidence first
fn non_max_suppression(
    mut candidates: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

impl<B: InferenceBackend> Detector for YoloDetector<B> {
    fn infer(&mut self, frame: &Frame) -> Result<DetectionResult, DetectorError> {
        let (input, letterbox) = self.preprocess(frame)?;
        let output = self.backend.forward(&input, self.params.input_size)?;
        let detections = self.decode(&output, &letterbox)?;
        trace!(
            "Frame {}: {} detections",
            frame.sequence(),
            detections.len()
        );
        Ok(DetectionResult {
            frame_sequence: frame.sequence(),
            detections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use std::time::Instant;

    /// Replays a fixed output and remembers the tensor it was given
    struct Canned {
        output: ModelOutput,
        seen_len: usize,
    }

    impl InferenceBackend for Canned {
        fn forward(&mut self, input: &[f32], _size: u32) -> Result<ModelOutput, DetectorError> {
            self.seen_len = input.len();
            Ok(self.output.clone())
        }
    }

    /// Build an output from `(cx, cy, w, h, class scores)` anchors
    fn output(anchors: &[(f32, f32, f32, f32, [f32; 2])]) -> ModelOutput {
        let n = anchors.len();
        let mut data = vec![0f32; 6 * n];
        for (i, (cx, cy, w, h, scores)) in anchors.iter().enumerate() {
            data[i] = *cx;
            data[n + i] = *cy;
            data[2 * n + i] = *w;
            data[3 * n + i] = *h;
            data[4 * n + i] = scores[0];
            data[5 * n + i] = scores[1];
        }
        ModelOutput {
            data,
            num_classes: 2,
            anchors: n,
        }
    }

    fn params(input_size: u32) -> YoloParams {
        YoloParams {
            input_size,
            ..YoloParams::default()
        }
    }

    #[test]
    fn letterbox_pads_the_short_side() {
        let lb = Letterbox::new(640, 480, 640);
        assert_eq!(lb.scale, 1.0);
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 80.0));

        let bbox = lb.to_frame(320.0, 320.0, 100.0, 100.0);
        assert_eq!(bbox, BoundingBox { x0: 270.0, y0: 190.0, x1: 370.0, y1: 290.0 });
    }

    #[test]
    fn preprocess_fills_padding_and_normalizes() {
        let frame = Frame::new(vec![255u8; 8 * 4 * 3], 1, 8, 4, PixelFormat::Rgb24, Instant::now());
        let detector = YoloDetector::new(
            Canned { output: output(&[]), seen_len: 0 },
            params(8),
        );
        let (tensor, lb) = detector.preprocess(&frame).unwrap();
        assert_eq!(tensor.len(), 3 * 8 * 8);
        assert_eq!(lb.pad_y, 2.0);
        // Top row is padding, middle row is the white frame
        assert!((tensor[0] - 114.0 / 255.0).abs() < 1e-6);
        assert!((tensor[4 * 8] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn decode_thresholds_and_suppresses() {
        let detector = YoloDetector::new(
            Canned { output: output(&[]), seen_len: 0 },
            params(640),
        );
        let out = output(&[
            (100.0, 100.0, 50.0, 50.0, [0.9, 0.1]),
            (102.0, 100.0, 50.0, 50.0, [0.8, 0.1]), // overlaps the first, same class
            (104.0, 100.0, 50.0, 50.0, [0.1, 0.7]), // overlaps but other class
            (400.0, 400.0, 50.0, 50.0, [0.2, 0.1]), // below threshold
        ]);
        let lb = Letterbox::new(640, 640, 640);
        let detections = detector.decode(&out, &lb).unwrap();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_id, 0);
        assert!((detections[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(detections[1].class_id, 1);
    }

    #[test]
    fn decode_rejects_misshapen_output() {
        let detector = YoloDetector::new(
            Canned { output: output(&[]), seen_len: 0 },
            params(640),
        );
        let bad = ModelOutput { data: vec![0.0; 5], num_classes: 2, anchors: 1 };
        let lb = Letterbox::new(640, 640, 640);
        assert!(matches!(detector.decode(&bad, &lb), Err(DetectorError::Backend(_))));
    }

    #[test]
    fn infer_runs_backend_on_letterboxed_tensor() {
        let frame = Frame::new(vec![0u8; 64 * 48 * 3], 7, 64, 48, PixelFormat::Rgb24, Instant::now());
        let canned = Canned {
            output: output(&[(32.0, 32.0, 10.0, 10.0, [0.0, 0.95])]),
            seen_len: 0,
        };
        let mut detector = YoloDetector::new(canned, params(64));
        let result = detector.infer(&frame).unwrap();

        assert_eq!(detector.backend.seen_len, 3 * 64 * 64);
        assert_eq!(result.frame_sequence, 7);
        assert_eq!(result.detections.len(), 1);
        assert_eq!(result.detections[0].class_id, 1);
    }

    #[test]
    fn compressed_frames_are_rejected() {
        let frame = Frame::new(vec![0u8; 4], 1, 2, 2, PixelFormat::Mjpeg, Instant::now());
        let mut detector = YoloDetector::new(
            Canned { output: output(&[]), seen_len: 0 },
            params(32),
        );
        assert!(matches!(detector.infer(&frame), Err(DetectorError::InvalidFrame(_))));
    }
}
