//! Per-frame work of the processing thread: detect, gate, record, report

use std::sync::Arc;
use std::time::Instant;

use tracing::{trace, warn};

use super::controller::{RecordingController, Transition};
use super::fps::FpsGauge;
use super::monitor::LatestFrame;
use super::{PipelineEvent, PipelineObserver};
use crate::capture::Frame;
use crate::detect::{DetectionResult, Detector, TargetClasses};
use crate::record::SinkFactory;

pub struct FrameProcessor<D, F> {
    detector: D,
    targets: TargetClasses,
    controller: RecordingController<F>,
    latest: Arc<LatestFrame>,
    fps: Arc<FpsGauge>,
    observer: Arc<dyn PipelineObserver>,
    processed: u64,
}

impl<D: Detector, F: SinkFactory> FrameProcessor<D, F> {
    pub fn new(
        detector: D,
        targets: TargetClasses,
        controller: RecordingController<F>,
        latest: Arc<LatestFrame>,
        fps: Arc<FpsGauge>,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            detector,
            targets,
            controller,
            latest,
            fps,
            observer,
            processed: 0,
        }
    }

    /// Run one frame through detection and the recording state machine.
    /// Returns whether the frame counted as a hit.
    pub fn process(&mut self, frame: Frame) -> bool {
        self.processed += 1;
        self.latest.store(frame.clone());

        let started = Instant::now();
        let inferred = self.detector.infer(&frame);
        metrics::histogram!("inference_time_us").record(started.elapsed().as_micros() as f64);

        let (detections, hit) = match inferred {
            Ok(detections) => {
                let hit = self.targets.is_hit(&detections);
                if hit {
                    trace!("Frame {} is a hit: {:?}", frame.sequence(), detections.detections);
                }
                match self.controller.on_frame(hit, &frame, self.fps.get()) {
                    Ok(transition) => self.report(transition),
                    Err(e) => warn!("Recording failed on frame {}: {}", frame.sequence(), e),
                }
                (detections, hit)
            }
            Err(e) => {
                // The frame has no recording side effects
                warn!("Inference failed on frame {}: {}", frame.sequence(), e);
                metrics::counter!("inference_errors_total").increment(1);
                let empty = DetectionResult {
                    frame_sequence: frame.sequence(),
                    detections: Vec::new(),
                };
                (empty, false)
            }
        };

        self.observer.notify(PipelineEvent::Frame {
            frame,
            detections,
            hit,
        });
        hit
    }

    pub(crate) fn report(&self, transition: Transition) {
        match transition {
            Transition::SessionOpened { path } => {
                self.observer.notify(PipelineEvent::SessionOpened(path))
            }
            Transition::SessionClosed {
                path,
                frames,
                reason,
                reopened,
            } => {
                self.observer.notify(PipelineEvent::SessionClosed {
                    path,
                    frames,
                    reason,
                });
                if let Some(path) = reopened {
                    self.observer.notify(PipelineEvent::SessionOpened(path));
                }
            }
            Transition::Idle | Transition::FrameWritten => {}
        }
    }

    pub fn controller(&self) -> &RecordingController<F> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut RecordingController<F> {
        &mut self.controller
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }
}
