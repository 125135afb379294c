#![allow(dead_code)]

use std::sync::Arc;

use flume::Receiver;
use hornet_watch::capture::Frame;
use hornet_watch::detect::{BoundingBox, Detection, DetectionResult, Detector, TargetClasses};
use hornet_watch::error::DetectorError;
use hornet_watch::pipeline::{
    ArmGate, FpsGauge, FrameProcessor, LatestFrame, PipelineEvent, RecordingController,
};
use hornet_watch::record::MemorySinkFactory;
use hornet_watch::RecordingConfig;

/// Reports a hornet whenever the script says so for the frame's sequence number
pub struct ScriptedDetector {
    hit: fn(u64) -> bool,
}

impl ScriptedDetector {
    pub fn new(hit: fn(u64) -> bool) -> Self {
        Self { hit }
    }
}

impl Detector for ScriptedDetector {
    fn infer(&mut self, frame: &Frame) -> Result<DetectionResult, DetectorError> {
        let detections = if (self.hit)(frame.sequence()) {
            vec![Detection {
                class_id: 0,
                bbox: BoundingBox {
                    x0: 10.0,
                    y0: 10.0,
                    x1: 60.0,
                    y1: 40.0,
                },
                confidence: 0.9,
            }]
        } else {
            Vec::new()
        };
        Ok(DetectionResult {
            frame_sequence: frame.sequence(),
            detections,
        })
    }
}

pub struct Harness {
    pub processor: FrameProcessor<ScriptedDetector, MemorySinkFactory>,
    pub factory: MemorySinkFactory,
    pub gate: Arc<ArmGate>,
    pub latest: Arc<LatestFrame>,
    pub events: Receiver<PipelineEvent>,
}

/// Single-threaded processing stage wired to an in-memory sink
pub fn harness(hit: fn(u64) -> bool, armed: bool, recording: RecordingConfig) -> Harness {
    let factory = MemorySinkFactory::new();
    let gate = Arc::new(ArmGate::new(armed));
    let latest = Arc::new(LatestFrame::default());
    let (tx, events) = flume::unbounded::<PipelineEvent>();
    let controller = RecordingController::new(factory.clone(), gate.clone(), recording, 25.0);
    let processor = FrameProcessor::new(
        ScriptedDetector::new(hit),
        TargetClasses::default(),
        controller,
        latest.clone(),
        Arc::new(FpsGauge::default()),
        Arc::new(tx),
    );
    Harness {
        processor,
        factory,
        gate,
        latest,
        events,
    }
}

pub fn session_events(events: &Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    events
        .try_iter()
        .filter(|e| {
            matches!(
                e,
                PipelineEvent::SessionOpened(_) | PipelineEvent::SessionClosed { .. }
            )
        })
        .collect()
}
