//! Acquisition, processing and brightness monitoring threads.
//!
//! ```text
//!  FrameSource --read--> [acquisition] --push--> FrameQueue(2) --pop--> [processing]
//!       ^                     |                                     |  detector
//!       | commands            | fps                                 |  controller -> sink
//!       |                     v                                     v
//!   Pipeline handle       FpsGauge                             LatestFrame <-- [monitor]
//!                                                                               |
//!                                                                      ArmGate <-
//! ```

pub mod controller;
pub mod fps;
pub mod monitor;
pub mod processor;
pub mod queue;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use flume::{Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::capture::{CameraProperty, Frame, FrameSource, Negotiated};
use crate::detect::{DetectionResult, Detector};
use crate::error::CameraError;
use crate::record::SinkFactory;
use crate::Config;

pub use controller::{CloseReason, ControllerState, RecordingController, Transition};
pub use fps::{FpsGauge, FpsMeter};
pub use monitor::{ArmGate, BrightnessMonitor, LatestFrame, MonitorDecision};
pub use processor::FrameProcessor;
pub use queue::{FrameQueue, PopError, QueueStats, FRAME_QUEUE_CAPACITY};

/// What the pipeline tells the outside world
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Frame {
        frame: Frame,
        detections: DetectionResult,
        hit: bool,
    },
    Fps(f32),
    SessionOpened(PathBuf),
    SessionClosed {
        path: PathBuf,
        frames: u64,
        reason: CloseReason,
    },
}

/// Receives pipeline events. Called from the pipeline threads, so it must not block.
pub trait PipelineObserver: Send + Sync {
    fn notify(&self, event: PipelineEvent);
}

/// Discards every event
pub struct NullObserver;

impl PipelineObserver for NullObserver {
    fn notify(&self, _event: PipelineEvent) {}
}

impl PipelineObserver for Sender<PipelineEvent> {
    fn notify(&self, event: PipelineEvent) {
        // A slow consumer loses events rather than stalling capture
        let _ = self.try_send(event);
    }
}

/// Requests applied by the acquisition thread between two reads
enum Command {
    Reconfigure {
        width: u32,
        height: u32,
        reply: Sender<Result<Negotiated, CameraError>>,
    },
    SetProperty {
        property: CameraProperty,
        value: i32,
        reply: Sender<Result<bool, CameraError>>,
    },
}

type Processor = FrameProcessor<Box<dyn Detector>, Box<dyn SinkFactory>>;

/// Summary returned by [`Pipeline::stop`]
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    pub frames_captured: u64,
    pub frames_processed: u64,
    pub queue: QueueStats,
    /// Session closed by the shutdown itself, if one was open
    pub closed_session: Option<PathBuf>,
}

pub struct Pipeline {
    running: Arc<AtomicBool>,
    captured: Arc<AtomicU64>,
    queue: FrameQueue,
    commands: Sender<Command>,
    monitor_stop: Option<Sender<()>>,
    finished: Receiver<()>,
    gate: Arc<ArmGate>,
    fps: Arc<FpsGauge>,
    acquisition: Option<JoinHandle<Box<dyn FrameSource>>>,
    processing: Option<JoinHandle<Processor>>,
    monitor: Option<JoinHandle<()>>,
    report: Option<StopReport>,
}

impl Pipeline {
    pub fn start<S, D, F>(
        source: S,
        detector: D,
        factory: F,
        observer: Arc<dyn PipelineObserver>,
        config: &Config,
    ) -> Result<Self, CameraError>
    where
        S: FrameSource + 'static,
        D: Detector + 'static,
        F: SinkFactory + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let captured = Arc::new(AtomicU64::new(0));
        let queue = FrameQueue::new();
        let gate = Arc::new(ArmGate::new(config.brightness.start_armed));
        let latest = Arc::new(LatestFrame::default());
        let fps = Arc::new(FpsGauge::default());
        let (commands, command_rx) = flume::unbounded();
        let (monitor_stop, monitor_stop_rx) = flume::bounded(1);
        let (finished_tx, finished) = flume::bounded::<()>(1);

        let fallback_fps = source
            .negotiated()
            .map(|n| n.fps)
            .unwrap_or(config.capture.fps as f32);
        let factory: Box<dyn SinkFactory> = Box::new(factory);
        let controller =
            RecordingController::new(factory, gate.clone(), config.recording.clone(), fallback_fps);
        let detector: Box<dyn Detector> = Box::new(detector);
        let processor = FrameProcessor::new(
            detector,
            config.detection.targets(),
            controller,
            latest.clone(),
            fps.clone(),
            observer.clone(),
        );

        let acquisition = Acquisition {
            source: Box::new(source),
            queue: queue.clone(),
            commands: command_rx,
            running: running.clone(),
            captured: captured.clone(),
            fps: fps.clone(),
            meter: FpsMeter::new(Duration::from_millis(config.pipeline.fps_window_ms)),
            observer,
        };
        let acquisition = spawn_acquisition(acquisition, finished_tx)?;

        let processing = {
            let queue = queue.clone();
            let running = running.clone();
            let timeout = Duration::from_millis(config.pipeline.pop_timeout_ms);
            let mut processor = processor;
            std::thread::Builder::new()
                .name("processing".into())
                .spawn(move || {
                    processing_loop(&mut processor, &queue, &running, timeout);
                    processor
                })
        };
        let processing = match processing {
            Ok(handle) => handle,
            Err(e) => {
                abandon(&running, acquisition, None);
                return Err(e.into());
            }
        };

        let monitor = BrightnessMonitor::new(latest, gate.clone(), &config.brightness);
        let monitor = match std::thread::Builder::new()
            .name("brightness".into())
            .spawn(move || monitor.run(monitor_stop_rx))
        {
            Ok(handle) => handle,
            Err(e) => {
                abandon(&running, acquisition, Some(processing));
                return Err(e.into());
            }
        };

        info!("Pipeline started");
        Ok(Self {
            running,
            captured,
            queue,
            commands,
            monitor_stop: Some(monitor_stop),
            finished,
            gate,
            fps,
            acquisition: Some(acquisition),
            processing: Some(processing),
            monitor: Some(monitor),
            report: None,
        })
    }

    /// False once the source ended or `stop` was called
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Block until the acquisition loop has exited or `timeout` passes.
    /// Returns whether it exited.
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(
            self.finished.recv_timeout(timeout),
            Err(flume::RecvTimeoutError::Disconnected)
        )
    }

    /// Resolves once the acquisition loop has exited
    pub fn finished(&self) -> Receiver<()> {
        self.finished.clone()
    }

    pub fn gate(&self) -> &Arc<ArmGate> {
        &self.gate
    }

    /// Last measured capture rate
    pub fn fps(&self) -> Option<f32> {
        self.fps.get()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Change the capture resolution. Applied by the acquisition thread between
    /// two reads; the reply is the format the device actually agreed to.
    pub fn reconfigure(&self, width: u32, height: u32) -> Result<Negotiated, CameraError> {
        let (reply, response) = flume::bounded(1);
        self.send(Command::Reconfigure {
            width,
            height,
            reply,
        })?;
        response.recv().map_err(|_| CameraError::Closed)?
    }

    /// Apply a device property. `Ok(false)` means the device does not expose it.
    pub fn set_property(&self, property: CameraProperty, value: i32) -> Result<bool, CameraError> {
        let (reply, response) = flume::bounded(1);
        self.send(Command::SetProperty {
            property,
            value,
            reply,
        })?;
        response.recv().map_err(|_| CameraError::Closed)?
    }

    fn send(&self, command: Command) -> Result<(), CameraError> {
        if !self.is_running() {
            return Err(CameraError::Closed);
        }
        self.commands.send(command).map_err(|_| CameraError::Closed)
    }

    /// Stop all threads, close any open session, then release the source.
    /// Later calls return the same report without doing anything.
    pub fn stop(&mut self) -> StopReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        info!("Stopping pipeline");
        self.running.store(false, Ordering::Release);
        if let Some(stop) = self.monitor_stop.take() {
            let _ = stop.try_send(());
        }

        let mut source = join("acquisition", self.acquisition.take());
        let mut processor = join("processing", self.processing.take());
        join("brightness", self.monitor.take());

        let mut report = StopReport {
            frames_captured: self.captured.load(Ordering::Relaxed),
            queue: self.queue.stats(),
            ..StopReport::default()
        };

        if let Some(processor) = processor.as_mut() {
            report.frames_processed = processor.processed();
            match processor.controller_mut().shutdown() {
                Ok(Some(transition)) => {
                    if let Transition::SessionClosed { path, .. } = &transition {
                        report.closed_session = Some(path.clone());
                    }
                    processor.report(transition);
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to close recording on shutdown: {}", e),
            }
        }
        if let Some(source) = source.as_mut() {
            source.close();
        }

        info!(
            "Pipeline stopped: {} frames captured, {} processed, {} dropped",
            report.frames_captured, report.frames_processed, report.queue.dropped
        );
        self.report = Some(report.clone());
        report
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join<T>(name: &str, handle: Option<JoinHandle<T>>) -> Option<T> {
    let handle = handle?;
    match handle.join() {
        Ok(value) => {
            debug!("{} thread joined", name);
            Some(value)
        }
        Err(_) => {
            error!("{} thread panicked", name);
            None
        }
    }
}

/// Undo a partial start: stop the threads already spawned, close any
/// session they opened and release the source
fn abandon(
    running: &AtomicBool,
    acquisition: JoinHandle<Box<dyn FrameSource>>,
    processing: Option<JoinHandle<Processor>>,
) {
    running.store(false, Ordering::Release);
    if let Some(mut source) = join("acquisition", Some(acquisition)) {
        source.close();
    }
    if let Some(mut processor) = join("processing", processing) {
        if let Err(e) = processor.controller_mut().shutdown() {
            warn!("Failed to close recording: {}", e);
        }
    }
}

/// Clears the running flag however the owning thread exits
struct StopOnExit(Arc<AtomicBool>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn spawn_acquisition(
    mut acquisition: Acquisition,
    finished: Sender<()>,
) -> std::io::Result<JoinHandle<Box<dyn FrameSource>>> {
    std::thread::Builder::new()
        .name("acquisition".into())
        .spawn(move || {
            let _stop = StopOnExit(acquisition.running.clone());
            acquisition.run();
            drop(finished);
            acquisition.source
        })
}

struct Acquisition {
    source: Box<dyn FrameSource>,
    queue: FrameQueue,
    commands: Receiver<Command>,
    running: Arc<AtomicBool>,
    captured: Arc<AtomicU64>,
    fps: Arc<FpsGauge>,
    meter: FpsMeter,
    observer: Arc<dyn PipelineObserver>,
}

impl Acquisition {
    fn run(&mut self) {
        while self.running.load(Ordering::Acquire) {
            while let Ok(command) = self.commands.try_recv() {
                self.apply(command);
            }

            let frame = match self.source.read() {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Capture ended: {}", e);
                    self.running.store(false, Ordering::Release);
                    break;
                }
            };

            self.captured.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("frames_captured_total").increment(1);
            if let Some(fps) = self.meter.tick(frame.timestamp) {
                self.fps.set(fps);
                metrics::gauge!("capture_fps").set(fps as f64);
                self.observer.notify(PipelineEvent::Fps(fps));
            }
            self.queue.push(frame);
        }

        // Callers blocked on a reply must not wait for a thread that is gone
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Reconfigure { reply, .. } => {
                    let _ = reply.send(Err(CameraError::Closed));
                }
                Command::SetProperty { reply, .. } => {
                    let _ = reply.send(Err(CameraError::Closed));
                }
            }
        }
        debug!("Acquisition loop exited");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Reconfigure {
                width,
                height,
                reply,
            } => {
                let result = self.source.reconfigure(width, height);
                match &result {
                    Ok(negotiated) => info!(
                        "Reconfigured to {}x{} @ {:.1} fps",
                        negotiated.width, negotiated.height, negotiated.fps
                    ),
                    Err(e) => warn!("Reconfiguration to {}x{} failed: {}", width, height, e),
                }
                let _ = reply.send(result);
            }
            Command::SetProperty {
                property,
                value,
                reply,
            } => {
                let _ = reply.send(self.source.set_property(property, value));
            }
        }
    }
}

fn processing_loop(
    processor: &mut Processor,
    queue: &FrameQueue,
    running: &AtomicBool,
    timeout: Duration,
) {
    loop {
        match queue.pop(timeout) {
            Ok(frame) => {
                processor.process(frame);
            }
            Err(PopError::Empty) => {
                if !running.load(Ordering::Acquire) {
                    // Frames pushed before acquisition stopped are still processed
                    while let Ok(frame) = queue.pop(Duration::ZERO) {
                        processor.process(frame);
                    }
                    break;
                }
            }
            Err(PopError::Closed) => break,
        }
    }
    debug!("Processing loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{TestPattern, TestPatternSource};

    #[test]
    fn abandoned_start_releases_the_source() {
        let source = TestPatternSource::new(4, 4, 25.0, TestPattern::Solid { luma: 128 })
            .with_pace(Duration::from_millis(1));
        let closes = source.close_counter();
        let running = Arc::new(AtomicBool::new(true));
        let (_commands, command_rx) = flume::unbounded::<Command>();
        let (finished_tx, finished) = flume::bounded::<()>(1);
        let acquisition = Acquisition {
            source: Box::new(source),
            queue: FrameQueue::new(),
            commands: command_rx,
            running: running.clone(),
            captured: Arc::new(AtomicU64::new(0)),
            fps: Arc::new(FpsGauge::default()),
            meter: FpsMeter::new(Duration::from_secs(1)),
            observer: Arc::new(NullObserver),
        };

        let handle = spawn_acquisition(acquisition, finished_tx).unwrap();
        abandon(&running, handle, None);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!running.load(Ordering::Acquire));
        assert!(matches!(
            finished.recv_timeout(Duration::from_millis(10)),
            Err(flume::RecvTimeoutError::Disconnected)
        ));
    }
}
