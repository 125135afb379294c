//! Hornet watch: camera capture with detection-triggered recording

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use hornet_watch::capture::{
    CameraProfiles, FrameSource, TestPattern, TestPatternSource, V4l2Source,
};
use hornet_watch::detect::MotionDetector;
use hornet_watch::pipeline::{Pipeline, PipelineEvent};
use hornet_watch::record::{MemorySinkFactory, SinkFactory};
use hornet_watch::{utils, CaptureConfig, Config};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file, layered over the built-in defaults
    #[arg(long)]
    config: Option<PathBuf>,
    /// Use a synthetic moving pattern instead of a camera
    #[arg(long, default_value_t = false)]
    test_source: bool,
    /// Capture device, e.g. /dev/video0
    #[arg(long)]
    device: Option<String>,
    /// Camera model whose profile properties are applied at open time
    #[arg(long)]
    camera_model: Option<String>,
    /// Directory recordings are written into
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Run the state machine without encoding any video
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.capture.device.path = device.clone();
        }
        if let Some(model) = &self.camera_model {
            config.capture.camera_model = Some(model.clone());
        }
        if let Some(dir) = &self.output_dir {
            config.recording.output_dir = dir.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hornet_watch=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();
    info!("Hornet watch launching...");

    // Load configuration
    let mut config = Config::load(args.config.as_deref()).wrap_err("Failed to load configuration")?;
    args.apply(&mut config);
    apply_camera_profile(&mut config.capture)?;
    hornet_watch::CONFIG.store(Arc::new(config.clone()));

    std::fs::create_dir_all(&config.recording.output_dir).wrap_err_with(|| {
        format!(
            "Failed to create output directory {}",
            config.recording.output_dir.display()
        )
    })?;

    let source = open_source(&mut config, args.test_source)?;
    let detector = MotionDetector::new(config.detection.motion.clone());
    let factory = sink_factory(&config, args.dry_run)?;

    let (events_tx, events_rx) = flume::bounded::<PipelineEvent>(config.pipeline.event_capacity);
    let mut pipeline = Pipeline::start(source, detector, factory, Arc::new(events_tx), &config)?;
    let finished = pipeline.finished();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = finished.recv_async() => {
                info!("Capture source ended");
                break;
            }
            event = events_rx.recv_async() => match event {
                Ok(event) => log_event(event),
                Err(_) => break,
            },
        }
    }

    // Joining the pipeline threads blocks
    let report = tokio::task::spawn_blocking(move || pipeline.stop()).await?;
    for event in events_rx.drain() {
        log_event(event);
    }

    info!(
        "Hornet watch shutting down: {} frames captured, {} processed, {} dropped",
        report.frames_captured, report.frames_processed, report.queue.dropped
    );
    Ok(())
}

fn open_source(config: &mut Config, test_source: bool) -> Result<Box<dyn FrameSource>> {
    let capture = &mut config.capture;
    if test_source {
        let interval = Duration::from_secs_f64(1.0 / f64::from(capture.fps.max(1)));
        let pattern = TestPattern::MovingBox {
            background: 128,
            foreground: 230,
            size: capture.height / 4,
        };
        let source = TestPatternSource::new(capture.width, capture.height, capture.fps as f32, pattern)
            .with_pace(interval);
        return Ok(Box::new(source));
    }

    // Auto-detect capture device if needed
    if capture.device.path.is_empty() {
        let device = utils::auto_detect_device().ok_or_else(|| eyre!("No suitable capture device found"))?;
        capture.format = device.format;
        capture.device = device;
    }
    info!("Using capture device: {:?}", capture.device);

    let source = V4l2Source::open(capture.clone())
        .wrap_err_with(|| format!("Failed to open capture device {}", capture.device.path))?;
    Ok(Box::new(source))
}

/// Merge the selected camera model's property values under the configured ones
fn apply_camera_profile(capture: &mut CaptureConfig) -> Result<()> {
    let Some(model) = capture.camera_model.as_deref() else {
        return Ok(());
    };
    let Some(path) = capture.profiles_path.as_deref() else {
        warn!("Camera model {} selected but no profiles file configured", model);
        return Ok(());
    };

    let profiles = CameraProfiles::load(path)?;
    let profile = profiles.model(model)?;
    if !profile.resolutions.is_empty() && !profile.supports_resolution(capture.width, capture.height) {
        warn!(
            "{} does not list {}x{} among its resolutions",
            model, capture.width, capture.height
        );
    }

    let mut properties = profile.property_values();
    properties.extend(capture.properties.iter().map(|(p, v)| (*p, *v)));
    info!("Applying {} properties from the {} profile", properties.len(), model);
    capture.properties = properties;
    Ok(())
}

fn sink_factory(config: &Config, dry_run: bool) -> Result<Box<dyn SinkFactory>> {
    if dry_run {
        info!("Dry run: sessions are tracked but no video is encoded");
        return Ok(Box::new(MemorySinkFactory::new()));
    }

    #[cfg(feature = "gstreamer-pipeline")]
    let factory: Box<dyn SinkFactory> = Box::new(hornet_watch::record::GstSinkFactory::new(
        config.gstreamer.clone(),
    )?);

    #[cfg(not(feature = "gstreamer-pipeline"))]
    let factory: Box<dyn SinkFactory> = {
        let _ = config;
        warn!("Built without GStreamer, recordings will not be encoded");
        Box::new(MemorySinkFactory::new())
    };

    Ok(factory)
}

fn log_event(event: PipelineEvent) {
    match event {
        PipelineEvent::Frame { frame, hit: true, detections } => debug!(
            "Hit on frame {}: {} detections",
            frame.sequence(),
            detections.detections.len()
        ),
        PipelineEvent::Frame { .. } => {}
        PipelineEvent::Fps(fps) => debug!("Capture rate {:.1} fps", fps),
        PipelineEvent::SessionOpened(path) => info!("Recording {}", path.display()),
        PipelineEvent::SessionClosed { path, frames, reason } => info!(
            "Saved {} ({} frames, {:?})",
            path.display(),
            frames,
            reason
        ),
    }
}
