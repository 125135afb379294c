pub mod capture;
pub mod detect;
pub mod error;
pub mod pipeline;
pub mod record;
pub mod utils;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use capture::{CameraProperty, PixelFormat};
use detect::motion::MotionParams;
use detect::{TargetClasses, YoloParams};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::utils::FoundDevice;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Prefix of environment overrides, e.g. `HORNET__CAPTURE__WIDTH=1280`
pub const ENV_PREFIX: &str = "HORNET";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub detection: DetectionConfig,
    pub recording: RecordingConfig,
    pub brightness: BrightnessConfig,
    #[cfg(feature = "gstreamer-pipeline")]
    pub gstreamer: GStreamerConfig,
}

impl Config {
    /// Defaults, overlaid by an optional TOML file, overlaid by `HORNET__*`
    /// environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// An empty path asks for auto-detection
    pub device: FoundDevice,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Model name looked up in `profiles_path`
    pub camera_model: Option<String>,
    pub profiles_path: Option<PathBuf>,
    /// Applied at open time, after the profile values
    pub properties: BTreeMap<CameraProperty, i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on how long the processing loop waits for a frame
    pub pop_timeout_ms: u64,
    pub fps_window_ms: u64,
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub target_classes: Vec<u32>,
    pub min_confidence: f32,
    pub yolo: YoloParams,
    pub motion: MotionParams,
}

impl DetectionConfig {
    pub fn targets(&self) -> TargetClasses {
        TargetClasses::new(self.target_classes.iter().copied(), self.min_confidence)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Must already exist
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub max_duration_secs: u64,
    pub cooldown_secs: u64,
    /// Close an open session as soon as the scene goes dark
    pub abort_on_darkness: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrightnessConfig {
    /// Mean luma (0..255) at or above which recording is armed
    pub threshold: f64,
    pub period_secs: u64,
    pub warmup_poll_ms: u64,
    /// Armed state before the first measurement
    pub start_armed: bool,
}

#[cfg(feature = "gstreamer-pipeline")]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GStreamerConfig {
    /// Force an encoder element instead of probing for one
    pub encoder: Option<String>,
    pub container: Container,
    pub bitrate_kbps: u32,
    pub finalize_timeout_secs: u64,
}

#[cfg(feature = "gstreamer-pipeline")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Matroska,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: FoundDevice::new("/dev/video0".into(), PixelFormat::Mjpeg),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            camera_model: None,
            profiles_path: None,
            properties: BTreeMap::new(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pop_timeout_ms: 100,
            fps_window_ms: 1000,
            event_capacity: 64,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            target_classes: vec![0, 1],
            min_confidence: 0.25,
            yolo: YoloParams::default(),
            motion: MotionParams::default(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            file_prefix: "hornet".into(),
            max_duration_secs: 60,
            cooldown_secs: 10,
            abort_on_darkness: false,
        }
    }
}

impl Default for BrightnessConfig {
    fn default() -> Self {
        Self {
            threshold: 50.0,
            period_secs: 300,
            warmup_poll_ms: 1000,
            start_armed: false,
        }
    }
}

#[cfg(feature = "gstreamer-pipeline")]
impl Default for GStreamerConfig {
    fn default() -> Self {
        Self {
            encoder: None,
            container: Container::Mp4,
            bitrate_kbps: 4000,
            finalize_timeout_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[capture]
width = 1280
height = 720
format = "Yuyv4"

[capture.device]
path = "/dev/video2"
format = "Yuyv4"

[capture.properties]
brightness = 12
focus_auto = 0

[recording]
max_duration_secs = 45
abort_on_darkness = true
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!((config.capture.width, config.capture.height), (1280, 720));
        assert_eq!(config.capture.format, PixelFormat::Yuyv4);
        assert_eq!(config.capture.device.path, "/dev/video2");
        assert_eq!(config.capture.fps, 30);
        assert_eq!(config.capture.properties.get(&CameraProperty::Brightness), Some(&12));
        assert_eq!(config.capture.properties.get(&CameraProperty::FocusAuto), Some(&0));
        assert_eq!(config.recording.max_duration_secs, 45);
        assert!(config.recording.abort_on_darkness);
        assert_eq!(config.recording.file_prefix, "hornet");
        assert_eq!(config.brightness.threshold, 50.0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let missing = Path::new("/nonexistent/hornet-watch.toml");
        assert!(matches!(Config::load(Some(missing)), Err(ConfigError::Load(_))));
    }

    #[test]
    fn default_targets_are_hornet_classes() {
        let targets = DetectionConfig::default().targets();
        assert_eq!(targets.classes.iter().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(targets.min_confidence, 0.25);
    }
}
