//! V4L2 camera source with memory-mapped buffers

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{self, Control, Description, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::decoder;
use super::frame::{Frame, FrameMetadata, PixelFormat};
use super::{CameraProperty, FrameSource, Negotiated};
use crate::error::CameraError;
use crate::CaptureConfig;

/// Consecutive undecodable buffers tolerated before a read is reported as failed
const MAX_CORRUPT_FRAMES: u32 = 5;

/// V4L2 capture device
pub struct V4l2Source {
    config: CaptureConfig,
    stream: Option<MmapStream<'static>>,
    device: Option<Box<Device>>,
    negotiated: Option<Negotiated>,
    controls: Vec<Description>,
    sequence: u64,
}

/// An opened device with its stream, before it is installed into a source
struct OpenDevice {
    device: Box<Device>,
    stream: MmapStream<'static>,
    negotiated: Negotiated,
    controls: Vec<Description>,
}

impl V4l2Source {
    /// Open the configured device and start streaming
    #[instrument(skip(config), fields(device = %config.device.path))]
    pub fn open(config: CaptureConfig) -> Result<Self, CameraError> {
        let opened = open_device(&config)?;
        let mut source = Self {
            config,
            stream: None,
            device: None,
            negotiated: None,
            controls: Vec::new(),
            sequence: 0,
        };
        source.install(opened);
        source.apply_properties();
        Ok(source)
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    fn install(&mut self, opened: OpenDevice) {
        self.device = Some(opened.device);
        self.stream = Some(opened.stream);
        self.negotiated = Some(opened.negotiated);
        self.controls = opened.controls;
    }

    /// Re-apply the configured property map to a freshly opened device
    fn apply_properties(&mut self) {
        let properties: Vec<(CameraProperty, i32)> = self
            .config
            .properties
            .iter()
            .map(|(p, v)| (*p, *v))
            .collect();
        for (property, value) in properties {
            match self.set_property(property, value) {
                Ok(true) => {}
                Ok(false) => debug!("Device does not expose {}", property),
                Err(e) => warn!("Could not apply {}={}: {}", property, value, e),
            }
        }
    }

    fn release(&mut self) {
        // The stream must go before the device it was created from
        self.stream.take();
        if self.device.take().is_some() {
            info!("Released capture device {}", self.config.device.path);
        }
        self.negotiated = None;
        self.controls.clear();
    }
}

fn fourcc_for(format: PixelFormat) -> Result<FourCC, CameraError> {
    match format {
        PixelFormat::Mjpeg => Ok(FourCC::new(b"MJPG")),
        PixelFormat::Yuyv4 => Ok(FourCC::new(b"YUYV")),
        PixelFormat::Rgb24 => Ok(FourCC::new(b"RGB3")),
        PixelFormat::Bgr24 => Ok(FourCC::new(b"BGR3")),
        PixelFormat::Gray8 => Ok(FourCC::new(b"GREY")),
    }
}

fn open_device(config: &CaptureConfig) -> Result<OpenDevice, CameraError> {
    let path = &config.device.path;
    let unavailable = |reason: String| CameraError::DeviceUnavailable {
        path: path.clone(),
        reason,
    };

    let device = Device::with_path(path).map_err(|e| unavailable(e.to_string()))?;
    let caps = device.query_caps().map_err(|e| unavailable(e.to_string()))?;
    info!("Device: {} ({})", caps.card, caps.driver);

    if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
        return Err(unavailable("device doesn't support video capture".into()));
    }

    let requested = fourcc_for(config.format)?;
    let mut fmt = device.format()?;
    fmt.width = config.width;
    fmt.height = config.height;
    fmt.fourcc = requested;
    let actual = device
        .set_format(&fmt)
        .map_err(|e| CameraError::UnsupportedConfig(e.to_string()))?;

    if actual.fourcc != requested {
        return Err(CameraError::UnsupportedConfig(format!(
            "requested {} but driver chose {}",
            requested, actual.fourcc
        )));
    }
    if actual.width != config.width || actual.height != config.height {
        warn!(
            "Driver clamped {}x{} to {}x{}",
            config.width, config.height, actual.width, actual.height
        );
    }

    let params = device
        .set_params(&Parameters::with_fps(config.fps))
        .map_err(|e| CameraError::UnsupportedConfig(e.to_string()))?;
    let fps = if params.interval.numerator > 0 {
        params.interval.denominator as f32 / params.interval.numerator as f32
    } else {
        config.fps as f32
    };

    let controls = device.query_controls().unwrap_or_else(|e| {
        warn!("Could not enumerate controls: {}", e);
        Vec::new()
    });

    let stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)
        .map_err(|e| unavailable(format!("stream setup: {e}")))?;

    info!(
        "Actual resolution: {}x{}, actual FPS: {:.1}",
        actual.width, actual.height, fps
    );

    Ok(OpenDevice {
        device: Box::new(device),
        stream,
        negotiated: Negotiated {
            width: actual.width,
            height: actual.height,
            fps,
            format: config.format,
        },
        controls,
    })
}

impl FrameSource for V4l2Source {
    fn read(&mut self) -> Result<Frame, CameraError> {
        let negotiated = self.negotiated.ok_or(CameraError::Closed)?;
        let stream = self.stream.as_mut().ok_or(CameraError::Closed)?;

        let mut corrupt = 0;
        loop {
            let timestamp = Instant::now();
            let (buf, meta) = stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;

            let used = (meta.bytesused as usize).min(buf.len());
            if used == 0 {
                return Err(CameraError::CaptureFailed("empty buffer".into()));
            }

            let decoded = decoder::decode_frame(
                &buf[..used],
                negotiated.format,
                negotiated.width,
                negotiated.height,
            );
            let (pixels, format) = match decoded {
                Ok(decoded) => decoded,
                Err(e) if corrupt < MAX_CORRUPT_FRAMES => {
                    corrupt += 1;
                    warn!("Skipping undecodable frame: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.sequence += 1;
            let meta = Arc::new(FrameMetadata {
                sequence: self.sequence,
                width: negotiated.width,
                height: negotiated.height,
                stride: negotiated.width * format.bytes_per_pixel().unwrap_or(1),
                format,
                device_timestamp: Some(
                    Duration::from_secs(meta.timestamp.sec as u64)
                        + Duration::from_micros(meta.timestamp.usec as u64),
                ),
            });

            return Ok(Frame {
                data: Bytes::from(pixels),
                meta,
                timestamp,
            });
        }
    }

    #[instrument(skip(self), fields(device = %self.config.device.path))]
    fn reconfigure(&mut self, width: u32, height: u32) -> Result<Negotiated, CameraError> {
        let previous = self.config.clone();
        self.release();

        let mut next = previous.clone();
        next.width = width;
        next.height = height;

        match open_device(&next) {
            Ok(opened) => {
                self.config = next;
                self.install(opened);
                self.apply_properties();
                self.negotiated.ok_or(CameraError::Closed)
            }
            Err(e) => {
                warn!("Reconfiguration to {}x{} failed: {}", width, height, e);
                match open_device(&previous) {
                    Ok(opened) => {
                        info!("Restored {}x{}", previous.width, previous.height);
                        self.install(opened);
                        self.apply_properties();
                    }
                    Err(restore) => {
                        warn!("Could not restore previous configuration: {}", restore);
                    }
                }
                Err(e)
            }
        }
    }

    fn set_property(&mut self, property: CameraProperty, value: i32) -> Result<bool, CameraError> {
        let device = self.device.as_ref().ok_or(CameraError::Closed)?;
        let Some(description) = self.controls.iter().find(|c| c.id == property.v4l2_id()) else {
            return Ok(false);
        };

        let clamped = (value as i64).clamp(description.minimum, description.maximum);
        let control_value = if description.typ == control::Type::Boolean || property.is_toggle() {
            Value::Boolean(clamped != 0)
        } else {
            Value::Integer(clamped)
        };

        device
            .set_control(Control {
                id: description.id,
                value: control_value,
            })
            .map_err(|e| CameraError::PropertyRejected {
                property: property.to_string(),
                value,
                reason: e.to_string(),
            })?;

        debug!("Set {} to {}", property, clamped);
        self.config.properties.insert(property, clamped as i32);
        Ok(true)
    }

    fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated
    }

    fn close(&mut self) {
        self.release();
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        self.release();
    }
}
