use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::PixelFormat;

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

impl FoundDevice {
    pub fn new(path: String, format: PixelFormat) -> Self {
        Self { path, format }
    }
}

/// Pick the wire format we would request from a device offering `fourccs`
fn preferred_format(fourccs: &[FourCC]) -> Option<PixelFormat> {
    if fourccs.contains(&FourCC::new(b"MJPG")) {
        Some(PixelFormat::Mjpeg)
    } else if fourccs.contains(&FourCC::new(b"YUYV")) {
        Some(PixelFormat::Yuyv4)
    } else {
        None
    }
}

/// Auto-detect best capture device, preferring MJPEG over YUYV
pub fn auto_detect_device() -> Option<FoundDevice> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        // Metadata nodes share the numbering with capture nodes
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            debug!("Skipping {} ({}): not a capture node", path, caps.card);
            continue;
        }
        let fourccs: Vec<FourCC> = match dev.enum_formats() {
            Ok(formats) => formats.into_iter().map(|f| f.fourcc).collect(),
            Err(_) => continue,
        };
        if let Some(format) = preferred_format(&fourccs) {
            info!("Found {:?} device: {} - {}", format, path, caps.card);
            return Some(FoundDevice { path, format });
        }
    }

    None
}
