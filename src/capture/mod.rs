pub mod decoder;
pub mod frame;
pub mod profile;
pub mod properties;
pub mod test_source;
pub mod v4l2;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use profile::{CameraProfile, CameraProfiles};
pub use properties::CameraProperty;
pub use test_source::{TestPattern, TestPatternSource};
pub use v4l2::V4l2Source;

use crate::error::CameraError;

/// Format the driver actually agreed to, which may differ from the request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Negotiated {
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub format: PixelFormat,
}

/// A camera that produces decoded frames on demand.
///
/// Sources are owned by exactly one thread at a time; they are moved into the
/// acquisition loop and handed back when it exits.
pub trait FrameSource: Send {
    /// Block until the next frame is available
    fn read(&mut self) -> Result<Frame, CameraError>;

    /// Close and reopen the device at a new resolution, keeping the other
    /// settings. On failure the source is either back at its previous
    /// configuration or closed.
    fn reconfigure(&mut self, width: u32, height: u32) -> Result<Negotiated, CameraError>;

    /// Apply a device property. `Ok(false)` means the device does not expose it.
    fn set_property(&mut self, property: CameraProperty, value: i32) -> Result<bool, CameraError>;

    fn negotiated(&self) -> Option<Negotiated>;

    /// Release the device. Idempotent.
    fn close(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read(&mut self) -> Result<Frame, CameraError> {
        (**self).read()
    }

    fn reconfigure(&mut self, width: u32, height: u32) -> Result<Negotiated, CameraError> {
        (**self).reconfigure(width, height)
    }

    fn set_property(&mut self, property: CameraProperty, value: i32) -> Result<bool, CameraError> {
        (**self).set_property(property, value)
    }

    fn negotiated(&self) -> Option<Negotiated> {
        (**self).negotiated()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
