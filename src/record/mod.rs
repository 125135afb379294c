//! Recording sessions and the sinks they write into

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_sink;
pub mod memory;

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::capture::Frame;
use crate::error::RecorderError;

#[cfg(feature = "gstreamer-pipeline")]
pub use gst_sink::GstSinkFactory;
pub use memory::{MemorySinkFactory, RecordedClip};

/// An open video file (or stand-in) receiving frames of one session
pub trait VideoSink: Send {
    fn write(&mut self, frame: &Frame) -> Result<(), RecorderError>;

    /// Flush and release. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), RecorderError>;
}

/// Opens sinks sized for a session
pub trait SinkFactory: Send {
    fn open(
        &mut self,
        path: &Path,
        fps: f32,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoSink>, RecorderError>;

    /// File extension of the container this factory writes
    fn extension(&self) -> &str;
}

impl<F: SinkFactory + ?Sized> SinkFactory for Box<F> {
    fn open(
        &mut self,
        path: &Path,
        fps: f32,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoSink>, RecorderError> {
        (**self).open(path, fps, width, height)
    }

    fn extension(&self) -> &str {
        (**self).extension()
    }
}

#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub path: PathBuf,
    /// Timestamp of the triggering frame
    pub started_at: Instant,
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub frames_written: u64,
}

/// `<dir>/<prefix>_<YYYYMMDD-HHMMSS>.<ext>`
pub fn session_path(dir: &Path, prefix: &str, extension: &str, at: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "{}_{}.{}",
        prefix,
        at.format("%Y%m%d-%H%M%S"),
        extension
    ))
}

/// Suffix `_1`, `_2`, ... onto `base` until it names neither an existing
/// file nor the previous session's path
pub fn unique_path(base: PathBuf, previous: Option<&Path>) -> PathBuf {
    let taken = |p: &Path| p.exists() || previous == Some(p);
    if !taken(&base) {
        return base;
    }
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = base
        .extension()
        .map(|e| e.to_string_lossy().into_owned());
    (1u32..)
        .map(|n| {
            let name = match &extension {
                Some(ext) => format!("{}_{}.{}", stem, n, ext),
                None => format!("{}_{}", stem, n),
            };
            base.with_file_name(name)
        })
        .find(|p| !taken(p))
        .unwrap_or(base)
}

/// Owns the sink of one recording session
pub struct Recorder {
    session: RecordingSession,
    sink: Option<Box<dyn VideoSink>>,
}

impl Recorder {
    /// Open a sink sized to the triggering frame. The frame itself is not written.
    /// `previous` is the last session's path, which is never reused.
    pub fn open<F: SinkFactory + ?Sized>(
        factory: &mut F,
        dir: &Path,
        prefix: &str,
        fps: f32,
        trigger: &Frame,
        previous: Option<&Path>,
    ) -> Result<Self, RecorderError> {
        let path = unique_path(
            session_path(dir, prefix, factory.extension(), Local::now()),
            previous,
        );
        let (width, height) = (trigger.width(), trigger.height());
        let sink = factory.open(&path, fps, width, height)?;
        info!(
            "Recording to {} ({}x{} @ {:.1} fps)",
            path.display(),
            width,
            height,
            fps
        );
        metrics::counter!("recording_sessions_total").increment(1);

        Ok(Self {
            session: RecordingSession {
                path,
                started_at: trigger.timestamp,
                width,
                height,
                fps,
                frames_written: 0,
            },
            sink: Some(sink),
        })
    }

    pub fn session(&self) -> &RecordingSession {
        &self.session
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    pub fn write(&mut self, frame: &Frame) -> Result<(), RecorderError> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| RecorderError::Write("session already closed".into()))?;
        sink.write(frame)?;
        self.session.frames_written += 1;
        Ok(())
    }

    /// Flush then release the sink; later calls do nothing
    pub fn close(&mut self) -> Result<(), RecorderError> {
        let Some(mut sink) = self.sink.take() else {
            return Ok(());
        };
        debug!(
            "Closing {} after {} frames",
            self.session.path.display(),
            self.session.frames_written
        );
        sink.close()
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close {}: {}", self.session.path.display(), e);
        }
    }
}
