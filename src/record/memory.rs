//! In-memory sink: keeps per-clip bookkeeping instead of encoding video.
//! Backs `--dry-run` and the test suites.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{SinkFactory, VideoSink};
use crate::capture::Frame;
use crate::error::RecorderError;

#[derive(Debug, Clone, Default)]
pub struct RecordedClip {
    pub path: PathBuf,
    pub fps: f32,
    pub width: u32,
    pub height: u32,
    /// Sequence numbers of the frames written, in order
    pub frames: Vec<u64>,
    pub closes: usize,
}

impl RecordedClip {
    pub fn is_closed(&self) -> bool {
        self.closes > 0
    }
}

type Clips = Arc<Mutex<Vec<RecordedClip>>>;

fn lock(clips: &Clips) -> MutexGuard<'_, Vec<RecordedClip>> {
    clips.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    clips: Clips,
    fail_open: bool,
    fail_write_after: Option<usize>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `open` fails
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Writes fail once a clip holds `frames` frames
    pub fn failing_write_after(mut self, frames: usize) -> Self {
        self.fail_write_after = Some(frames);
        self
    }

    /// Snapshot of every clip opened so far
    pub fn clips(&self) -> Vec<RecordedClip> {
        lock(&self.clips).clone()
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(
        &mut self,
        path: &Path,
        fps: f32,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoSink>, RecorderError> {
        if self.fail_open {
            return Err(RecorderError::Open {
                path: path.to_path_buf(),
                reason: "sink configured to fail".into(),
            });
        }
        let mut clips = lock(&self.clips);
        clips.push(RecordedClip {
            path: path.to_path_buf(),
            fps,
            width,
            height,
            ..RecordedClip::default()
        });
        Ok(Box::new(MemorySink {
            clips: self.clips.clone(),
            index: clips.len() - 1,
            fail_write_after: self.fail_write_after,
            closed: false,
        }))
    }

    fn extension(&self) -> &str {
        "mp4"
    }
}

struct MemorySink {
    clips: Clips,
    index: usize,
    fail_write_after: Option<usize>,
    closed: bool,
}

impl VideoSink for MemorySink {
    fn write(&mut self, frame: &Frame) -> Result<(), RecorderError> {
        if self.closed {
            return Err(RecorderError::Write("sink closed".into()));
        }
        let mut clips = lock(&self.clips);
        let clip = &mut clips[self.index];
        if self.fail_write_after.is_some_and(|n| clip.frames.len() >= n) {
            return Err(RecorderError::Write("sink configured to fail".into()));
        }
        if (frame.width(), frame.height()) != (clip.width, clip.height) {
            return Err(RecorderError::Write(format!(
                "frame is {}x{}, sink expects {}x{}",
                frame.width(),
                frame.height(),
                clip.width,
                clip.height
            )));
        }
        clip.frames.push(frame.sequence());
        Ok(())
    }

    fn close(&mut self) -> Result<(), RecorderError> {
        if !std::mem::replace(&mut self.closed, true) {
            lock(&self.clips)[self.index].closes += 1;
        }
        Ok(())
    }
}
