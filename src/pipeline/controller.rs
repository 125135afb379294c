//! Detection-driven recording state machine.
//!
//! ```text
//!            arm()                 hit
//!  Waiting ---------> ArmedIdle ---------> Recording
//!     ^  <---------              <---------    |
//!     |    disarm()      duration / error      |
//!     +----------------------------------------+
//!                  shutdown()
//! ```
//!
//! Arming is owned by the brightness monitor through [`ArmGate`]; the
//! controller owns the recorder and is only ever driven by the processing loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::monitor::ArmGate;
use crate::capture::Frame;
use crate::error::ControllerError;
use crate::record::{Recorder, SinkFactory};
use crate::RecordingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Waiting,
    ArmedIdle,
    Recording,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    DurationElapsed,
    Darkness,
    FormatChanged,
    SinkError,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Nothing changed
    Idle,
    SessionOpened { path: PathBuf },
    FrameWritten,
    SessionClosed {
        path: PathBuf,
        frames: u64,
        reason: CloseReason,
        /// Set when the closing frame immediately opened the next session
        reopened: Option<PathBuf>,
    },
}

pub struct RecordingController<F> {
    factory: F,
    gate: Arc<ArmGate>,
    config: RecordingConfig,
    fallback_fps: f32,
    recorder: Option<Recorder>,
    last_path: Option<PathBuf>,
    cooldown_until: Option<Instant>,
    shut_down: bool,
}

impl<F: SinkFactory> RecordingController<F> {
    /// `fallback_fps` is declared for sessions when no measured rate is given
    pub fn new(factory: F, gate: Arc<ArmGate>, config: RecordingConfig, fallback_fps: f32) -> Self {
        Self {
            factory,
            gate,
            config,
            fallback_fps,
            recorder: None,
            last_path: None,
            cooldown_until: None,
            shut_down: false,
        }
    }

    pub fn state(&self) -> ControllerState {
        match (self.gate.is_armed(), self.is_recording()) {
            (_, true) => ControllerState::Recording,
            (true, false) => ControllerState::ArmedIdle,
            (false, false) => ControllerState::Waiting,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.gate.is_armed()
    }

    pub fn arm(&self) -> bool {
        self.gate.arm()
    }

    pub fn disarm(&self) -> bool {
        self.gate.disarm()
    }

    pub fn recorder(&self) -> Option<&Recorder> {
        self.recorder.as_ref()
    }

    fn max_duration(&self) -> Duration {
        Duration::from_secs(self.config.max_duration_secs)
    }

    fn start_cooldown(&mut self, now: Instant) {
        self.cooldown_until = Some(now + Duration::from_secs(self.config.cooldown_secs));
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Per-frame driver: extends an open session, otherwise considers the hit.
    /// A frame that closes a session without starting a cooldown may open
    /// the next one.
    pub fn on_frame(
        &mut self,
        hit: bool,
        frame: &Frame,
        measured_fps: Option<f32>,
    ) -> Result<Transition, ControllerError> {
        if !self.is_recording() {
            return self.on_detection(hit, frame, measured_fps);
        }

        let mut transition = self.on_tick(frame)?;
        if let Transition::SessionClosed {
            reason: CloseReason::Darkness | CloseReason::FormatChanged,
            reopened,
            ..
        } = &mut transition
        {
            match self.on_detection(hit, frame, measured_fps) {
                Ok(Transition::SessionOpened { path }) => *reopened = Some(path),
                Ok(_) => {}
                Err(e) => warn!("Failed to reopen on frame {}: {}", frame.sequence(), e),
            }
        }
        Ok(transition)
    }

    /// Open a session if armed, hit, idle and not cooling down; the
    /// triggering frame becomes the first frame of the clip.
    pub fn on_detection(
        &mut self,
        hit: bool,
        frame: &Frame,
        measured_fps: Option<f32>,
    ) -> Result<Transition, ControllerError> {
        if self.shut_down {
            return Err(ControllerError::ShutDown);
        }
        if !hit || self.is_recording() || !self.gate.is_armed() {
            return Ok(Transition::Idle);
        }
        if self.cooling_down(frame.timestamp) {
            debug!("Ignoring hit on frame {} during cooldown", frame.sequence());
            return Ok(Transition::Idle);
        }

        let fps = measured_fps.unwrap_or(self.fallback_fps);
        let mut recorder = match Recorder::open(
            &mut self.factory,
            &self.config.output_dir,
            &self.config.file_prefix,
            fps,
            frame,
            self.last_path.as_deref(),
        ) {
            Ok(recorder) => recorder,
            Err(e) => {
                self.start_cooldown(frame.timestamp);
                return Err(e.into());
            }
        };

        if let Err(e) = recorder.write(frame) {
            if let Err(close) = recorder.close() {
                warn!("Failed to close after write error: {}", close);
            }
            self.start_cooldown(frame.timestamp);
            return Err(e.into());
        }

        let path = recorder.session().path.clone();
        self.last_path = Some(path.clone());
        info!("Hit on frame {}, session opened", frame.sequence());
        self.recorder = Some(recorder);
        Ok(Transition::SessionOpened { path })
    }

    /// Append a frame to the open session, closing it once the duration
    /// bound is reached.
    pub fn on_tick(&mut self, frame: &Frame) -> Result<Transition, ControllerError> {
        if self.shut_down {
            return Err(ControllerError::ShutDown);
        }
        let Some(session) = self.recorder.as_ref().map(|r| r.session()) else {
            return Ok(Transition::Idle);
        };
        let started_at = session.started_at;
        let size = (session.width, session.height);

        let elapsed = frame.timestamp.saturating_duration_since(started_at);
        if elapsed >= self.max_duration() {
            self.start_cooldown(frame.timestamp);
            return self.close(CloseReason::DurationElapsed);
        }
        if self.config.abort_on_darkness && !self.gate.is_armed() {
            return self.close(CloseReason::Darkness);
        }
        if (frame.width(), frame.height()) != size {
            return self.close(CloseReason::FormatChanged);
        }

        let written = match self.recorder.as_mut() {
            Some(recorder) => recorder.write(frame),
            None => return Ok(Transition::Idle),
        };
        if let Err(e) = written {
            self.start_cooldown(frame.timestamp);
            if let Err(close) = self.close(CloseReason::SinkError) {
                warn!("Failed to close after write error: {}", close);
            }
            return Err(e.into());
        }
        Ok(Transition::FrameWritten)
    }

    fn close(&mut self, reason: CloseReason) -> Result<Transition, ControllerError> {
        let Some(mut recorder) = self.recorder.take() else {
            return Ok(Transition::Idle);
        };
        let session = recorder.session().clone();
        info!(
            "Closing {} ({:?}, {} frames)",
            session.path.display(),
            reason,
            session.frames_written
        );
        recorder.close()?;
        Ok(Transition::SessionClosed {
            path: session.path,
            frames: session.frames_written,
            reason,
            reopened: None,
        })
    }

    /// Close any open session and reject further work. Idempotent.
    pub fn shutdown(&mut self) -> Result<Option<Transition>, ControllerError> {
        if std::mem::replace(&mut self.shut_down, true) {
            return Ok(None);
        }
        let transition = self.close(CloseReason::Shutdown)?;
        Ok((transition != Transition::Idle).then_some(transition))
    }
}

impl<F> Drop for RecordingController<F> {
    fn drop(&mut self) {
        // Recorder's own Drop flushes the sink
        if self.recorder.is_some() {
            warn!("Recording controller dropped with an open session");
        }
    }
}
