//! GStreamer-based H.264 recording sink

use std::path::Path;
use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use super::{SinkFactory, VideoSink};
use crate::capture::{Frame, PixelFormat};
use crate::error::RecorderError;
use crate::{Container, GStreamerConfig};

/// Opens one encoder pipeline per recording session
pub struct GstSinkFactory {
    config: GStreamerConfig,
    encoder: String,
}

impl GstSinkFactory {
    pub fn new(config: GStreamerConfig) -> Result<Self, RecorderError> {
        gst::init().map_err(|e| RecorderError::Open {
            path: Default::default(),
            reason: format!("Failed to initialize GStreamer: {}", e),
        })?;

        let encoder = match &config.encoder {
            Some(name) => name.clone(),
            None => Self::detect_h264_encoder().to_string(),
        };
        info!("Using H.264 encoder: {}", encoder);

        Ok(Self { config, encoder })
    }

    /// Detect best available H.264 encoder (hardware > software)
    fn detect_h264_encoder() -> &'static str {
        let encoders = [
            "nvh264enc",    // NVIDIA hardware encoder
            "vaapih264enc", // Intel/AMD VAAPI hardware encoder
            "v4l2h264enc",  // V4L2 M2M hardware encoder (Raspberry Pi)
            "x264enc",      // Software encoder (fallback)
        ];

        for encoder in &encoders {
            if let Some(factory) = gst::ElementFactory::find(encoder) {
                debug!(
                    "Found encoder: {} - {}",
                    encoder,
                    factory.metadata("long-name").unwrap_or("")
                );
                return encoder;
            }
        }

        warn!("No H.264 encoder found, falling back to x264enc");
        "x264enc"
    }

    /// Encoder element with its rate control settings
    fn encoder_description(&self) -> String {
        let kbps = self.config.bitrate_kbps;
        match self.encoder.as_str() {
            "x264enc" => format!(
                "x264enc tune=zerolatency speed-preset=ultrafast bitrate={}",
                kbps
            ),
            "nvh264enc" | "vaapih264enc" => format!("{} bitrate={}", self.encoder, kbps),
            other => other.to_string(),
        }
    }

    fn build_pipeline_string(&self) -> String {
        let muxer = match self.config.container {
            Container::Mp4 => "mp4mux",
            Container::Matroska => "matroskamux",
        };
        format!(
            "appsrc name=src format=time ! \
             queue ! \
             videoconvert ! \
             {} ! \
             h264parse ! \
             {} ! \
             filesink name=sink",
            self.encoder_description(),
            muxer
        )
    }
}

impl SinkFactory for GstSinkFactory {
    fn open(
        &mut self,
        path: &Path,
        fps: f32,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoSink>, RecorderError> {
        let open_err = |reason: String| RecorderError::Open {
            path: path.to_path_buf(),
            reason,
        };

        // The output directory is managed outside the recorder
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if !dir.is_dir() {
                return Err(open_err(format!("{} is not a directory", dir.display())));
            }
        }

        let pipeline_str = self.build_pipeline_string();
        debug!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| open_err(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_err("Failed to create pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| open_err("Failed to find appsrc element".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| open_err("Failed to cast to AppSrc".into()))?;

        let filesink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_err("Failed to find filesink element".into()))?;
        filesink.set_property("location", path.to_string_lossy().to_string());

        appsrc.set_format(gst::Format::Time);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_err(format!("Failed to start pipeline: {:?}", e)))?;

        Ok(Box::new(GstSink {
            pipeline,
            appsrc,
            fps: gst::Fraction::new((fps.max(1.0) * 1000.0).round() as i32, 1000),
            frame_duration: Duration::from_secs_f32(1.0 / fps.max(1.0)),
            width,
            height,
            info: None,
            first_timestamp: None,
            finalize_timeout: Duration::from_secs(self.config.finalize_timeout_secs),
            closed: false,
        }))
    }

    fn extension(&self) -> &str {
        match self.config.container {
            Container::Mp4 => "mp4",
            Container::Matroska => "mkv",
        }
    }
}

struct GstSink {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    fps: gst::Fraction,
    frame_duration: Duration,
    width: u32,
    height: u32,
    /// Negotiated from the first frame's pixel format
    info: Option<gst_video::VideoInfo>,
    first_timestamp: Option<Instant>,
    finalize_timeout: Duration,
    closed: bool,
}

impl GstSink {
    fn video_info(&mut self, format: PixelFormat) -> Result<&gst_video::VideoInfo, RecorderError> {
        if self.info.is_none() {
            let video_format = match format {
                PixelFormat::Rgb24 => gst_video::VideoFormat::Rgb,
                PixelFormat::Bgr24 => gst_video::VideoFormat::Bgr,
                PixelFormat::Gray8 => gst_video::VideoFormat::Gray8,
                other => {
                    return Err(RecorderError::Write(format!(
                        "cannot encode {:?} frames",
                        other
                    )))
                }
            };
            let info = gst_video::VideoInfo::builder(video_format, self.width, self.height)
                .fps(self.fps)
                .build()
                .map_err(|e| RecorderError::Write(e.to_string()))?;
            let caps = info
                .to_caps()
                .map_err(|e| RecorderError::Write(e.to_string()))?;
            self.appsrc.set_caps(Some(&caps));
            self.info = Some(info);
        }
        self.info
            .as_ref()
            .ok_or_else(|| RecorderError::Write("video info unavailable".into()))
    }

    /// Surface asynchronous pipeline errors on the next write
    fn check_bus(&self) -> Result<(), RecorderError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        if let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = msg.view() {
                return Err(RecorderError::Write(err.error().to_string()));
            }
        }
        Ok(())
    }
}

/// Copy rows into the stride GStreamer expects for this format
fn repack(frame: &Frame, stride: usize) -> Vec<u8> {
    let mut out = vec![0u8; stride * frame.height() as usize];
    for (dst, row) in out.chunks_mut(stride).zip(frame.rows()) {
        let n = row.len().min(stride);
        dst[..n].copy_from_slice(&row[..n]);
    }
    out
}

impl VideoSink for GstSink {
    fn write(&mut self, frame: &Frame) -> Result<(), RecorderError> {
        if self.closed {
            return Err(RecorderError::Write("sink closed".into()));
        }
        if (frame.width(), frame.height()) != (self.width, self.height) {
            return Err(RecorderError::Write(format!(
                "frame is {}x{}, sink expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        self.check_bus()?;

        let stride = self.video_info(frame.meta.format)?.stride()[0] as usize;
        let mut buffer = if stride == frame.meta.stride as usize {
            gst::Buffer::from_slice(frame.data.clone())
        } else {
            gst::Buffer::from_mut_slice(repack(frame, stride))
        };

        let first = *self.first_timestamp.get_or_insert(frame.timestamp);
        let pts = frame.timestamp.saturating_duration_since(first);
        {
            let buffer = buffer
                .get_mut()
                .ok_or_else(|| RecorderError::Write("buffer not writable".into()))?;
            buffer.set_pts(gst::ClockTime::from_nseconds(pts.as_nanos() as u64));
            buffer.set_duration(gst::ClockTime::from_nseconds(
                self.frame_duration.as_nanos() as u64,
            ));
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| RecorderError::Write(format!("push failed: {:?}", e)))?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), RecorderError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }

        // EOS lets the muxer write its index before the file is released
        let mut result = Ok(());
        if self.appsrc.end_of_stream().is_ok() {
            if let Some(bus) = self.pipeline.bus() {
                let timeout = gst::ClockTime::from_mseconds(self.finalize_timeout.as_millis() as u64);
                match bus.timed_pop_filtered(
                    timeout,
                    &[gst::MessageType::Eos, gst::MessageType::Error],
                ) {
                    Some(msg) => {
                        if let gst::MessageView::Error(err) = msg.view() {
                            result = Err(RecorderError::Finalize(err.error().to_string()));
                        }
                    }
                    None => {
                        result = Err(RecorderError::Finalize(
                            "timed out waiting for end of stream".into(),
                        ))
                    }
                }
            }
        }

        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| RecorderError::Finalize(format!("Failed to stop pipeline: {:?}", e)))?;
        result
    }
}

impl Drop for GstSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Recording sink did not finalize cleanly: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_frame(width: u32, height: u32, seq: u64, ts: Instant) -> Frame {
        let data: Vec<u8> = (0..width * height * 3).map(|i| i as u8).collect();
        Frame::new(data, seq, width, height, PixelFormat::Rgb24, ts)
    }

    #[test]
    fn repack_pads_rows_to_the_target_stride() {
        // Two RGB pixels are 6 bytes; GStreamer rounds rows up to 8
        let frame = rgb_frame(2, 2, 0, Instant::now());
        assert_eq!(
            repack(&frame, 8),
            vec![0, 1, 2, 3, 4, 5, 0, 0, 6, 7, 8, 9, 10, 11, 0, 0]
        );
    }

    /// Software encoder pipeline, or `None` where the plugins are missing
    fn x264_factory() -> Option<GstSinkFactory> {
        gst::init().ok()?;
        let elements = ["appsrc", "videoconvert", "x264enc", "h264parse", "mp4mux", "filesink"];
        if elements.iter().any(|e| gst::ElementFactory::find(e).is_none()) {
            return None;
        }
        GstSinkFactory::new(GStreamerConfig {
            encoder: Some("x264enc".into()),
            ..GStreamerConfig::default()
        })
        .ok()
    }

    #[test]
    fn records_a_clip_with_unaligned_rows() {
        let Some(mut factory) = x264_factory() else {
            eprintln!("x264enc not available, skipping");
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");

        // 66 px of RGB is 198 bytes per row, so every frame gets repacked
        let mut sink = factory.open(&path, 10.0, 66, 48).unwrap();
        let t0 = Instant::now();
        for seq in 0..10u64 {
            let ts = t0 + Duration::from_millis(seq * 100);
            sink.write(&rgb_frame(66, 48, seq, ts)).unwrap();
        }

        let wrong_size = rgb_frame(32, 32, 10, t0 + Duration::from_secs(1));
        assert!(matches!(sink.write(&wrong_size), Err(RecorderError::Write(_))));

        sink.close().unwrap();
        sink.close().unwrap();
        assert!(sink.write(&rgb_frame(66, 48, 11, t0)).is_err());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn open_rejects_a_missing_directory() {
        let Some(mut factory) = x264_factory() else {
            eprintln!("x264enc not available, skipping");
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("clip.mp4");
        assert!(matches!(
            factory.open(&path, 10.0, 64, 48),
            Err(RecorderError::Open { .. })
        ));
    }
}
