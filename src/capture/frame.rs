use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp, drives session timing
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Gray8,
    Yuyv4,
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel for packed raw formats, `None` for compressed ones
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Mjpeg => None,
        }
    }

    /// Formats frames carry once they leave a source
    pub fn is_decoded(self) -> bool {
        matches!(
            self,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Gray8
        )
    }
}

impl Frame {
    /// Build a tightly packed frame
    pub fn new(
        data: impl Into<Bytes>,
        sequence: u64,
        width: u32,
        height: u32,
        format: PixelFormat,
        timestamp: Instant,
    ) -> Self {
        let stride = width * format.bytes_per_pixel().unwrap_or(1);
        Self {
            data: data.into(),
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                stride,
                format,
                device_timestamp: None,
            }),
            timestamp,
        }
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// Iterate the rows of a decoded frame without their stride padding
    pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
        let stride = self.meta.stride as usize;
        let row_len = (self.meta.width * self.meta.format.bytes_per_pixel().unwrap_or(1)) as usize;
        self.data
            .chunks(stride.max(1))
            .take(self.meta.height as usize)
            .map(move |row| &row[..row_len.min(row.len())])
    }

    /// Mean BT.601 luma in 0..=255, `None` for empty or undecoded frames
    pub fn mean_luminance(&self) -> Option<f64> {
        // Fixed-point BT.601 weights, scaled by 2^14
        const R: u64 = 4899;
        const G: u64 = 9617;
        const B: u64 = 1868;

        let mut sum: u64 = 0;
        let mut count: u64 = 0;
        match self.meta.format {
            PixelFormat::Gray8 => {
                for row in self.rows() {
                    sum += row.iter().map(|&v| v as u64).sum::<u64>() << 14;
                    count += row.len() as u64;
                }
            }
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
                let bgr = self.meta.format == PixelFormat::Bgr24;
                for row in self.rows() {
                    for px in row.chunks_exact(3) {
                        let (r, b) = if bgr { (px[2], px[0]) } else { (px[0], px[2]) };
                        sum += R * r as u64 + G * px[1] as u64 + B * b as u64;
                        count += 1;
                    }
                }
            }
            PixelFormat::Yuyv4 | PixelFormat::Mjpeg => return None,
        }

        if count == 0 {
            return None;
        }
        Some(sum as f64 / (count as f64 * 16384.0))
    }

    /// Copy the pixels into an owned RGB image for model preprocessing
    pub fn to_rgb_image(&self) -> Option<image::RgbImage> {
        let (w, h) = (self.meta.width, self.meta.height);
        let mut out = Vec::with_capacity((w * h * 3) as usize);
        match self.meta.format {
            PixelFormat::Rgb24 => self.rows().for_each(|row| out.extend_from_slice(row)),
            PixelFormat::Bgr24 => self.rows().for_each(|row| {
                for px in row.chunks_exact(3) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }),
            PixelFormat::Gray8 => self.rows().for_each(|row| {
                for &v in row {
                    out.extend_from_slice(&[v, v, v]);
                }
            }),
            PixelFormat::Yuyv4 | PixelFormat::Mjpeg => return None,
        }
        image::RgbImage::from_raw(w, h, out)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("format", &self.meta.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(format: PixelFormat, px: &[u8], w: u32, h: u32) -> Frame {
        let data: Vec<u8> = px.iter().copied().cycle().take(px.len() * (w * h) as usize).collect();
        Frame::new(data, 0, w, h, format, Instant::now())
    }

    #[test]
    fn luminance_of_gray_frame_is_its_value() {
        let frame = solid(PixelFormat::Gray8, &[120], 4, 4);
        let luma = frame.mean_luminance().unwrap();
        assert!((luma - 120.0).abs() < 1e-9);
    }

    #[test]
    fn luminance_weights_follow_bt601() {
        let white = solid(PixelFormat::Rgb24, &[255, 255, 255], 2, 2);
        assert!((white.mean_luminance().unwrap() - 255.0).abs() < 0.01);

        let red = solid(PixelFormat::Rgb24, &[255, 0, 0], 2, 2);
        let blue_in_bgr = solid(PixelFormat::Bgr24, &[0, 0, 255], 2, 2);
        let expected = 255.0 * 4899.0 / 16384.0;
        assert!((red.mean_luminance().unwrap() - expected).abs() < 1e-6);
        assert!((blue_in_bgr.mean_luminance().unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn luminance_ignores_stride_padding() {
        // 2x2 gray with two padding bytes of 255 per row
        let data = vec![10u8, 10, 255, 255, 10, 10, 255, 255];
        let mut frame = Frame::new(data, 0, 2, 2, PixelFormat::Gray8, Instant::now());
        Arc::make_mut(&mut frame.meta).stride = 4;
        assert!((frame.mean_luminance().unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn compressed_frames_have_no_luminance() {
        let frame = Frame::new(vec![0xFF, 0xD8], 0, 2, 2, PixelFormat::Mjpeg, Instant::now());
        assert!(frame.mean_luminance().is_none());
        assert!(frame.to_rgb_image().is_none());
    }

    #[test]
    fn bgr_frames_convert_to_rgb_images() {
        let frame = solid(PixelFormat::Bgr24, &[1, 2, 3], 3, 2);
        let img = frame.to_rgb_image().unwrap();
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(2, 1).0, [3, 2, 1]);
    }
}
