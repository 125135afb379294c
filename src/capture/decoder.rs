use jpeg_decoder::Decoder;

use super::frame::PixelFormat;
use crate::error::CameraError;

/// Decode a raw device buffer into packed pixels.
///
/// Returns the pixel data along with the format it ended up in; MJPEG and
/// YUYV both come out as RGB24, grayscale JPEGs as GRAY8.
pub fn decode_frame(
    data: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<(Vec<u8>, PixelFormat), CameraError> {
    match format {
        PixelFormat::Mjpeg => {
            let mut decoder = Decoder::new(data);
            let pixels = decoder
                .decode()
                .map_err(|e| CameraError::CaptureFailed(format!("MJPEG decode: {e}")))?;
            let info = decoder
                .info()
                .ok_or_else(|| CameraError::CaptureFailed("MJPEG header missing".into()))?;
            if u32::from(info.width) != width || u32::from(info.height) != height {
                return Err(CameraError::CaptureFailed(format!(
                    "MJPEG frame is {}x{}, expected {}x{}",
                    info.width, info.height, width, height
                )));
            }
            match info.pixel_format {
                jpeg_decoder::PixelFormat::RGB24 => Ok((pixels, PixelFormat::Rgb24)),
                jpeg_decoder::PixelFormat::L8 => Ok((pixels, PixelFormat::Gray8)),
                other => Err(CameraError::CaptureFailed(format!(
                    "unsupported JPEG pixel format {other:?}"
                ))),
            }
        }
        PixelFormat::Yuyv4 => {
            let expected = (width * height * 2) as usize;
            if data.len() < expected {
                return Err(CameraError::CaptureFailed(format!(
                    "short YUYV frame: {} of {} bytes",
                    data.len(),
                    expected
                )));
            }
            Ok((yuyv_to_rgb(&data[..expected]), PixelFormat::Rgb24))
        }
        PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Gray8 => {
            let bpp = format.bytes_per_pixel().unwrap_or(1);
            let expected = (width * height * bpp) as usize;
            if data.len() < expected {
                return Err(CameraError::CaptureFailed(format!(
                    "short frame: {} of {} bytes",
                    data.len(),
                    expected
                )));
            }
            Ok((data[..expected].to_vec(), format))
        }
    }
}

/// BT.601 limited-range YUYV 4:2:2 to packed RGB24
fn yuyv_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        for y in [y0, y1] {
            let c = y as i32 - 16;
            let d = u as i32 - 128;
            let e = v as i32 - 128;
            let r = (298 * c + 409 * e + 128) >> 8;
            let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
            let b = (298 * c + 516 * d + 128) >> 8;
            rgb.push(r.clamp(0, 255) as u8);
            rgb.push(g.clamp(0, 255) as u8);
            rgb.push(b.clamp(0, 255) as u8);
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_black_and_white() {
        // Y=16 is black, Y=235 is white at neutral chroma
        let data = [16u8, 128, 235, 128];
        let (rgb, format) = decode_frame(&data, PixelFormat::Yuyv4, 2, 1).unwrap();
        assert_eq!(format, PixelFormat::Rgb24);
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn short_yuyv_frame_is_rejected() {
        let err = decode_frame(&[0u8; 6], PixelFormat::Yuyv4, 2, 2).unwrap_err();
        assert!(matches!(err, CameraError::CaptureFailed(_)));
    }

    #[test]
    fn raw_frames_pass_through() {
        let data = vec![7u8; 12];
        let (out, format) = decode_frame(&data, PixelFormat::Rgb24, 2, 2).unwrap();
        assert_eq!(format, PixelFormat::Rgb24);
        assert_eq!(out, data);
    }

    #[test]
    fn mjpeg_round_trips_through_image_encoder() {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([200, 200, 200]));
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 95)
            .encode_image(&img)
            .unwrap();

        let (rgb, format) = decode_frame(&jpeg, PixelFormat::Mjpeg, 8, 8).unwrap();
        assert_eq!(format, PixelFormat::Rgb24);
        assert_eq!(rgb.len(), 8 * 8 * 3);
        assert!(rgb.iter().all(|&v| (190..=210).contains(&v)));

        let err = decode_frame(&jpeg, PixelFormat::Mjpeg, 16, 16).unwrap_err();
        assert!(matches!(err, CameraError::CaptureFailed(_)));
    }
}
