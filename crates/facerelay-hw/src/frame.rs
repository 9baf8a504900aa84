//! Frame type and raw pixel conversions (YUYV, GREY, Y16 and MJPG to RGB).

use image::imageops::{self, FilterType};
use image::RgbImage;
use std::time::Instant;

/// A captured RGB camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u32,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self { image, sequence, captured_at: Instant::now() }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Resize by `factor` for faster detection. Factors outside (0, 1) return
    /// an unscaled copy.
    pub fn downscaled(&self, factor: f32) -> RgbImage {
        if !(factor > 0.0 && factor < 1.0) {
            return self.image.clone();
        }
        let w = ((self.width() as f32 * factor).round() as u32).max(1);
        let h = ((self.height() as f32 * factor).round() as u32).max(1);
        imageops::resize(&self.image, w, h, FilterType::Triangle)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("compressed frame decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: buf.len() });
    }
    Ok(())
}

fn into_image(data: Vec<u8>, width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let actual = data.len();
    RgbImage::from_raw(width, height, data).ok_or(FrameError::InvalidLength {
        expected: (width * height * 3) as usize,
        actual,
    })
}

/// BT.601 limited-range YUV to RGB, integer arithmetic.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16) * 298;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clip = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [clip(c + 409 * e), clip(c - 100 * d - 208 * e), clip(c + 516 * d)]
}

/// Packed YUYV (4:2:2): two pixels per 4 bytes `[Y0, U, Y1, V]` sharing chroma.
pub fn yuyv_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(buf, expected)?;
    let data = buf[..expected]
        .chunks_exact(4)
        .flat_map(|px| {
            let [y0, u, y1, v] = [px[0], px[1], px[2], px[3]];
            let [r0, g0, b0] = yuv_to_rgb(y0, u, v);
            let [r1, g1, b1] = yuv_to_rgb(y1, u, v);
            [r0, g0, b0, r1, g1, b1]
        })
        .collect();
    into_image(data, width, height)
}

/// 8-bit grayscale, one byte per pixel, replicated over the channels.
pub fn grey_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height) as usize;
    check_len(buf, expected)?;
    into_image(buf[..expected].iter().flat_map(|&v| [v, v, v]).collect(), width, height)
}

/// 16-bit little-endian grayscale, truncated to the high byte.
pub fn y16_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(buf, expected)?;
    let data = buf[..expected]
        .chunks_exact(2)
        .map(|px| (u16::from_le_bytes([px[0], px[1]]) >> 8) as u8)
        .flat_map(|v| [v, v, v])
        .collect();
    into_image(data, width, height)
}

/// Motion-JPEG: each buffer is a complete JPEG image.
pub fn mjpg_to_rgb(buf: &[u8]) -> Result<RgbImage, FrameError> {
    Ok(image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)?.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // 2x1 image: [Y0=16, U=128, Y1=235, V=128]
        let rgb = yuyv_to_rgb(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(rgb.into_raw(), vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_yuyv_keeps_color() {
        // BT.601 red: Y=81, U=90, V=240
        let rgb = yuyv_to_rgb(&[81, 90, 81, 240, 81, 90, 81, 240], 4, 1).unwrap();
        assert_eq!(rgb.dimensions(), (4, 1));
        for pixel in rgb.pixels() {
            assert_eq!(*pixel, Rgb([255, 0, 0]));
        }
    }

    #[test]
    fn test_yuyv_short_buffer() {
        assert!(matches!(
            yuyv_to_rgb(&[100, 128], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 0x1234 little-endian, 0xFF00 little-endian
        let rgb = y16_to_rgb(&[0x34, 0x12, 0x00, 0xFF], 2, 1).unwrap();
        assert_eq!(rgb.into_raw(), vec![0x12, 0x12, 0x12, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_grey_ignores_trailing_bytes() {
        let rgb = grey_to_rgb(&[1, 2, 3, 4, 99], 2, 2).unwrap();
        assert_eq!(*rgb.get_pixel(1, 1), Rgb([4, 4, 4]));
        assert_eq!(rgb.into_raw().len(), 12);
    }

    #[test]
    fn test_mjpg_rejects_garbage() {
        assert!(mjpg_to_rgb(b"\xff\xd8 nope").is_err());
    }

    #[test]
    fn test_downscaled_halves() {
        let frame = Frame::new(RgbImage::from_pixel(640, 480, Rgb([7, 8, 9])), 0);
        assert_eq!(frame.downscaled(0.5).dimensions(), (320, 240));
    }

    #[test]
    fn test_downscaled_ignores_out_of_range_factor() {
        let frame = Frame::new(RgbImage::from_pixel(64, 48, Rgb([7, 8, 9])), 0);
        assert_eq!(frame.downscaled(1.0).dimensions(), (64, 48));
        assert_eq!(frame.downscaled(0.0).dimensions(), (64, 48));
    }
}
