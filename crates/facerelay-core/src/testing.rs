//! Deterministic stand-ins for the vision engine, for tests in this and
//! downstream crates (feature `test-util`).

use crate::engine::{EngineError, EngineKind, FaceDetection, VisionEngine};
use crate::types::{BoundingBox, Embedding};
use image::{Rgb, RgbImage};

/// Descriptor dimensionality produced by [`StubEngine`].
pub const STUB_DIM: usize = 4;

/// Engine whose output is a pure function of the frame.
///
/// A frame whose top-left red value is 0 holds no face. Any other frame holds
/// one face covering the centre quarter, with descriptor `[p / 255, 0, 0, 0]`
/// where `p` is the top-left red value.
#[derive(Debug, Clone)]
pub struct StubEngine {
    kind: EngineKind,
    pub frames_seen: usize,
}

impl StubEngine {
    pub fn full() -> Self {
        Self { kind: EngineKind::Full, frames_seen: 0 }
    }

    pub fn detector_only() -> Self {
        Self { kind: EngineKind::DetectorOnly, frames_seen: 0 }
    }

    /// The descriptor this engine yields for a frame with top-left `pixel`.
    pub fn descriptor_for(pixel: u8) -> Embedding {
        let mut values = vec![0.0; STUB_DIM];
        values[0] = pixel as f32 / 255.0;
        Embedding::new(values)
    }
}

impl VisionEngine for StubEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn detect_and_encode(&mut self, frame: &RgbImage) -> Result<Vec<FaceDetection>, EngineError> {
        self.frames_seen += 1;
        let (w, h) = frame.dimensions();
        let Some(&Rgb([pixel, _, _])) = frame.get_pixel_checked(0, 0) else {
            return Ok(Vec::new());
        };
        if pixel == 0 {
            return Ok(Vec::new());
        }

        let bbox = BoundingBox {
            x: w as f32 / 4.0,
            y: h as f32 / 4.0,
            width: w as f32 / 2.0,
            height: h as f32 / 2.0,
            confidence: 0.99,
            landmarks: None,
        };
        let descriptor = (self.kind == EngineKind::Full).then(|| Self::descriptor_for(pixel));
        Ok(vec![FaceDetection { bbox, descriptor }])
    }
}

/// A uniform gray frame that [`StubEngine`] reads as `pixel`.
pub fn stub_frame(width: u32, height: u32, pixel: u8) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([pixel, pixel, pixel]))
}

/// [`stub_frame`] encoded as PNG bytes, as a client would upload it.
pub fn stub_png(width: u32, height: u32, pixel: u8) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    stub_frame(width, height, pixel)
        .write_to(&mut buf, image::ImageFormat::Png)
        .expect("encoding an in-memory PNG cannot fail");
    buf.into_inner()
}
