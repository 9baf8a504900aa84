//! ArcFace face encoder via ONNX Runtime.
//!
//! Aligns the face on its five landmarks (or crops the detected box when the
//! detector gave none), resizes it to 112x112 and extracts an L2-normalised
//! 512-dimensional descriptor.

use crate::alignment;
use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face encoder.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace model");
        Ok(Self { session })
    }

    /// Extract the descriptor of one detected face.
    pub fn encode(&mut self, frame: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let crop = face_input(frame, face).ok_or(RecognizerError::EmptyCrop)?;
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw)))
    }
}

/// Encoder input for one face: landmark-aligned when possible, else the box crop.
fn face_input(frame: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    face.landmarks
        .and_then(|landmarks| alignment::align_face(frame, &landmarks))
        .or_else(|| face_crop(frame, face))
}

/// Clamp the box to the frame and resize the crop to the encoder input size.
fn face_crop(frame: &RgbImage, face: &BoundingBox) -> Option<RgbImage> {
    let (width, height) = frame.dimensions();
    let left = face.x.max(0.0).floor() as u32;
    let top = face.y.max(0.0).floor() as u32;
    let right = ((face.x + face.width).ceil().max(0.0) as u32).min(width);
    let bottom = ((face.y + face.height).ceil().max(0.0) as u32).min(height);
    if right <= left || bottom <= top {
        return None;
    }

    let crop = imageops::crop_imm(frame, left, top, right - left, bottom - top).to_image();
    Some(imageops::resize(&crop, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle))
}

/// RGB crop to NCHW float tensor.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for (c, &v) in pixel.0.iter().enumerate() {
            tensor[[0, c, y as usize, x as usize]] = (v as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}
