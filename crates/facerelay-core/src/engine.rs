//! The vision engine capability: detect faces and encode descriptors.
//!
//! [`OnnxEngine`] picks its variant once, when it is loaded: the full
//! detector + encoder pipeline when both models are present, detector-only
//! otherwise. Callers see the choice through [`VisionEngine::kind`].

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// SCRFD detection model file name inside the model directory.
pub const DETECTOR_MODEL: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const ENCODER_MODEL: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Detection plus descriptor extraction.
    Full,
    /// Detection only; every face is reported without a descriptor.
    DetectorOnly,
}

/// One detected face. `descriptor` is `None` under a detector-only engine or
/// when encoding that face failed.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub descriptor: Option<Embedding>,
}

pub trait VisionEngine: Send {
    fn kind(&self) -> EngineKind;

    /// Detect every face in the frame, most confident first.
    fn detect_and_encode(&mut self, frame: &RgbImage) -> Result<Vec<FaceDetection>, EngineError>;
}

/// Creates independent engine instances, one per camera worker.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn VisionEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Box<dyn VisionEngine>, EngineError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn VisionEngine>, EngineError> {
        self()
    }
}

/// SCRFD + ArcFace engine running on ONNX Runtime.
pub struct OnnxEngine {
    detector: FaceDetector,
    recognizer: Option<FaceRecognizer>,
}

impl OnnxEngine {
    /// Load the models from `model_dir`. The detector is mandatory; a missing
    /// or broken encoder degrades the engine to detector-only.
    pub fn load(model_dir: &Path) -> Result<Self, EngineError> {
        if !model_dir.is_dir() {
            return Err(EngineError::Unavailable(format!(
                "model directory {} does not exist",
                model_dir.display()
            )));
        }

        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL))?;

        let recognizer = match FaceRecognizer::load(&model_dir.join(ENCODER_MODEL)) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!(error = %e, "encoder unavailable; running detector-only");
                None
            }
        };

        Ok(Self { detector, recognizer })
    }
}

impl VisionEngine for OnnxEngine {
    fn kind(&self) -> EngineKind {
        if self.recognizer.is_some() {
            EngineKind::Full
        } else {
            EngineKind::DetectorOnly
        }
    }

    fn detect_and_encode(&mut self, frame: &RgbImage) -> Result<Vec<FaceDetection>, EngineError> {
        let boxes = self.detector.detect(frame)?;

        let Some(recognizer) = self.recognizer.as_mut() else {
            return Ok(boxes
                .into_iter()
                .map(|bbox| FaceDetection { bbox, descriptor: None })
                .collect());
        };

        let mut detections = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let descriptor = match recognizer.encode(frame, &bbox) {
                Ok(d) => Some(d),
                Err(e) => {
                    tracing::debug!(error = %e, "face encoding failed");
                    None
                }
            };
            detections.push(FaceDetection { bbox, descriptor });
        }
        Ok(detections)
    }
}

/// Loads a fresh [`OnnxEngine`] from a model directory for each caller.
#[derive(Debug, Clone)]
pub struct OnnxEngineFactory {
    pub model_dir: PathBuf,
}

impl EngineFactory for OnnxEngineFactory {
    fn create(&self) -> Result<Box<dyn VisionEngine>, EngineError> {
        Ok(Box::new(OnnxEngine::load(&self.model_dir)?))
    }
}
