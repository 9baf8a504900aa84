//! Enrollment: turn a batch of sample images into one gallery entry.
//!
//! Each sample contributes the descriptor of its first detected face. The
//! stored descriptor is the centroid of all contributions, and it replaces
//! whatever was enrolled under the same name before.

use crate::codec::{self, DecodeError};
use crate::engine::{EngineError, EngineKind, VisionEngine};
use crate::gallery::{GalleryStore, PhotoStore, StoreError};
use crate::types::{Embedding, FaceDescriptor};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("identity name must not be empty")]
    EmptyName,
    #[error("no face detected in the submitted samples")]
    NoFaceDetected,
    #[error("the vision engine cannot encode faces (detector-only)")]
    EncoderUnavailable,
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Samples submitted for one identity, still encoded (JPEG, PNG, ...).
#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub name: String,
    pub owner: Option<String>,
    pub samples: Vec<Vec<u8>>,
}

/// A successful enrollment.
#[derive(Debug, Clone)]
pub struct EnrolledFace {
    pub face: FaceDescriptor,
    /// Samples that yielded a descriptor.
    pub detected_count: usize,
    /// Samples skipped for failing to decode or holding no face.
    pub skipped: usize,
}

/// Caller-facing summary of an enrollment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentResult {
    pub ok: bool,
    pub detected_count: usize,
    pub message: String,
}

impl From<&Result<EnrolledFace, EnrollError>> for EnrollmentResult {
    fn from(outcome: &Result<EnrolledFace, EnrollError>) -> Self {
        match outcome {
            Ok(enrolled) => Self {
                ok: true,
                detected_count: enrolled.detected_count,
                message: format!("enrollment saved for {}", enrolled.face.name),
            },
            Err(e) => Self { ok: false, detected_count: 0, message: e.to_string() },
        }
    }
}

/// Descriptors collected from a batch of samples.
struct Collected {
    descriptors: Vec<Embedding>,
    /// Index of the first sample that yielded a descriptor.
    representative: Option<usize>,
    skipped: usize,
}

fn collect_descriptors(engine: &mut dyn VisionEngine, samples: &[Vec<u8>]) -> Collected {
    let mut collected = Collected { descriptors: Vec::new(), representative: None, skipped: 0 };

    for (idx, sample) in samples.iter().enumerate() {
        match encode_sample(engine, sample) {
            Ok(Some(descriptor)) => {
                collected.descriptors.push(descriptor);
                collected.representative.get_or_insert(idx);
            }
            Ok(None) => {
                tracing::debug!(sample = idx, "no face in sample");
                collected.skipped += 1;
            }
            Err(e) => {
                tracing::warn!(sample = idx, error = %e, "skipping sample");
                collected.skipped += 1;
            }
        }
    }
    collected
}

#[derive(Error, Debug)]
enum SampleError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn encode_sample(engine: &mut dyn VisionEngine, sample: &[u8]) -> Result<Option<Embedding>, SampleError> {
    let frame = codec::decode_rgb(sample)?;
    let detections = engine.detect_and_encode(&frame)?;
    Ok(detections.into_iter().next().and_then(|d| d.descriptor))
}

/// Run the enrollment pipeline and persist the result.
pub fn enroll(
    engine: &mut dyn VisionEngine,
    gallery: &dyn GalleryStore,
    photos: &dyn PhotoStore,
    request: &EnrollRequest,
) -> Result<EnrolledFace, EnrollError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(EnrollError::EmptyName);
    }
    if engine.kind() == EngineKind::DetectorOnly {
        return Err(EnrollError::EncoderUnavailable);
    }

    let collected = collect_descriptors(engine, &request.samples);
    let (Some(representative), Some(embedding)) = (
        collected.representative,
        Embedding::centroid(&collected.descriptors),
    ) else {
        return Err(EnrollError::NoFaceDetected);
    };

    // A corrupt existing row is overwritten like a missing one.
    let previous = match gallery.get(name) {
        Ok(previous) => previous,
        Err(StoreError::Corrupt { reason, .. }) => {
            tracing::warn!(name, reason = %reason, "replacing corrupt gallery entry");
            None
        }
        Err(e) => return Err(e.into()),
    };
    let photo_ref = photos.save(name, &request.samples[representative])?;

    let face = FaceDescriptor {
        name: name.to_string(),
        embedding,
        owner: request.owner.clone(),
        photo_ref: Some(photo_ref.clone()),
    };
    if let Err(e) = gallery.upsert(&face) {
        let still_referenced = previous.as_ref().and_then(|p| p.photo_ref.as_deref()) == Some(photo_ref.as_str());
        if !still_referenced {
            if let Err(remove_err) = photos.remove(&photo_ref) {
                tracing::warn!(name, photo_ref = %photo_ref, error = %remove_err, "failed to remove unsaved photo");
            }
        }
        return Err(e.into());
    }

    if let Some(old_ref) = previous.and_then(|p| p.photo_ref) {
        if face.photo_ref.as_deref() != Some(old_ref.as_str()) {
            if let Err(e) = photos.remove(&old_ref) {
                tracing::warn!(name, photo_ref = %old_ref, error = %e, "failed to remove replaced photo");
            }
        }
    }

    tracing::info!(
        name,
        detected = collected.descriptors.len(),
        skipped = collected.skipped,
        "enrollment saved"
    );

    Ok(EnrolledFace {
        face,
        detected_count: collected.descriptors.len(),
        skipped: collected.skipped,
    })
}
