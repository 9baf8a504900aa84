//! facerelay-core: data model, face matching, the vision engine and the
//! realtime protocol shared by the hub, camera workers and the CLI.
//!
//! Detection uses SCRFD and descriptor extraction uses ArcFace on landmark
//! aligned crops, both running on ONNX Runtime for CPU inference.

pub mod alignment;
pub mod codec;
pub mod detector;
pub mod engine;
pub mod enroll;
pub mod gallery;
pub mod matcher;
pub mod protocol;
pub mod recognizer;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod types;

pub use engine::{EngineFactory, EngineKind, FaceDetection, OnnxEngine, OnnxEngineFactory, VisionEngine};
pub use gallery::{CameraStore, GallerySnapshot, GalleryStore, MemoryStore, PhotoStore, StoreError};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use types::{BoundingBox, CameraSource, DetectionBox, Embedding, FaceDescriptor, RecognitionEvent};

use std::path::PathBuf;

/// Per-user data directory: `$XDG_DATA_HOME/facerelay`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facerelay")
}

/// Default location of the ONNX models.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
