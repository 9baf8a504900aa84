//! Identity matching of probe descriptors against a gallery snapshot.

use crate::engine::FaceDetection;
use crate::gallery::GallerySnapshot;
use crate::types::{DetectionBox, Embedding, UNKNOWN_LABEL};

/// Result of matching one probe descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, `None` for unknown.
    pub identity: Option<String>,
    /// Distance to the nearest gallery entry; `None` when nothing was comparable.
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self { identity: None, distance: None }
    }

    pub fn label(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// Strategy for comparing a probe descriptor against a gallery.
pub trait Matcher {
    fn identify(&self, probe: &Embedding, gallery: &GallerySnapshot, threshold: f32) -> MatchResult;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// The nearest entry wins when its distance is strictly below the threshold.
/// Ties resolve to the first entry in gallery iteration order, which is an
/// implementation detail callers must not rely on.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn identify(&self, probe: &Embedding, gallery: &GallerySnapshot, threshold: f32) -> MatchResult {
        let mut best: Option<(&str, f32)> = None;

        for (name, embedding) in gallery.iter() {
            let Some(distance) = probe.euclidean_distance(embedding) else {
                continue;
            };
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((name, distance));
            }
        }

        match best {
            Some((name, distance)) if distance < threshold => MatchResult {
                identity: Some(name.to_string()),
                distance: Some(distance),
            },
            Some((_, distance)) => MatchResult { identity: None, distance: Some(distance) },
            None => MatchResult::unknown(),
        }
    }
}

/// Label every detection in a frame. Faces without a descriptor stay unknown.
pub fn label_detections(
    matcher: &dyn Matcher,
    detections: &[FaceDetection],
    gallery: &GallerySnapshot,
    threshold: f32,
) -> Vec<DetectionBox> {
    detections
        .iter()
        .map(|det| {
            let result = det
                .descriptor
                .as_ref()
                .map(|d| matcher.identify(d, gallery, threshold))
                .unwrap_or_else(MatchResult::unknown);
            det.bbox.labeled(result.label())
        })
        .collect()
}
