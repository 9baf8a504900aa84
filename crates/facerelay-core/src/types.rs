use serde::{Deserialize, Serialize};

/// Label attached to a face that matched no enrolled identity.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Bounding box for a detected face, in the pixel space of the frame it was found in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: left eye, right eye, nose, left and right
    /// mouth corners. Absent when the detector does not produce them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Multiply every coordinate by `factor`, e.g. to map a box found on a
    /// downscaled frame back onto the original frame.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
            landmarks: self.landmarks.map(|points| points.map(|(x, y)| (x * factor, y * factor))),
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box, 0.0 when they do not overlap.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Round to integer pixels and attach a label.
    pub fn labeled(&self, label: impl Into<String>) -> DetectionBox {
        DetectionBox {
            x: self.x.round() as i32,
            y: self.y.round() as i32,
            w: self.width.round() as i32,
            h: self.height.round() as i32,
            label: label.into(),
        }
    }
}

/// Fixed-length face descriptor produced by the encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings of the same dimensionality.
    ///
    /// Returns `None` when the dimensions differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.dim() != other.dim() {
            return None;
        }
        let sum: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Some(sum.sqrt())
    }

    /// Element-wise mean of a batch of embeddings.
    ///
    /// `None` for an empty batch or when the batch mixes dimensionalities.
    pub fn centroid(batch: &[Embedding]) -> Option<Embedding> {
        let first = batch.first()?;
        let dim = first.dim();
        if batch.iter().any(|e| e.dim() != dim) {
            return None;
        }

        let mut sum = vec![0.0f32; dim];
        for embedding in batch {
            for (acc, v) in sum.iter_mut().zip(embedding.values.iter()) {
                *acc += v;
            }
        }
        let n = batch.len() as f32;
        Some(Embedding::new(sum.into_iter().map(|v| v / n).collect()))
    }
}

/// An enrolled identity: the unit stored in the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDescriptor {
    pub name: String,
    pub embedding: Embedding,
    pub owner: Option<String>,
    /// Reference to the representative photo asset, as issued by a `PhotoStore`.
    pub photo_ref: Option<String>,
}

/// A registered camera. An empty `url` means the default local device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSource {
    pub camera_id: String,
    #[serde(default)]
    pub url: String,
}

impl CameraSource {
    pub fn source_url(&self) -> Option<&str> {
        let url = self.url.trim();
        (!url.is_empty()).then_some(url)
    }
}

/// A labeled face rectangle as rendered by viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub label: String,
}

/// One processed frame from one camera, in flight from a worker to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionEvent {
    pub camera_id: String,
    #[serde(default, alias = "results")]
    pub boxes: Vec<DetectionBox>,
    #[serde(default)]
    pub frame_w: u32,
    #[serde(default)]
    pub frame_h: u32,
    /// JPEG data URL of the source frame, when the worker was asked to send it.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "frame_b64")]
    pub frame: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 1.0, landmarks: None }
    }

    #[test]
    fn test_iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(20.0, 20.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_half_overlap() {
        // Two 10x10 boxes sharing a 5x10 strip: 50 / 150
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_scaled_doubles_coordinates() {
        let b = bbox(10.0, 20.0, 30.0, 40.0).scaled(2.0);
        assert_eq!((b.x, b.y, b.width, b.height), (20.0, 40.0, 60.0, 80.0));

        let mut with_points = bbox(0.0, 0.0, 1.0, 1.0);
        with_points.landmarks = Some([(1.0, 2.0); 5]);
        assert_eq!(with_points.scaled(3.0).landmarks, Some([(3.0, 6.0); 5]));
    }

    #[test]
    fn test_labeled_rounds_to_pixels() {
        let d = bbox(10.4, 19.6, 30.5, 40.2).labeled("Bob");
        assert_eq!(d, DetectionBox { x: 10, y: 20, w: 31, h: 40, label: "Bob".into() });
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert_eq!(a.euclidean_distance(&b), Some(5.0));
    }

    #[test]
    fn test_euclidean_distance_dim_mismatch() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), None);
    }

    #[test]
    fn test_centroid_is_elementwise_mean() {
        let batch = vec![
            Embedding::new(vec![1.0, 2.0]),
            Embedding::new(vec![3.0, 6.0]),
        ];
        assert_eq!(Embedding::centroid(&batch), Some(Embedding::new(vec![2.0, 4.0])));
    }

    #[test]
    fn test_centroid_empty_and_mixed() {
        assert_eq!(Embedding::centroid(&[]), None);
        let mixed = vec![Embedding::new(vec![1.0]), Embedding::new(vec![1.0, 2.0])];
        assert_eq!(Embedding::centroid(&mixed), None);
    }

    #[test]
    fn test_recognition_event_accepts_legacy_field_names() {
        let json = r#"{"camera_id":"cam1","results":[{"x":1,"y":2,"w":3,"h":4,"label":"unknown"}],"frame_b64":"data:image/jpeg;base64,AA=="}"#;
        let event: RecognitionEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.boxes.len(), 1);
        assert_eq!(event.frame_w, 0);
        assert!(event.frame.is_some());
    }

    #[test]
    fn test_camera_source_url_blank_means_default() {
        let cam = CameraSource { camera_id: "cam1".into(), url: "  ".into() };
        assert_eq!(cam.source_url(), None);
    }
}
