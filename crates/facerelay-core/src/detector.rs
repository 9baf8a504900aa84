//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the frame into a 640x640 tensor, decodes the three
//! anchor-free stride heads (boxes and, when the model has them, five-point
//! landmarks) and suppresses overlapping boxes.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Placement of the resized frame inside the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    scaled_w: u32,
    scaled_h: u32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, target);
        let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            scaled_w,
            scaled_h,
            pad_x: (target - scaled_w) / 2,
            pad_y: (target - scaled_h) / 2,
        }
    }

    /// Map a point in model-input space back to frame space.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor indices for one stride: score, bbox and optional keypoints.
type StrideOutputs = (usize, usize, Option<usize>);

/// One stride's raw head outputs.
struct StrideHead<'a> {
    scores: &'a [f32],
    deltas: &'a [f32],
    kps: Option<&'a [f32]>,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    layout: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }

        let layout = output_layout(&names);
        tracing::info!(path = %model_path.display(), outputs = ?names, ?layout, "loaded SCRFD model");

        Ok(Self { session, layout })
    }

    /// Detect faces in an RGB frame, highest confidence first.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = frame.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in SCRFD_STRIDES.iter().zip(self.layout.iter()) {
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, deltas) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let kps = match kps_idx {
                Some(idx) => Some(
                    outputs[idx]
                        .try_extract_tensor::<f32>()
                        .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?
                        .1,
                ),
                None => None,
            };

            candidates.extend(decode_stride(&StrideHead { scores, deltas, kps }, stride, &letterbox));
        }

        Ok(non_max_suppression(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Resize into the letterboxed NCHW tensor. Padding stays at zero, which is
/// the normalised value of `SCRFD_MEAN`.
fn preprocess(frame: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (width, height) = frame.dimensions();
    let letterbox = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(frame, letterbox.scaled_w, letterbox.scaled_h, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let ty = (y + letterbox.pad_y) as usize;
        let tx = (x + letterbox.pad_x) as usize;
        for (c, &v) in pixel.0.iter().enumerate() {
            tensor[[0, c, ty, tx]] = (v as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Map output tensors to strides by name ("score_8", "bbox_8", "kps_8", ...),
/// falling back to the conventional positional order
/// [scores 8/16/32, bboxes 8/16/32, kps 8/16/32]. Keypoints are optional.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let position = |kind: &str, stride: u32| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut layout = positional_layout(names.len());
    for (slot, &stride) in layout.iter_mut().zip(SCRFD_STRIDES.iter()) {
        match (position("score", stride), position("bbox", stride)) {
            (Some(score), Some(bbox)) => *slot = (score, bbox, position("kps", stride)),
            _ => return positional_layout(names.len()),
        }
    }
    layout
}

fn positional_layout(outputs: usize) -> [StrideOutputs; 3] {
    let kps = |idx: usize| (outputs >= 9).then_some(idx);
    [(0, 3, kps(6)), (1, 4, kps(7)), (2, 5, kps(8))]
}

/// Decode the anchors of one stride head above the confidence threshold.
fn decode_stride(head: &StrideHead<'_>, stride: u32, letterbox: &Letterbox) -> Vec<BoundingBox> {
    let StrideHead { scores, deltas, kps } = *head;
    let grid_w = (SCRFD_INPUT_SIZE / stride) as usize;
    let grid_h = grid_w;
    let step = stride as f32;
    let anchors = (grid_w * grid_h * SCRFD_ANCHORS_PER_CELL).min(scores.len());

    (0..anchors)
        .filter(|&idx| scores[idx] > SCRFD_CONFIDENCE_THRESHOLD)
        .filter_map(|idx| {
            let d = deltas.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * step;
            let cy = (cell / grid_w) as f32 * step;

            let (x1, y1) = letterbox.to_frame(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.to_frame(cx + d[2] * step, cy + d[3] * step);
            let landmarks = kps
                .and_then(|k| k.get(idx * 10..idx * 10 + 10))
                .map(|k| std::array::from_fn(|i| letterbox.to_frame(cx + k[i * 2] * step, cy + k[i * 2 + 1] * step)));
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: scores[idx],
                landmarks,
            })
        })
        .collect()
}

/// Greedy NMS: keep the most confident box, drop everything overlapping it.
fn non_max_suppression(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence, landmarks: None }
    }

    #[test]
    fn test_letterbox_landscape() {
        let lb = Letterbox::fit(1280, 720, 640);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!((lb.scaled_w, lb.scaled_h), (640, 360));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 140));
    }

    #[test]
    fn test_letterbox_maps_back_to_frame() {
        let lb = Letterbox::fit(1280, 720, 640);
        // Frame point (100, 200) lands at (50, 240) in model space.
        let (x, y) = lb.to_frame(50.0, 240.0);
        assert!((x - 100.0).abs() < 1e-3);
        assert!((y - 200.0).abs() < 1e-3);
    }

    #[test]
    fn test_preprocess_shape_and_padding() {
        let frame = RgbImage::from_pixel(64, 32, Rgb([255, 127, 0]));
        let (tensor, lb) = preprocess(&frame);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        // Top rows are padding.
        assert_eq!(tensor[[0, 0, 0, 320]], 0.0);
        // Each channel is normalised on its own, in RGB order.
        let y = lb.pad_y as usize + 10;
        for (c, v) in [255.0, 127.0, 0.0].into_iter().enumerate() {
            let expected = (v - SCRFD_MEAN) / SCRFD_STD;
            assert!((tensor[[0, c, y, 320]] - expected).abs() < 0.02);
        }
    }

    #[test]
    fn test_decode_stride_thresholds_and_maps() {
        let lb = Letterbox::fit(640, 640, 640);
        let cells = (640 / 32) * (640 / 32) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0; cells];
        let mut deltas = vec![0.0; cells * 4];
        // Anchor 2 is cell 1: centre (32, 0). Offsets of 1 stride each way.
        scores[2] = 0.9;
        deltas[8..12].copy_from_slice(&[0.5, 0.0, 1.0, 2.0]);

        let head = StrideHead { scores: &scores, deltas: &deltas, kps: None };
        let dets = decode_stride(&head, 32, &lb);
        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert_eq!((d.x, d.y, d.width, d.height), (16.0, 0.0, 48.0, 64.0));
        assert_eq!(d.confidence, 0.9);
        assert!(d.landmarks.is_none());
    }

    #[test]
    fn test_decode_stride_landmarks() {
        let lb = Letterbox::fit(1280, 1280, 640);
        let cells = (640 / 32) * (640 / 32) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0; cells];
        let deltas = vec![0.5; cells * 4];
        let mut kps = vec![0.0; cells * 10];
        // Anchor 2 sits at (32, 0); its first landmark is one stride right and down.
        scores[2] = 0.8;
        kps[20..22].copy_from_slice(&[1.0, 1.0]);

        let head = StrideHead { scores: &scores, deltas: &deltas, kps: Some(&kps) };
        let dets = decode_stride(&head, 32, &lb);
        let landmarks = dets[0].landmarks.unwrap();
        // Model space (64, 32) maps back to (128, 64) at scale 0.5.
        assert_eq!(landmarks[0], (128.0, 64.0));
        assert_eq!(landmarks[1], (64.0, 0.0));
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let kept = non_max_suppression(
            vec![
                bbox(0.0, 0.0, 100.0, 100.0, 0.8),
                bbox(5.0, 5.0, 100.0, 100.0, 0.9),
                bbox(300.0, 300.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.7);
    }

    #[test]
    fn test_nms_empty() {
        assert!(non_max_suppression(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_output_layout_named() {
        let names: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(output_layout(&names), [(1, 0, None), (3, 2, None), (5, 4, None)]);
    }

    #[test]
    fn test_output_layout_named_with_keypoints() {
        let names: Vec<String> = ["score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16", "kps_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(output_layout(&names), [(0, 3, Some(6)), (1, 4, Some(7)), (2, 5, Some(8))]);
    }

    #[test]
    fn test_output_layout_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i| format!("{}", 400 + i)).collect();
        assert_eq!(output_layout(&names), [(0, 3, Some(6)), (1, 4, Some(7)), (2, 5, Some(8))]);
        let names: Vec<String> = (0..6).map(|i| format!("{}", 400 + i)).collect();
        assert_eq!(output_layout(&names), [(0, 3, None), (1, 4, None), (2, 5, None)]);
    }
}
