//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing,
//! plus the policy that picks the one face a comparison is about.

use crate::types::{FaceRegion, Image};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}: download det_10g.onnx from insightface and place it in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// How the source image sits inside the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    /// Resized image size inside the input square.
    inner_w: usize,
    inner_h: usize,
}

impl Letterbox {
    fn fit(width: usize, height: usize, side: usize) -> Self {
        let scale = (side as f32 / width as f32).min(side as f32 / height as f32);
        let inner_w = ((width as f32 * scale).round() as usize).clamp(1, side);
        let inner_h = ((height as f32 * scale).round() as usize).clamp(1, side);
        Self {
            scale,
            pad_x: (side - inner_w) as f32 / 2.0,
            pad_y: (side - inner_h) as f32 / 2.0,
            inner_w,
            inner_h,
        }
    }

    /// Map a point in model input space back onto the source image.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    /// Output positions for strides 8, 16, 32, in that order.
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = model_path, outputs = ?names, "loaded SCRFD model");

        if names.len() < 3 * SCRFD_STRIDES.len() {
            return Err(DetectorError::InferenceFailed(format!(
                "expected score/bbox/kps outputs for 3 strides, model has {}",
                names.len()
            )));
        }

        let outputs = map_outputs(&names);
        tracing::debug!(?outputs, "SCRFD output mapping");
        Ok(Self { session, outputs })
    }

    /// Detect faces in an RGB image, highest confidence first.
    ///
    /// An empty vector means nothing cleared the confidence floor.
    pub fn detect(&mut self, image: &Image) -> Result<Vec<FaceRegion>, DetectorError> {
        let letterbox = Letterbox::fit(image.width() as usize, image.height() as usize, SCRFD_INPUT_SIZE);
        let input = to_input_tensor(image, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, slots) in SCRFD_STRIDES.iter().zip(self.outputs) {
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} at stride {stride}: {e}")))
            };
            let head = StrideHead {
                stride,
                scores: tensor(slots.score, "scores")?,
                bboxes: tensor(slots.bbox, "bboxes")?,
                kps: tensor(slots.kps, "landmarks")?,
            };
            candidates.extend(head.decode(&letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), origin = %image.origin(), "SCRFD detection done");
        Ok(faces)
    }
}

/// Letterbox `image` into a normalized 1x3xSxS tensor. Padding is filled with
/// the mean so it normalizes to zero.
fn to_input_tensor(image: &Image, letterbox: &Letterbox) -> Array4<f32> {
    let (w, h) = (letterbox.inner_w, letterbox.inner_h);
    let resized = resize_bilinear_rgb(image.pixels(), image.width() as usize, image.height() as usize, w, h);
    let (left, top) = (letterbox.pad_x.floor() as usize, letterbox.pad_y.floor() as usize);

    Array4::from_shape_fn((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE), |(_, c, y, x)| {
        let value = if (top..top + h).contains(&y) && (left..left + w).contains(&x) {
            f32::from(resized[((y - top) * w + (x - left)) * 3 + c])
        } else {
            SCRFD_MEAN
        };
        (value - SCRFD_MEAN) / SCRFD_STD
    })
}

/// Bilinear resize of packed RGB8 pixels, sampling at pixel centres.
fn resize_bilinear_rgb(src: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    // Source index pair and blend weight for one destination coordinate.
    let sample = |dst: usize, src_len: usize, dst_len: usize| {
        let pos = (dst as f32 + 0.5) * (src_len as f32 / dst_len as f32) - 0.5;
        let lo = (pos.floor() as i64).clamp(0, src_len as i64 - 1) as usize;
        let hi = (lo + 1).min(src_len - 1);
        (lo, hi, (pos - pos.floor()).clamp(0.0, 1.0))
    };

    let mut out = Vec::with_capacity(new_w * new_h * 3);
    for y in 0..new_h {
        let (y0, y1, wy) = sample(y, height, new_h);
        for x in 0..new_w {
            let (x0, x1, wx) = sample(x, width, new_w);
            let at = |px: usize, py: usize, c: usize| f32::from(src[(py * width + px) * 3 + c]);
            for c in 0..3 {
                let top = at(x0, y0, c) + (at(x1, y0, c) - at(x0, y0, c)) * wx;
                let bottom = at(x0, y1, c) + (at(x1, y1, c) - at(x0, y1, c)) * wx;
                out.push((top + (bottom - top) * wy).round().clamp(0.0, 255.0) as u8);
            }
        }
    }
    out
}

/// Pick the face a comparison is about: the largest region, ties broken by
/// higher detector confidence.
pub fn select_primary(regions: &[FaceRegion]) -> Option<&FaceRegion> {
    regions
        .iter()
        .max_by(|a, b| a.area().total_cmp(&b.area()).then(a.confidence.total_cmp(&b.confidence)))
}

/// Map outputs to strides. Exports that name tensors `score_8`, `bbox_16`, ...
/// are mapped by name; anything else gets the usual layout of three scores,
/// then three bboxes, then three landmark tensors.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let by_name = |i: usize| -> Option<StrideOutputs> {
        let stride = SCRFD_STRIDES[i];
        Some(StrideOutputs {
            score: position("score", stride)?,
            bbox: position("bbox", stride)?,
            kps: position("kps", stride)?,
        })
    };

    match (by_name(0), by_name(1), by_name(2)) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional layout");
            [0, 1, 2].map(|i| StrideOutputs {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Raw outputs of one stride level.
struct StrideHead<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideHead<'_> {
    /// Anchor-free decode of every anchor scoring above `threshold`, in source
    /// image coordinates. Truncated tensors drop the anchors they cannot cover.
    fn decode(&self, letterbox: &Letterbox, threshold: f32) -> Vec<FaceRegion> {
        let grid_w = SCRFD_INPUT_SIZE / self.stride;
        let anchors = grid_w * grid_w * SCRFD_ANCHORS_PER_CELL;
        let step = self.stride as f32;

        (0..anchors.min(self.scores.len()))
            .filter(|&idx| self.scores[idx] > threshold)
            .filter_map(|idx| {
                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let (cx, cy) = ((cell % grid_w) as f32 * step, (cell / grid_w) as f32 * step);

                let d = self.bboxes.get(idx * 4..idx * 4 + 4)?;
                let (x1, y1) = letterbox.to_source(cx - d[0] * step, cy - d[1] * step);
                let (x2, y2) = letterbox.to_source(cx + d[2] * step, cy + d[3] * step);

                let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    let mut points = [(0.0f32, 0.0f32); 5];
                    for (p, xy) in points.iter_mut().zip(k.chunks_exact(2)) {
                        *p = letterbox.to_source(cx + xy[0] * step, cy + xy[1] * step);
                    }
                    points
                });

                Some(FaceRegion {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: self.scores[idx],
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression. Returns survivors highest confidence first.
fn nms(mut candidates: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<FaceRegion> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let overlap_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let overlap_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = overlap_w * overlap_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
