//! Face alignment via 4-DOF similarity transform.
//!
//! Aligns detected faces to a canonical 112×112 RGB crop using the five
//! InsightFace reference landmarks and least-squares estimation. Regions
//! without landmarks are cropped square around the box instead.

use crate::types::{FaceRegion, Image};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Least-squares similarity transform (scale, rotation, translation) taking
/// `src` landmarks onto `dst`, as `[a, -b, tx, b, a, ty]`:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
/// Solved in closed form around the landmark centroids. Coincident source
/// points yield the identity.
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    let centroid = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / 5.0, sy / 5.0)
    };
    let (scx, scy) = centroid(src);
    let (dcx, dcy) = centroid(dst);

    let (mut spread, mut dot, mut cross) = (0.0f32, 0.0f32, 0.0f32);
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
        let (sx, sy, dx, dy) = (sx - scx, sy - scy, dx - dcx, dy - dcy);
        spread += sx * sx + sy * sy;
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
    }
    if spread < 1e-12 {
        return [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    }

    let (a, b) = (dot / spread, cross / spread);
    let tx = dcx - (a * scx - b * scy);
    let ty = dcy - (b * scx + a * scy);
    [a, -b, tx, b, a, ty]
}

/// Apply a similarity warp to an RGB image, producing an `out_size`² RGB crop.
///
/// Bilinear interpolation; out-of-bounds samples are black.
fn warp_affine(image: &Image, matrix: &[f32; 6], out_size: usize) -> Vec<u8> {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    let mut output = vec![0u8; out_size * out_size * 3];

    // M = [[a, -b], [b, a]], det = a^2 + b^2
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return output;
    }
    let ia = a / det;
    let ib = b / det;

    let sample = |x: i32, y: i32| -> [f32; 3] {
        if x < 0 || y < 0 {
            return [0.0; 3];
        }
        let [r, g, bl] = image.rgb(x as usize, y as usize);
        [r as f32, g as f32, bl as f32]
    };

    for oy in 0..out_size {
        for ox in 0..out_size {
            // src = M_inv * (dst - t)
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let tl = sample(x0, y0);
            let tr = sample(x0 + 1, y0);
            let bl = sample(x0, y0 + 1);
            let br = sample(x0 + 1, y0 + 1);

            for c in 0..3 {
                let val = tl[c] * (1.0 - fx) * (1.0 - fy)
                    + tr[c] * fx * (1.0 - fy)
                    + bl[c] * (1.0 - fx) * fy
                    + br[c] * fx * fy;
                output[(oy * out_size + ox) * 3 + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    output
}

/// Align a detected face to a canonical 112×112 RGB crop.
///
/// Uses the five landmarks when present; otherwise takes a square crop
/// centred on the bounding box.
pub fn align_face(image: &Image, face: &FaceRegion) -> Vec<u8> {
    let matrix = match &face.landmarks {
        Some(landmarks) => estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112),
        None => crop_transform(face, ALIGNED_SIZE),
    };
    warp_affine(image, &matrix, ALIGNED_SIZE)
}

/// Scale-and-translate transform mapping the square around `face` onto `out_size`².
fn crop_transform(face: &FaceRegion, out_size: usize) -> [f32; 6] {
    let side = face.width.max(face.height).max(1.0);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;
    let a = out_size as f32 / side;
    let tx = out_size as f32 / 2.0 - cx * a;
    let ty = out_size as f32 / 2.0 - cy * a;
    [a, 0.0, tx, 0.0, a, ty]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Origin;

    fn solid(width: u32, height: u32, value: u8) -> Image {
        let pixels = vec![value; (width * height * 3) as usize];
        Image::from_rgb8(pixels, width, height, Origin::Bytes).unwrap()
    }

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts);

        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!((m[4] - 1.0).abs() < 1e-4, "a2 = {}", m[4]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_scaled_transform() {
        // Source landmarks at 2x scale → a ≈ 0.5
        let src: [(f32, f32); 5] = [
            (76.5892, 103.3926),
            (147.0636, 103.0028),
            (112.0504, 143.4732),
            (83.0986, 184.7310),
            (141.4598, 184.4082),
        ];
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 0.05, "a = {}, expected ~0.5", m[0]);
    }

    #[test]
    fn test_rotation_is_recovered() {
        // dst = src rotated 90 degrees about the origin, then shifted by (5, -3).
        let src = REFERENCE_LANDMARKS_112;
        let dst = src.map(|(x, y)| (-y + 5.0, x - 3.0));
        let m = estimate_similarity_transform(&src, &dst);
        assert!(m[0].abs() < 1e-4, "a = {}", m[0]);
        assert!((m[3] - 1.0).abs() < 1e-4, "b = {}", m[3]);
        assert!((m[2] - 5.0).abs() < 1e-2, "tx = {}", m[2]);
        assert!((m[5] + 3.0).abs() < 1e-2, "ty = {}", m[5]);
    }

    #[test]
    fn test_coincident_landmarks_give_identity() {
        let src = [(10.0, 10.0); 5];
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert_eq!(m, [1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_align_face_output_size() {
        let image = solid(64, 48, 128);
        let face = FaceRegion {
            x: 0.0, y: 0.0, width: 64.0, height: 48.0, confidence: 0.9,
            landmarks: Some(REFERENCE_LANDMARKS_112),
        };
        assert_eq!(align_face(&image, &face).len(), ALIGNED_SIZE * ALIGNED_SIZE * 3);
    }

    #[test]
    fn test_crop_without_landmarks_fills_from_region() {
        // Left half red, right half blue; crop the right half.
        let (w, h) = (100u32, 50u32);
        let mut pixels = Vec::with_capacity((w * h * 3) as usize);
        for _y in 0..h {
            for x in 0..w {
                pixels.extend_from_slice(if x < 50 { &[255, 0, 0] } else { &[0, 0, 255] });
            }
        }
        let image = Image::from_rgb8(pixels, w, h, Origin::Bytes).unwrap();
        let face = FaceRegion {
            x: 50.0, y: 0.0, width: 50.0, height: 50.0, confidence: 0.9, landmarks: None,
        };

        let crop = align_face(&image, &face);
        let centre = (56 * ALIGNED_SIZE + 56) * 3;
        assert_eq!(&crop[centre..centre + 3], &[0, 0, 255]);
    }

    #[test]
    fn test_landmark_roundtrip() {
        // A bright patch at the source left eye should land near the reference left eye.
        let (w, h) = (200usize, 200usize);
        let mut pixels = vec![0u8; w * h * 3];

        let src_landmarks: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        let (lx, ly) = (src_landmarks[0].0 as usize, src_landmarks[0].1 as usize);
        for py in ly - 2..=ly + 2 {
            for px in lx - 2..=lx + 2 {
                let i = (py * w + px) * 3;
                pixels[i..i + 3].copy_from_slice(&[255, 255, 255]);
            }
        }

        let image = Image::from_rgb8(pixels, w as u32, h as u32, Origin::Bytes).unwrap();
        let face = FaceRegion {
            x: 70.0, y: 50.0, width: 60.0, height: 70.0, confidence: 0.9,
            landmarks: Some(src_landmarks),
        };
        let aligned = align_face(&image, &face);

        let ref_x = REFERENCE_LANDMARKS_112[0].0.round() as usize;
        let ref_y = REFERENCE_LANDMARKS_112[0].1.round() as usize;
        let mut max_val = 0u8;
        for y in ref_y - 1..=ref_y + 1 {
            for x in ref_x - 1..=ref_x + 1 {
                max_val = max_val.max(aligned[(y * ALIGNED_SIZE + x) * 3]);
            }
        }
        assert!(max_val > 100, "expected bright patch near ({ref_x}, {ref_y}), max={max_val}");
    }
}
