use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are in pixels of the [`Image`] the region was detected in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceRegion {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Zero vectors compare as 0.
    ///
    /// Callers must check dimensions first; see [`crate::scorer::score`].
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Euclidean distance between the L2-normalized forms of both embeddings.
    pub fn normalized_euclidean_distance(&self, other: &Embedding) -> f32 {
        let norm_a = l2_norm(&self.values);
        let norm_b = l2_norm(&other.values);
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| {
                let a = if norm_a > 0.0 { a / norm_a } else { 0.0 };
                let b = if norm_b > 0.0 { b / norm_b } else { 0.0 };
                (a - b).powi(2)
            })
            .sum::<f32>()
            .sqrt()
    }
}

pub(crate) fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Where a caller-supplied image came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Path(PathBuf),
    Bytes,
    DataUrl,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Path(path) => write!(f, "{}", path.display()),
            Origin::Bytes => f.write_str("<bytes>"),
            Origin::DataUrl => f.write_str("<data-url>"),
        }
    }
}

/// A caller-supplied image, before decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageInput {
    /// A file on disk; the extension is the declared format.
    Path(PathBuf),
    /// Raw encoded bytes, optionally with a declared format name ("png", "jpg", ...).
    Bytes {
        data: Vec<u8>,
        #[serde(default)]
        format: Option<String>,
    },
    /// A `data:image/...;base64,` URL, or a bare base64 string.
    DataUrl(String),
}

impl ImageInput {
    /// Interpret a command-line style argument: `data:` URLs are data URLs, anything else a path.
    pub fn from_arg(arg: &str) -> Self {
        if arg.starts_with("data:") {
            ImageInput::DataUrl(arg.to_string())
        } else {
            ImageInput::Path(PathBuf::from(arg))
        }
    }
}

/// A decoded image in canonical form: 8-bit RGB, row-major, 3 channels.
///
/// Immutable once decoded.
#[derive(Debug)]
pub struct Image {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    format: String,
    origin: Origin,
    /// A file on disk holding this picture, if one exists.
    file: Option<PathBuf>,
}

impl Image {
    pub const CHANNELS: u8 = 3;
    /// Bytes per channel sample.
    pub const DEPTH: u8 = 1;

    /// Build an image from packed RGB8 pixels.
    ///
    /// Returns `None` when the buffer length does not match the dimensions.
    pub fn from_rgb8(pixels: Vec<u8>, width: u32, height: u32, origin: Origin) -> Option<Self> {
        let expected = width as usize * height as usize * Self::CHANNELS as usize;
        if width == 0 || height == 0 || pixels.len() != expected {
            return None;
        }
        let file = match &origin {
            Origin::Path(path) => Some(path.clone()),
            _ => None,
        };
        Some(Self {
            pixels,
            width,
            height,
            format: "raw".to_string(),
            origin,
            file,
        })
    }

    pub(crate) fn with_format(mut self, format: &str) -> Self {
        self.format = format.to_string();
        self
    }

    /// Attach a file that holds the same picture (a staged copy of an in-memory payload).
    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file = Some(path);
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        Self::CHANNELS
    }

    pub fn depth(&self) -> u8 {
        Self::DEPTH
    }

    /// Canonical name of the encoded format the image was decoded from.
    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// RGB triple at (x, y). Out-of-bounds coordinates read as black.
    #[inline]
    pub fn rgb(&self, x: usize, y: usize) -> [u8; 3] {
        if x >= self.width as usize || y >= self.height as usize {
            return [0, 0, 0];
        }
        let i = (y * self.width as usize + x) * 3;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }
}

/// Outcome of comparing two faces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    #[serde(rename = "match")]
    pub matched: bool,
    /// In [0, 1]; higher means more likely the same person.
    pub confidence: f32,
    /// Non-negative embedding distance.
    pub distance: f32,
    /// True when the result was produced without a working model pipeline.
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_normalized_euclidean_ignores_magnitude() {
        let a = Embedding::new(vec![3.0, 4.0]);
        let b = Embedding::new(vec![6.0, 8.0]);
        assert!(a.normalized_euclidean_distance(&b) < 1e-6);
    }

    #[test]
    fn test_image_rejects_bad_buffer() {
        assert!(Image::from_rgb8(vec![0; 11], 2, 2, Origin::Bytes).is_none());
        assert!(Image::from_rgb8(vec![], 0, 0, Origin::Bytes).is_none());
        let img = Image::from_rgb8(vec![7; 12], 2, 2, Origin::Bytes).unwrap();
        assert_eq!(img.rgb(1, 1), [7, 7, 7]);
        assert_eq!(img.rgb(5, 0), [0, 0, 0]);
        assert!(img.file().is_none());
    }

    #[test]
    fn test_path_origin_sets_file() {
        let img = Image::from_rgb8(vec![0; 3], 1, 1, Origin::Path("a.png".into())).unwrap();
        assert_eq!(img.file(), Some(Path::new("a.png")));
    }

    #[test]
    fn test_image_input_from_arg() {
        assert!(matches!(ImageInput::from_arg("data:image/png;base64,AA=="), ImageInput::DataUrl(_)));
        assert!(matches!(ImageInput::from_arg("face.jpg"), ImageInput::Path(_)));
    }

    #[test]
    fn test_result_serializes_match_key() {
        let r = ComparisonResult {
            matched: true,
            confidence: 0.9,
            distance: 0.1,
            degraded: false,
            reason: None,
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["match"], true);
        assert!(json.get("reason").is_none());
    }
}
