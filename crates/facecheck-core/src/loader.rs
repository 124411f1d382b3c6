//! Image loading and normalization.
//!
//! Turns a caller-supplied [`ImageInput`] into a canonical RGB8 [`Image`],
//! enforcing the size and format limits of a [`ComparisonConfig`]. Every
//! failure here is the caller's fault and is reported as an [`InputError`].

use crate::config::{normalize_format_name, ComparisonConfig, ConfigError};
use crate::types::{Image, ImageInput, Origin};
use base64::Engine as _;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DATA_URL_SCHEME: &str = "data:";
const DATA_URL_BASE64_MARKER: &str = ";base64,";

#[derive(Error, Debug)]
pub enum InputError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("payload too large: {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("corrupt image: {0}")]
    CorruptImage(String),
    #[error("image {0} is missing: two images are required")]
    MissingImage(usize),
    #[error("image file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid comparison config: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// Decode `input` into a canonical RGB8 image.
pub fn load(input: &ImageInput, config: &ComparisonConfig) -> Result<Image, InputError> {
    match input {
        ImageInput::Path(path) => {
            let bytes = read_bounded(path, config.max_image_bytes)?;
            let declared = path.extension().and_then(|e| e.to_str());
            decode(&bytes, declared, Origin::Path(path.clone()), config)
        }
        ImageInput::Bytes { data, format } => {
            check_size(data.len(), config.max_image_bytes)?;
            decode(data, format.as_deref(), Origin::Bytes, config)
        }
        ImageInput::DataUrl(url) => {
            let (declared, payload) = split_data_url(url)?;
            check_encoded_size(payload, config.max_image_bytes)?;
            let bytes = decode_base64(payload)?;
            check_size(bytes.len(), config.max_image_bytes)?;
            decode(&bytes, declared, Origin::DataUrl, config)
        }
    }
}

/// Split a data URL into its declared format (MIME subtype) and base64 payload.
///
/// Input without a `data:` scheme is treated as a bare base64 payload. Stripping
/// is purely syntactic; the payload is returned untouched.
pub fn split_data_url(url: &str) -> Result<(Option<&str>, &str), InputError> {
    let url = url.trim();
    let Some(rest) = url.strip_prefix(DATA_URL_SCHEME) else {
        return Ok((None, url));
    };
    let Some(marker) = rest.find(DATA_URL_BASE64_MARKER) else {
        return Err(InputError::CorruptImage(
            "data URL is not base64-encoded".to_string(),
        ));
    };
    let mime = &rest[..marker];
    let payload = &rest[marker + DATA_URL_BASE64_MARKER.len()..];
    match mime.strip_prefix("image/") {
        Some(subtype) if !subtype.is_empty() => Ok((Some(subtype), payload)),
        _ => Err(InputError::UnsupportedFormat(mime.to_string())),
    }
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, InputError> {
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| InputError::CorruptImage(format!("invalid base64 payload: {e}")))
}

/// Reject a base64 payload that cannot decode to `max` bytes or fewer,
/// before any of it is decoded.
fn check_encoded_size(payload: &str, max: usize) -> Result<(), InputError> {
    let encoded = payload.bytes().filter(|b| !b.is_ascii_whitespace()).count();
    // At most two padding characters shrink the decoded length below this.
    let decoded_at_least = (encoded / 4 * 3).saturating_sub(2);
    check_size(decoded_at_least, max)
}

fn check_size(size: usize, max: usize) -> Result<(), InputError> {
    if size > max {
        return Err(InputError::PayloadTooLarge { size, max });
    }
    Ok(())
}

fn read_bounded(path: &Path, max: usize) -> Result<Vec<u8>, InputError> {
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => InputError::NotFound(path.to_path_buf()),
        _ => InputError::Read {
            path: path.to_path_buf(),
            source: e,
        },
    })?;
    // Check before reading so oversized files are never pulled into memory.
    check_size(usize::try_from(metadata.len()).unwrap_or(usize::MAX), max)?;
    let bytes = std::fs::read(path).map_err(|e| InputError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    check_size(bytes.len(), max)?;
    Ok(bytes)
}

/// Canonical name of a decoder format, e.g. `jpeg`, `png`.
fn format_name(format: ImageFormat) -> String {
    normalize_format_name(format.extensions_str().first().copied().unwrap_or("unknown"))
}

fn decode(
    bytes: &[u8],
    declared: Option<&str>,
    origin: Origin,
    config: &ComparisonConfig,
) -> Result<Image, InputError> {
    if bytes.is_empty() {
        return Err(InputError::CorruptImage("empty payload".to_string()));
    }

    if let Some(declared) = declared {
        if !config.allows_format(declared) {
            return Err(InputError::UnsupportedFormat(normalize_format_name(declared)));
        }
    }

    // Content wins over the declared name; the declared name only helps when
    // the header is not recognized.
    let format = image::guess_format(bytes)
        .ok()
        .or_else(|| declared.and_then(ImageFormat::from_extension))
        .ok_or_else(|| InputError::CorruptImage("unrecognized image data".to_string()))?;

    let name = format_name(format);
    if !config.allows_format(&name) {
        return Err(InputError::UnsupportedFormat(name));
    }

    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| InputError::CorruptImage(format!("{name} decode failed: {e}")))?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();

    tracing::debug!(%origin, format = %name, width, height, "image decoded");

    Image::from_rgb8(rgb.into_raw(), width, height, origin)
        .map(|image| image.with_format(&name))
        .ok_or_else(|| InputError::CorruptImage("image has no pixels".to_string()))
}
