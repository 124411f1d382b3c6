//! Per-invocation temp files for backends that read images from disk.

use facecheck_core::Image;
use image::{ColorType, ImageFormat};
use std::io::{BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// A temp file holding one staged image. [`StagedFile::remove`] deletes it
/// and logs failures; dropping it deletes it silently.
#[derive(Debug)]
pub struct StagedFile {
    file: NamedTempFile,
}

/// Name prefix: millisecond timestamp, invocation id, image index. The
/// random suffix appended after it keeps names unique.
pub fn staged_file_prefix(invocation: &str, index: usize) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    format!("facecheck-{millis}-{invocation}-{index}-")
}

impl StagedFile {
    /// Write `image` as PNG into a fresh file in `dir`.
    pub fn write(dir: &Path, invocation: &str, index: usize, image: &Image) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(&staged_file_prefix(invocation, index))
            .suffix(".png")
            .tempfile_in(dir)?;

        {
            let mut writer = BufWriter::new(file.as_file_mut());
            image::write_buffer_with_format(
                &mut writer,
                image.pixels(),
                image.width(),
                image.height(),
                ColorType::Rgb8,
                ImageFormat::Png,
            )
            .map_err(std::io::Error::other)?;
            writer.flush()?;
        }

        tracing::debug!(path = %file.path().display(), "staged image");
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Delete the file now. Failures are logged, never returned.
    pub fn remove(self) {
        let path = self.file.path().to_path_buf();
        match self.file.close() {
            Ok(()) => tracing::debug!(path = %path.display(), "removed staged image"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove staged image"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facecheck_core::Origin;

    fn tiny() -> Image {
        Image::from_rgb8(vec![10, 20, 30, 40, 50, 60], 2, 1, Origin::Bytes).unwrap()
    }

    #[test]
    fn test_write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let staged = StagedFile::write(dir.path(), "abc", 1, &tiny()).unwrap();
        let path = staged.path().to_path_buf();

        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded.into_raw(), vec![10, 20, 30, 40, 50, 60]);

        staged.remove();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let staged = StagedFile::write(dir.path(), "abc", 2, &tiny()).unwrap();
            staged.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let a = StagedFile::write(dir.path(), "inv1", 1, &tiny()).unwrap();
        let b = StagedFile::write(dir.path(), "inv1", 1, &tiny()).unwrap();
        assert_ne!(a.path(), b.path());

        let name = a.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("facecheck-"), "{name}");
        assert!(name.contains("-inv1-1-"), "{name}");
        assert!(name.ends_with(".png"), "{name}");
    }

    #[test]
    fn test_removing_a_vanished_file_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let staged = StagedFile::write(dir.path(), "abc", 1, &tiny()).unwrap();
        std::fs::remove_file(staged.path()).unwrap();
        staged.remove();
    }

    #[test]
    fn test_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        assert!(StagedFile::write(&missing, "abc", 1, &tiny()).is_err());
        assert!(!missing.exists());
    }
}
