//! Representative enrollment photos stored as plain files.

use chrono::Utc;
use facerelay_core::gallery::{PhotoStore, StoreError};
use std::path::{Path, PathBuf};

/// A directory of photo files. References are absolute file paths.
#[derive(Debug, Clone)]
pub struct PhotoDir {
    root: PathBuf,
}

impl PhotoDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// File-name-safe form of an identity name.
fn slug(name: &str) -> String {
    let slug: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if slug.is_empty() {
        "face".to_string()
    } else {
        slug
    }
}

fn extension_for(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("bin")
}

impl PhotoStore for PhotoDir {
    fn save(&self, name: &str, bytes: &[u8]) -> Result<String, StoreError> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| StoreError::Photo(format!("cannot create {}: {e}", self.root.display())))?;

        let file_name = format!(
            "{}-{}.{}",
            slug(name),
            Utc::now().timestamp_millis(),
            extension_for(bytes)
        );
        let path = self.root.join(file_name);
        std::fs::write(&path, bytes)
            .map_err(|e| StoreError::Photo(format!("cannot write {}: {e}", path.display())))?;

        tracing::debug!(name, path = %path.display(), "photo saved");
        Ok(path.to_string_lossy().into_owned())
    }

    fn remove(&self, photo_ref: &str) -> Result<(), StoreError> {
        let path = Path::new(photo_ref);
        if !path.starts_with(&self.root) {
            return Err(StoreError::Photo(format!("{photo_ref} is outside {}", self.root.display())));
        }
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Photo(format!("cannot remove {photo_ref}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facerelay_core::testing::stub_png;

    #[test]
    fn test_slug() {
        assert_eq!(slug("Alice Smith"), "alice_smith");
        assert_eq!(slug("  bob-2 "), "bob-2");
        assert_eq!(slug("   "), "face");
    }

    #[test]
    fn test_save_uses_detected_extension() {
        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoDir::new(dir.path());

        let photo_ref = photos.save("Alice", &stub_png(8, 8, 200)).unwrap();
        assert!(photo_ref.ends_with(".png"));
        assert!(photo_ref.contains("alice-"));
        assert_eq!(std::fs::read(&photo_ref).unwrap(), stub_png(8, 8, 200));

        let other = photos.save("Bob", b"not an image").unwrap();
        assert!(other.ends_with(".bin"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoDir::new(dir.path());
        let photo_ref = photos.save("Alice", &stub_png(4, 4, 9)).unwrap();

        photos.remove(&photo_ref).unwrap();
        assert!(!Path::new(&photo_ref).exists());
        photos.remove(&photo_ref).unwrap();
    }

    #[test]
    fn test_remove_refuses_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let photos = PhotoDir::new(dir.path().join("photos"));
        assert!(matches!(photos.remove("/etc/passwd"), Err(StoreError::Photo(_))));
    }
}
