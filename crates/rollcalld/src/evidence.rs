//! Content-addressed storage for the images behind attendance records.
//!
//! Each image is written once as `<dir>/<sha256 hex>.img`; the hex digest is
//! the record's evidence reference.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub struct EvidenceStore {
    dir: PathBuf,
}

impl EvidenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, reference: &str) -> PathBuf {
        self.dir.join(format!("{reference}.img"))
    }

    /// Store `image` and return its reference. An empty image has the empty
    /// reference and is not written.
    pub async fn put(&self, image: &[u8]) -> std::io::Result<String> {
        if image.is_empty() {
            return Ok(String::new());
        }

        let reference = format!("{:x}", Sha256::digest(image));
        let path = self.path_for(&reference);
        if tokio::fs::try_exists(&path).await? {
            return Ok(reference);
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        // Write then rename so a reader never sees a half-written file. The
        // temp name is per call; concurrent puts of the same bytes both succeed.
        let tmp = self.dir.join(format!("{reference}.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, image).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(evidence = %reference, bytes = image.len(), "evidence stored");
        Ok(reference)
    }
}
