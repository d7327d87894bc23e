//! Content-addressed on-disk cache for linked files.
//!
//! Layout: `<cache_dir>/files/<sha256>`. Entries are written to a temp file
//! in the same directory and renamed into place after their hash is
//! checked, so readers never see partial content. Concurrent writers of
//! one hash race on the rename; every candidate has identical bytes.
//!
//! Archives downloaded by URL are kept in `<cache_dir>/archives/`, named
//! by the hash of their bytes.

use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{CartonError, Result};
use crate::format::{is_sha256_hex, sha256_file, sha256_hex};

#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
    archives: PathBuf,
}

impl FileCache {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            root: cache_dir.join("files"),
            archives: cache_dir.join("archives"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, sha256: &str) -> Result<PathBuf> {
        if !is_sha256_hex(sha256) {
            return Err(CartonError::Validation(format!(
                "'{sha256}' is not a sha256 digest"
            )));
        }
        Ok(self.root.join(sha256))
    }

    /// Cached path for `sha256`, re-verified. Corrupt entries are evicted.
    pub async fn get(&self, sha256: &str) -> Result<Option<PathBuf>> {
        let path = self.path_for(sha256)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let check = path.clone();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&check)).await??;
        if actual != sha256 {
            warn!(path = %path.display(), expected = sha256, actual = %actual, "Evicting corrupt cache entry");
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(path))
    }

    /// A temp file inside the cache directory, for staging downloads.
    pub fn staging_file(&self) -> Result<NamedTempFile> {
        std::fs::create_dir_all(&self.root)?;
        Ok(tempfile::Builder::new()
            .prefix(".incoming-")
            .tempfile_in(&self.root)?)
    }

    /// A temp file for staging a downloaded archive.
    pub fn archive_staging_file(&self) -> Result<NamedTempFile> {
        std::fs::create_dir_all(&self.archives)?;
        Ok(tempfile::Builder::new()
            .prefix(".incoming-")
            .suffix(".carton")
            .tempfile_in(&self.archives)?)
    }

    /// Keep a downloaded archive under the hash of its bytes.
    pub fn commit_archive(&self, staged: NamedTempFile, sha256: &str) -> Result<PathBuf> {
        if !is_sha256_hex(sha256) {
            return Err(CartonError::Validation(format!(
                "'{sha256}' is not a sha256 digest"
            )));
        }
        let path = self.archives.join(format!("{sha256}.carton"));
        staged
            .persist(&path)
            .map_err(|e| CartonError::Io(e.error))?;
        Ok(path)
    }

    /// Move a staged file into place. `actual` is the hash computed while
    /// staging and must equal `sha256`.
    pub fn commit(&self, staged: NamedTempFile, sha256: &str, actual: &str) -> Result<PathBuf> {
        let path = self.path_for(sha256)?;
        if actual != sha256 {
            return Err(CartonError::Integrity {
                what: format!("cache entry {}", path.display()),
                expected: sha256.to_string(),
                actual: actual.to_string(),
            });
        }
        staged
            .persist(&path)
            .map_err(|e| CartonError::Io(e.error))?;
        Ok(path)
    }

    /// Verify and store `bytes`.
    pub fn insert_bytes(&self, sha256: &str, bytes: &[u8]) -> Result<PathBuf> {
        use std::io::Write;
        let actual = sha256_hex(bytes);
        let mut staged = self.staging_file()?;
        staged.write_all(bytes)?;
        staged.flush()?;
        self.commit(staged, sha256, &actual)
    }
}
