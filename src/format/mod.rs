//! Archive format, version 1.
//!
//! A carton is a zip file (or a directory with the same layout):
//!
//! ```text
//! carton.toml             metadata
//! tensor_data/index.toml  tensors referenced by self-tests and examples
//! misc/...                misc files
//! model/...               payload
//! MANIFEST                `path=sha256` per line, sorted by path
//! LINKS                   optional sha256 -> [url] map for externalized payload
//! ```

mod carton_toml;
mod container;
mod links;
mod manifest;
mod save;
mod shrink;
mod tensor_data;
mod validate;

use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;

pub use container::{read_carton, Container, MissingFile, ParsedCarton};
pub use links::Links;
pub use manifest::Manifest;
pub use save::pack_dir;
pub use shrink::shrink_archive;
pub use validate::{is_sha256_hex, validate_info, validate_linked_files};

pub const SPEC_VERSION: u64 = 1;
pub const CARTON_TOML: &str = "carton.toml";
pub const MANIFEST: &str = "MANIFEST";
pub const LINKS: &str = "LINKS";
pub const MODEL_PREFIX: &str = "model/";
pub const MISC_PREFIX: &str = "misc/";
pub const TENSOR_DATA_PREFIX: &str = "tensor_data/";

/// Lowercase hex sha256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Lowercase hex sha256 of a file, memory-mapped.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(sha256_hex(&[]));
    }
    // SAFETY: the map is read-only and dropped before returning.
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    Ok(sha256_hex(&mmap))
}

/// Writer that hashes everything passing through it.
pub(crate) struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub(crate) fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Zip entry options. Output depends only on name and content.
pub(crate) fn entry_options(name: &str, size: u64) -> zip::write::FileOptions {
    let method = if name == MANIFEST || name == LINKS {
        zip::CompressionMethod::Stored
    } else {
        zip::CompressionMethod::Deflated
    };
    zip::write::FileOptions::default()
        .compression_method(method)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644)
        .large_file(size >= u32::MAX as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_hex(b"abc"));

        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(sha256_file(&empty).unwrap(), sha256_hex(b""));
    }

    #[test]
    fn test_hashing_writer() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"ab").unwrap();
        w.write_all(b"c").unwrap();
        let (buf, hash) = w.finish();
        assert_eq!(buf, b"abc");
        assert_eq!(hash, sha256_hex(b"abc"));
    }
}
