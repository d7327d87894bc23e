//! Reading archives, packed (zip) or unpacked (directory).

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{CartonError, Result};
use crate::types::CartonInfo;

use super::links::Links;
use super::manifest::Manifest;
use super::tensor_data::read_tensor_data;
use super::{carton_toml, sha256_hex, HashingWriter, CARTON_TOML, LINKS, MANIFEST, MISC_PREFIX, MODEL_PREFIX};

/// Largest buffer reserved up front from an entry's declared size.
const MAX_PREALLOC: u64 = 1 << 20;

fn initial_capacity(declared: u64) -> usize {
    declared.min(MAX_PREALLOC) as usize
}

/// An open archive.
pub enum Container {
    Zip {
        path: PathBuf,
        archive: ZipArchive<File>,
    },
    Dir(PathBuf),
}

/// Metadata and bookkeeping entries of an archive.
#[derive(Debug, Clone)]
pub struct ParsedCarton {
    pub info: CartonInfo,
    pub manifest: Option<Manifest>,
    pub manifest_sha256: Option<String>,
    pub links: Links,
}

/// A payload file listed in `MANIFEST` but stored by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingFile {
    pub dest: PathBuf,
    pub sha256: String,
}

impl Container {
    pub fn open(path: &Path) -> Result<Self> {
        if path.is_dir() {
            return Ok(Container::Dir(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let archive = ZipArchive::new(file).map_err(|e| {
            CartonError::invalid_archive(path, format!("not a readable zip file: {e}"))
        })?;
        Ok(Container::Zip {
            path: path.to_path_buf(),
            archive,
        })
    }

    pub fn path(&self) -> &Path {
        match self {
            Container::Zip { path, .. } => path,
            Container::Dir(path) => path,
        }
    }

    /// Read an entry; `None` if absent.
    pub fn read(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        match self {
            Container::Zip { archive, .. } => match archive.by_name(name) {
                Ok(mut entry) => {
                    let mut buf = Vec::with_capacity(initial_capacity(entry.size()));
                    entry.read_to_end(&mut buf)?;
                    Ok(Some(buf))
                }
                Err(ZipError::FileNotFound) => Ok(None),
                Err(e) => Err(e.into()),
            },
            Container::Dir(root) => match std::fs::read(root.join(name)) {
                Ok(buf) => Ok(Some(buf)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Names of all file entries, `/`-separated.
    pub fn names(&mut self) -> Result<Vec<String>> {
        match self {
            Container::Zip { archive, .. } => Ok(archive
                .file_names()
                .filter(|n| !n.ends_with('/'))
                .map(str::to_owned)
                .collect()),
            Container::Dir(root) => {
                let mut names = Vec::new();
                for entry in WalkDir::new(&*root).sort_by_file_name() {
                    let entry = entry.map_err(|e| CartonError::Io(e.into()))?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    if let Ok(rel) = entry.path().strip_prefix(&*root) {
                        let parts: Vec<_> = rel
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy().into_owned())
                            .collect();
                        names.push(parts.join("/"));
                    }
                }
                Ok(names)
            }
        }
    }

    /// Read an entry and check it against `manifest`.
    fn read_verified(&mut self, name: &str, manifest: Option<&Manifest>) -> Result<Option<Vec<u8>>> {
        let Some(bytes) = self.read(name)? else {
            return Ok(None);
        };
        if let Some(manifest) = manifest {
            let expected = manifest.get(name).ok_or_else(|| {
                CartonError::invalid_archive(self.path(), format!("{name} is not listed in MANIFEST"))
            })?;
            let actual = sha256_hex(&bytes);
            if actual != expected {
                return Err(CartonError::Integrity {
                    what: format!("{}:{name}", self.path().display()),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        Ok(Some(bytes))
    }

    /// Copy `model/` into `dest`, verifying each file against `manifest`.
    ///
    /// Returns the payload files that must be fetched through `LINKS`.
    pub fn extract_model(&mut self, manifest: Option<&Manifest>, dest: &Path) -> Result<Vec<MissingFile>> {
        let archive_path = self.path().to_path_buf();
        let mut present = HashSet::new();

        let mut write_entry = |name: &str, reader: &mut dyn Read| -> Result<()> {
            let rel = &name[MODEL_PREFIX.len()..];
            let target = safe_join(dest, rel).ok_or_else(|| {
                CartonError::invalid_archive(&archive_path, format!("unsafe payload path {name}"))
            })?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = HashingWriter::new(File::create(&target)?);
            std::io::copy(reader, &mut out)?;
            let (_, actual) = out.finish();
            if let Some(manifest) = manifest {
                let expected = manifest.get(name).ok_or_else(|| {
                    CartonError::invalid_archive(&archive_path, format!("{name} is not listed in MANIFEST"))
                })?;
                if actual != expected {
                    return Err(CartonError::Integrity {
                        what: format!("{}:{name}", archive_path.display()),
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
            present.insert(name.to_string());
            Ok(())
        };

        match self {
            Container::Zip { archive, .. } => {
                for i in 0..archive.len() {
                    let mut entry = archive.by_index(i)?;
                    let name = entry.name().to_string();
                    if entry.is_dir() || !name.starts_with(MODEL_PREFIX) {
                        continue;
                    }
                    write_entry(&name, &mut entry)?;
                }
            }
            Container::Dir(root) => {
                let model_root = root.join(MODEL_PREFIX.trim_end_matches('/'));
                if model_root.is_dir() {
                    for entry in WalkDir::new(&model_root).sort_by_file_name() {
                        let entry = entry.map_err(|e| CartonError::Io(e.into()))?;
                        if !entry.file_type().is_file() {
                            continue;
                        }
                        let rel = entry
                            .path()
                            .strip_prefix(&model_root)
                            .map_err(|e| CartonError::Internal(e.to_string()))?;
                        let parts: Vec<_> = rel
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy().into_owned())
                            .collect();
                        let name = format!("{MODEL_PREFIX}{}", parts.join("/"));
                        let mut file = File::open(entry.path())?;
                        write_entry(&name, &mut file)?;
                    }
                }
            }
        }

        let mut missing = Vec::new();
        for (name, sha) in manifest.into_iter().flat_map(|m| m.iter()) {
            if !name.starts_with(MODEL_PREFIX) || present.contains(name) {
                continue;
            }
            let dest_path = safe_join(dest, &name[MODEL_PREFIX.len()..]).ok_or_else(|| {
                CartonError::invalid_archive(self.path(), format!("unsafe payload path {name}"))
            })?;
            missing.push(MissingFile {
                dest: dest_path,
                sha256: sha.to_string(),
            });
        }
        debug!(
            archive = %self.path().display(),
            extracted = present.len(),
            linked = missing.len(),
            "Extracted payload"
        );
        Ok(missing)
    }
}

/// Join a `/`-separated relative path under `root`, refusing escapes.
fn safe_join(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for seg in rel.split('/') {
        if seg.is_empty() || seg == "." || seg == ".." || seg.contains('\\') {
            return None;
        }
        out.push(seg);
    }
    Some(out)
}

/// Parse metadata, `MANIFEST` and `LINKS`. Blocking.
///
/// Packed archives must carry a `MANIFEST`; every metadata entry read is
/// checked against it.
pub fn read_carton(container: &mut Container) -> Result<ParsedCarton> {
    let manifest_bytes = container.read(MANIFEST)?;
    if manifest_bytes.is_none() && matches!(container, Container::Zip { .. }) {
        return Err(CartonError::invalid_archive(container.path(), "missing MANIFEST"));
    }
    let manifest_sha256 = manifest_bytes.as_deref().map(sha256_hex);
    let manifest = manifest_bytes
        .map(|b| Manifest::parse(&String::from_utf8_lossy(&b)))
        .transpose()?;

    let toml_bytes = container
        .read_verified(CARTON_TOML, manifest.as_ref())?
        .ok_or_else(|| CartonError::invalid_archive(container.path(), "missing carton.toml"))?;
    let doc = carton_toml::parse(&String::from_utf8_lossy(&toml_bytes))?;

    let tensors = read_tensor_data(|name| container.read_verified(name, manifest.as_ref()))?;

    let mut misc = BTreeMap::new();
    for name in container.names()? {
        if let Some(misc_name) = name.strip_prefix(MISC_PREFIX) {
            if let Some(bytes) = container.read_verified(&name, manifest.as_ref())? {
                misc.insert(misc_name.to_string(), bytes);
            }
        }
    }

    let info = carton_toml::decode(doc, &tensors, &misc)?;

    let links = match container.read(LINKS)? {
        Some(bytes) => Links::parse(&String::from_utf8_lossy(&bytes))?,
        None => Links::default(),
    };

    Ok(ParsedCarton {
        info,
        manifest,
        manifest_sha256,
        links,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_join_rejects_escapes() {
        let root = Path::new("/tmp/x");
        assert_eq!(safe_join(root, "a/b.bin"), Some(PathBuf::from("/tmp/x/a/b.bin")));
        assert!(safe_join(root, "../etc/passwd").is_none());
        assert!(safe_join(root, "a//b").is_none());
    }

    #[test]
    fn test_declared_entry_size_is_not_trusted() {
        assert_eq!(initial_capacity(12), 12);
        assert_eq!(initial_capacity(0xFFFF_FFF0), MAX_PREALLOC as usize);
    }

    #[test]
    fn test_open_rejects_non_zip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.carton");
        std::fs::write(&path, b"definitely not a zip").unwrap();
        assert!(matches!(
            Container::open(&path),
            Err(CartonError::InvalidArchive { .. })
        ));
    }

    #[test]
    fn test_dir_without_carton_toml() {
        let dir = tempfile::tempdir().unwrap();
        let mut container = Container::open(dir.path()).unwrap();
        assert!(matches!(
            read_carton(&mut container),
            Err(CartonError::InvalidArchive { .. })
        ));
    }
}
