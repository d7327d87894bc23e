//! Archive writer.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{CartonError, Result};
use crate::types::{CartonInfo, LinkedFile};

use super::carton_toml;
use super::links::Links;
use super::manifest::Manifest;
use super::validate::{validate_info, validate_linked_files};
use super::{
    entry_options, sha256_file, sha256_hex, CARTON_TOML, LINKS, MANIFEST, MISC_PREFIX,
    MODEL_PREFIX,
};

enum EntrySource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// Payload files of `source_dir` as `(model/<relative path>, absolute path)`.
fn collect_payload(source_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !source_dir.is_dir() {
        return Err(CartonError::Validation(format!(
            "{} is not a directory",
            source_dir.display()
        )));
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(source_dir)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| CartonError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| CartonError::Internal(e.to_string()))?;
        let parts = rel
            .components()
            .map(|c| {
                c.as_os_str().to_str().map(str::to_owned).ok_or_else(|| {
                    CartonError::Validation(format!("non UTF-8 path {}", rel.display()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        out.push((
            format!("{MODEL_PREFIX}{}", parts.join("/")),
            entry.path().to_path_buf(),
        ));
    }
    Ok(out)
}

fn output_file(output_path: Option<&Path>) -> Result<NamedTempFile> {
    Ok(match output_path {
        Some(path) => {
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            NamedTempFile::new_in(parent)?
        }
        None => tempfile::Builder::new()
            .prefix("carton_")
            .suffix(".carton")
            .tempfile()?,
    })
}

/// Pack `source_dir` and `info` into a new archive; returns its path.
///
/// Payload files whose hash is a key of `linked_files` are listed in
/// `MANIFEST` but not stored. Blocking.
pub fn pack_dir(
    source_dir: &Path,
    info: &CartonInfo,
    linked_files: &[LinkedFile],
    runner_compat_version: u64,
    output_path: Option<&Path>,
) -> Result<PathBuf> {
    validate_info(info)?;
    validate_linked_files(linked_files)?;

    let linked: HashMap<&str, &LinkedFile> = linked_files
        .iter()
        .map(|f| (f.sha256.as_str(), f))
        .collect();

    let mut manifest = Manifest::new();
    let mut entries: BTreeMap<String, EntrySource> = BTreeMap::new();

    let mut linked_count = 0usize;
    for (name, path) in collect_payload(source_dir)? {
        let sha = sha256_file(&path)?;
        if linked.contains_key(sha.as_str()) {
            debug!(file = %name, sha256 = %sha, "Storing payload file by reference");
            linked_count += 1;
        } else {
            entries.insert(name.clone(), EntrySource::File(path));
        }
        manifest.insert(name, sha);
    }

    let encoded = carton_toml::encode(info, runner_compat_version)?;
    let mut add_bytes = |name: String, bytes: Vec<u8>| {
        manifest.insert(name.clone(), sha256_hex(&bytes));
        entries.insert(name, EntrySource::Bytes(bytes));
    };
    add_bytes(CARTON_TOML.to_string(), encoded.carton_toml.into_bytes());
    for (name, bytes) in encoded.extra_files {
        add_bytes(name, bytes);
    }
    for (name, bytes) in info.misc_files.iter().flatten() {
        add_bytes(format!("{MISC_PREFIX}{name}"), bytes.clone());
    }

    let links = Links::from_linked_files(linked_files);

    let mut tmp = output_file(output_path)?;
    {
        let mut zip = zip::ZipWriter::new(tmp.as_file_mut());
        for (name, source) in &entries {
            match source {
                EntrySource::Bytes(bytes) => {
                    zip.start_file(name.as_str(), entry_options(name, bytes.len() as u64))?;
                    zip.write_all(bytes)?;
                }
                EntrySource::File(path) => {
                    let mut file = std::fs::File::open(path)?;
                    let size = file.metadata()?.len();
                    zip.start_file(name.as_str(), entry_options(name, size))?;
                    std::io::copy(&mut file, &mut zip)?;
                }
            }
        }

        let manifest_text = manifest.to_text();
        zip.start_file(MANIFEST, entry_options(MANIFEST, manifest_text.len() as u64))?;
        zip.write_all(manifest_text.as_bytes())?;

        if !links.is_empty() {
            let links_text = links.to_text()?;
            zip.start_file(LINKS, entry_options(LINKS, links_text.len() as u64))?;
            zip.write_all(links_text.as_bytes())?;
        }
        zip.finish()?;
    }

    let path = match output_path {
        Some(path) => {
            tmp.persist(path).map_err(|e| CartonError::Io(e.error))?;
            path.to_path_buf()
        }
        None => tmp.keep().map_err(|e| CartonError::Io(e.error))?.1,
    };

    info!(
        archive = %path.display(),
        runner = %info.runner.runner_name,
        files = manifest.len(),
        linked = linked_count,
        "Packed carton"
    );
    Ok(path)
}
