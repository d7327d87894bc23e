//! Replace embedded payload files with URL references.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::info;
use zip::ZipArchive;

use crate::error::{CartonError, Result};
use crate::types::LinkedFile;

use super::links::Links;
use super::manifest::Manifest;
use super::validate::validate_linked_files;
use super::{entry_options, HashingWriter, LINKS, MANIFEST, MODEL_PREFIX};

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Result<Option<String>> {
    match archive.by_name(name) {
        Ok(mut entry) => {
            let mut text = String::new();
            std::io::Read::read_to_string(&mut entry, &mut text)?;
            Ok(Some(text))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a copy of `source` in which every `model/` file whose manifest
/// hash is a key of `linked_files` is dropped and `LINKS` is extended.
///
/// The source is never modified. On an integrity failure nothing is
/// written. Entries are rewritten with canonical options, so shrinking
/// the result again with the same map gives identical bytes. Blocking.
pub fn shrink_archive(
    source: &Path,
    linked_files: &[LinkedFile],
    output_path: Option<&Path>,
) -> Result<PathBuf> {
    validate_linked_files(linked_files)?;
    if source.is_dir() {
        return Err(CartonError::Validation(format!(
            "{} is a directory; shrink needs a packed archive",
            source.display()
        )));
    }

    let mut archive = ZipArchive::new(File::open(source)?).map_err(|e| {
        CartonError::invalid_archive(source, format!("not a readable zip file: {e}"))
    })?;
    let manifest = read_entry(&mut archive, MANIFEST)?
        .ok_or_else(|| CartonError::invalid_archive(source, "missing MANIFEST"))?;
    let manifest = Manifest::parse(&manifest)?;
    let mut links = match read_entry(&mut archive, LINKS)? {
        Some(text) => Links::parse(&text)?,
        None => Links::default(),
    };

    let keys: HashSet<&str> = linked_files.iter().map(|f| f.sha256.as_str()).collect();

    let mut tmp = match output_path {
        Some(path) => match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => NamedTempFile::new_in(p)?,
            _ => NamedTempFile::new_in(".")?,
        },
        None => tempfile::Builder::new()
            .prefix("carton_")
            .suffix(".carton")
            .tempfile()?,
    };

    let mut replaced = 0usize;
    {
        let mut zip = zip::ZipWriter::new(tmp.as_file_mut());
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let name = entry.name().to_string();
            if entry.is_dir() || name == LINKS {
                continue;
            }

            let declared = manifest.get(&name);
            let selected = name.starts_with(MODEL_PREFIX)
                && declared.map_or(false, |sha| keys.contains(sha));
            if selected {
                let mut sink = HashingWriter::new(std::io::sink());
                std::io::copy(&mut entry, &mut sink)?;
                let (_, actual) = sink.finish();
                let expected = declared.unwrap_or_default();
                if actual != expected {
                    return Err(CartonError::Integrity {
                        what: format!("{}:{name}", source.display()),
                        expected: expected.to_string(),
                        actual,
                    });
                }
                replaced += 1;
                continue;
            }

            zip.start_file(name.as_str(), entry_options(&name, entry.size()))?;
            std::io::copy(&mut entry, &mut zip)?;
        }

        links.merge(linked_files);
        if !links.is_empty() {
            let text = links.to_text()?;
            zip.start_file(LINKS, entry_options(LINKS, text.len() as u64))?;
            zip.write_all(text.as_bytes())?;
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
        source = %source.display(),
        output = %path.display(),
        replaced,
        "Shrunk carton"
    );
    Ok(path)
}
