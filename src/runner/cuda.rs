//! One-time discovery of CUDA library directories for GPU runners.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, info};

static CUDA_LIB_DIRS: OnceLock<Vec<PathBuf>> = OnceLock::new();

const WELL_KNOWN_DIRS: &[&str] = &[
    "/usr/local/cuda/lib64",
    "/usr/lib/x86_64-linux-gnu",
    "/usr/lib/aarch64-linux-gnu",
    "/usr/lib/wsl/lib",
];

fn has_cuda_libs(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|e| {
        let name = e.file_name();
        let name = name.to_string_lossy();
        name.starts_with("libcuda.so") || name.starts_with("libcudart.so")
    })
}

fn discover() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    for var in ["CUDA_HOME", "CUDA_PATH"] {
        if let Some(root) = std::env::var_os(var) {
            let root = PathBuf::from(root);
            candidates.push(root.join("lib64"));
            candidates.push(root.join("lib"));
        }
    }
    candidates.extend(WELL_KNOWN_DIRS.iter().map(PathBuf::from));

    let mut found = Vec::new();
    for dir in candidates {
        if !found.contains(&dir) && has_cuda_libs(&dir) {
            found.push(dir);
        }
    }
    if found.is_empty() {
        debug!("No CUDA libraries found");
    } else {
        info!(dirs = ?found, "Discovered CUDA library directories");
    }
    found
}

/// CUDA library directories on this host. Scanned once per process.
pub fn cuda_library_dirs() -> &'static [PathBuf] {
    CUDA_LIB_DIRS.get_or_init(discover)
}

/// `existing` with the CUDA directories prepended, or `None` when there
/// is nothing to add.
pub fn library_path_with_cuda(existing: Option<OsString>) -> Option<OsString> {
    prepend_dirs(cuda_library_dirs(), existing)
}

fn prepend_dirs(dirs: &[PathBuf], existing: Option<OsString>) -> Option<OsString> {
    if dirs.is_empty() {
        return existing;
    }
    let mut paths: Vec<PathBuf> = dirs.to_vec();
    if let Some(existing) = &existing {
        paths.extend(std::env::split_paths(existing).filter(|p| !dirs.contains(p)));
    }
    std::env::join_paths(paths).ok().or(existing)
}
