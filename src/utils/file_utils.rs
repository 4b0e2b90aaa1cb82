//! File system utilities

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::models::{AppError, AppResult};

/// Longest base name we hand to the file system
pub const MAX_FILENAME_LENGTH: usize = 240;

/// Suffixes the extraction tool leaves behind for unfinished transfers
const TEMPORARY_SUFFIXES: [&str; 3] = [".part", ".tmp", ".ytdl"];

/// Ensure directory exists
pub fn ensure_dir_exists(path: &Path) -> AppResult<()> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| {
            AppError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create directory {}: {}", path.display(), e),
            ))
        })?;
    }
    Ok(())
}

/// Sanitize filename for filesystem
///
/// Replaces characters that are invalid on common file systems with `_`,
/// collapses whitespace and caps the length. An empty result becomes
/// `download`.
pub fn sanitize_filename(filename: &str) -> String {
    let replaced: String = filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            '/' | '\\' => '_',
            '\0' => '_',
            c if c.is_control() && !c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed: String = if collapsed.chars().count() > MAX_FILENAME_LENGTH {
        collapsed
            .chars()
            .take(MAX_FILENAME_LENGTH)
            .collect::<String>()
            .trim_end()
            .to_string()
    } else {
        collapsed
    };

    // a bare "." or ".." would escape the destination folder
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        "download".to_string()
    } else {
        trimmed
    }
}

/// First free `stem.ext`, `stem (1).ext`, `stem (2).ext`, ... in `dir`.
///
/// `taken` decides whether a candidate is already in use; callers combine
/// an on-disk check with their own reservations.
pub fn unique_path<F>(dir: &Path, stem: &str, ext: &str, taken: F) -> PathBuf
where
    F: Fn(&Path) -> bool,
{
    let ext = ext.trim_start_matches('.');
    let file_name = |base: &str| {
        if ext.is_empty() {
            base.to_string()
        } else {
            format!("{}.{}", base, ext)
        }
    };

    let mut candidate = dir.join(file_name(stem));
    let mut counter = 1u32;
    while taken(&candidate) {
        candidate = dir.join(file_name(&format!("{} ({})", stem, counter)));
        counter += 1;
    }
    candidate
}

/// Whether a file name carries one of the temporary download suffixes
pub fn is_temporary_file(name: &str) -> bool {
    TEMPORARY_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) || name.contains(".part.")
        || name.contains(".part-Frag")
}

/// Remove leftover partial files (`*.part`, `*.part.*`, `*.tmp`, `*.ytdl`)
/// directly inside `folder`. Best effort: failures are logged, never raised.
pub fn cleanup_download_folder(folder: &Path) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    if !folder.is_dir() {
        return removed;
    }

    for entry in WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy();
        if !is_temporary_file(&name) {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => removed.push(entry.path().to_path_buf()),
            Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
        }
    }

    debug!(
        "Removed {} temporary files from {}",
        removed.len(),
        folder.display()
    );
    removed
}

/// Remove every file in `dir` whose name starts with `"{stem}."`.
///
/// Used for per-job intermediates whose exact extension is only known to
/// the extraction tool.
pub fn remove_files_with_stem(dir: &Path, stem: &str) -> Vec<PathBuf> {
    let prefix = format!("{}.", stem);
    let mut removed = Vec::new();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return removed,
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let path = entry.path();
        if path.is_file() {
            match fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
    removed
}

/// Remove a file if present, ignoring "not found"
pub fn remove_if_exists(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}

/// Human readable size with two decimals, or "Unknown"
pub fn format_file_size(bytes: Option<u64>) -> String {
    let Some(bytes) = bytes else {
        return "Unknown".to_string();
    };

    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{:.2} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.2} TB", size)
}
