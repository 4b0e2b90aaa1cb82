//! Output file naming
//!
//! Picks the final path of a job (explicit name, then output template, then
//! the media title) and keeps concurrently running jobs from choosing the
//! same free name. Reservations are process-local; another program creating
//! the same file in between is not detected.

use parking_lot::Mutex;
use regex::{Captures, Regex};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::utils::file_utils::{sanitize_filename, unique_path};

/// Directory and base name of a job's output, before uniquification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputName {
    pub dir: PathBuf,
    pub stem: String,
}

/// Decide where a job writes. Precedence: explicit filename, output
/// template, sanitised title.
pub fn output_name(
    destination: &Path,
    filename: Option<&str>,
    template: Option<&str>,
    title: &str,
    media_id: &str,
    ext: &str,
) -> OutputName {
    if let Some(name) = filename.map(str::trim).filter(|n| !n.is_empty()) {
        let name = strip_extension(name, ext);
        return OutputName {
            dir: destination.to_path_buf(),
            stem: sanitize_filename(name),
        };
    }

    if let Some(template) = template.map(str::trim).filter(|t| !t.is_empty()) {
        let rendered = render_template(template, title, media_id, ext);
        let rendered_path = Path::new(&rendered);
        let stem = rendered_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = match rendered_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) if parent.is_absolute() => parent.to_path_buf(),
            Some(parent) => destination.join(parent),
            None => destination.to_path_buf(),
        };
        return OutputName {
            dir,
            stem: sanitize_filename(strip_extension(&stem, ext)),
        };
    }

    OutputName {
        dir: destination.to_path_buf(),
        stem: sanitize_filename(title),
    }
}

fn strip_extension<'a>(name: &'a str, ext: &str) -> &'a str {
    let suffix = format!(".{}", ext);
    match name.len().checked_sub(suffix.len()) {
        Some(cut) if cut > 0 && name.is_char_boundary(cut) && name[cut..].eq_ignore_ascii_case(&suffix) => {
            &name[..cut]
        }
        _ => name,
    }
}

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%%|%\(([A-Za-z0-9_]+)\)s").expect("template pattern is valid"))
}

/// Expand `%(title)s`, `%(id)s` and `%(ext)s`; unknown fields render as `NA`
pub fn render_template(template: &str, title: &str, media_id: &str, ext: &str) -> String {
    template_regex()
        .replace_all(template, |caps: &Captures| match caps.get(1).map(|m| m.as_str()) {
            None => "%".to_string(),
            Some("title") => sanitize_filename(title),
            Some("id") => sanitize_filename(media_id),
            Some("ext") => ext.to_string(),
            Some(_) => "NA".to_string(),
        })
        .into_owned()
}

/// Paths claimed by running jobs
#[derive(Debug, Clone, Default)]
pub struct NameRegistry {
    reserved: Arc<Mutex<HashSet<PathBuf>>>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the first free `stem.ext`, `stem (1).ext`, ... in `dir`,
    /// skipping files on disk and names held by other reservations.
    pub fn reserve(&self, dir: &Path, stem: &str, ext: &str) -> NameReservation {
        let mut reserved = self.reserved.lock();
        let path = unique_path(dir, stem, ext, |candidate| {
            candidate.exists() || reserved.contains(candidate)
        });
        reserved.insert(path.clone());
        debug!("Reserved output name {}", path.display());

        NameReservation {
            path,
            registry: self.clone(),
        }
    }

    #[cfg(test)]
    pub fn is_reserved(&self, path: &Path) -> bool {
        self.reserved.lock().contains(path)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.reserved.lock().len()
    }
}

/// A claimed output path, released on drop
#[derive(Debug)]
pub struct NameReservation {
    path: PathBuf,
    registry: NameRegistry,
}

impl NameReservation {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name without the extension
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

impl Drop for NameReservation {
    fn drop(&mut self) {
        self.registry.reserved.lock().remove(&self.path);
    }
}
