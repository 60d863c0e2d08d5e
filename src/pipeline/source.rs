//! Document decomposition: a document → ordered page images.
//!
//! A [`DocumentSource`] knows how to list a document's pages in reading
//! order. Two sources ship with the crate:
//!
//! * [`ImageDirectory`]: every `png`/`jpg`/`jpeg` in a directory, in
//!   natural order (`page_2.png` before `page_10.png`).
//! * [`ImageList`]: an explicit list of files, order preserved.

use crate::error::VisionError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Extensions [`ImageDirectory`] picks up (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// One page image on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSource {
    pub path: PathBuf,
}

impl PageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lower-cased file extension, or "image" when there is none.
    pub fn file_type(&self) -> String {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "image".to_string())
    }
}

/// A page scheduled for description.
#[derive(Debug, Clone)]
pub struct PageTask {
    /// 0-based position in reading order.
    pub index: usize,
    pub source: PageSource,
    /// Prompt for this page; `None` means the model's default.
    pub prompt: Option<Arc<str>>,
    /// "provider/model" that will describe the page.
    pub model_name: String,
}

/// Something that can be split into ordered page images.
pub trait DocumentSource: Send + Sync {
    /// Used as the merged document's title.
    fn name(&self) -> String;

    /// Pages in reading order.
    ///
    /// # Errors
    /// [`VisionError::Decomposition`] when the document cannot be split.
    fn pages(&self) -> Result<Vec<PageSource>, VisionError>;
}

// ── Image directory ──────────────────────────────────────────────────────

/// Every image file directly inside a directory.
#[derive(Debug, Clone)]
pub struct ImageDirectory {
    dir: PathBuf,
}

impl ImageDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn failed(&self, detail: impl Into<String>) -> VisionError {
        VisionError::Decomposition {
            document: self.dir.display().to_string(),
            detail: detail.into(),
        }
    }
}

impl DocumentSource for ImageDirectory {
    fn name(&self) -> String {
        display_name(&self.dir)
    }

    fn pages(&self) -> Result<Vec<PageSource>, VisionError> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| self.failed(format!("cannot read directory: {e}")))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.failed(format!("cannot read entry: {e}")))?;
            let path = entry.path();
            if path.is_file() && is_image_file(&path) {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(self.failed("no png, jpg or jpeg files found"));
        }

        files.sort_by_cached_key(|p| natural_key(&file_name(p)));
        debug!("{}: {} page images", self.dir.display(), files.len());
        Ok(files.into_iter().map(PageSource::new).collect())
    }
}

// ── Explicit list ────────────────────────────────────────────────────────

/// Caller-ordered page images.
///
/// Files are not checked here; a missing or undecodable file fails only its
/// own page.
#[derive(Debug, Clone)]
pub struct ImageList {
    name: String,
    paths: Vec<PathBuf>,
}

impl ImageList {
    /// Named after the first file's stem.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        let name = paths
            .first()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        Self { name, paths }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl DocumentSource for ImageList {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn pages(&self) -> Result<Vec<PageSource>, VisionError> {
        if self.paths.is_empty() {
            return Err(VisionError::Decomposition {
                document: self.name.clone(),
                detail: "no page images given".into(),
            });
        }
        Ok(self.paths.iter().cloned().map(PageSource::new).collect())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn display_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| dir.display().to_string())
}

static RE_CHUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+|\D+").unwrap());

/// Digit runs compare numerically, everything else case-insensitively.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Chunk {
    /// (significant digit count, digits without leading zeros)
    Number(usize, String),
    Text(String),
}

fn natural_key(name: &str) -> Vec<Chunk> {
    RE_CHUNK
        .find_iter(name)
        .map(|m| {
            let s = m.as_str();
            if s.as_bytes()[0].is_ascii_digit() {
                let digits = s.trim_start_matches('0');
                Chunk::Number(digits.len(), digits.to_string())
            } else {
                Chunk::Text(s.to_lowercase())
            }
        })
        .collect()
}
