//! Core data types, enums, and reports for the Seihon pipeline.
//!
//! This module defines the fundamental data structures shared across the crate:
//! - Requests handed in by collaborators (`VolumeRequest`, `ChapterRequest`, `PageSpec`)
//! - Status enumerations persisted in manifests (`CompletionStatus`, `PageStatus`)
//! - Metadata embedded in generated containers (`MangaMetadata`, `Direction`)
//! - Reporting types (`FetchStats`, `ChapterFetchOutcome`, `VolumeOutcome`, `BatchReport`)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Reading direction for the generated container.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "specta", derive(specta::Type))]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ltr,
    #[default]
    Rtl,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ltr => "ltr",
            Direction::Rtl => "rtl",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion state of a chapter or a whole volume.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "specta", derive(specta::Type))]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    #[default]
    Incomplete,
    Complete,
}

/// Validation state of a single page file.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(feature = "specta", derive(specta::Type))]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    #[default]
    Invalid,
    Valid,
}

/// Metadata embedded into the package document of every generated volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub struct MangaMetadata {
    pub title: String,
    pub authors: Vec<String>,
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>, // Emitted as dc:subject entries
    pub language: String,  // e.g., "en", "ja"
    pub identifier: Option<String>, // Stable identifier; generated per volume when absent
    /// Fixed `dcterms:modified` value. Leave `None` to stamp the emission time.
    pub modified: Option<DateTime<Utc>>,
}

impl MangaMetadata {
    /// Creates a default `MangaMetadata` instance with a specified title and default language "en".
    pub fn default_with_title(title: String) -> Self {
        Self {
            title,
            language: "en".to_string(),
            ..Default::default()
        }
    }
}

/// One page to fetch: its 1-based number inside the chapter and its source URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub struct PageSpec {
    pub page_number: u32,
    pub url: String,
}

impl PageSpec {
    /// Numbers an ordered list of URLs starting at page 1.
    pub fn from_urls<I, S>(urls: I) -> Vec<PageSpec>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        urls.into_iter()
            .enumerate()
            .map(|(i, url)| PageSpec {
                page_number: i as u32 + 1,
                url: url.into(),
            })
            .collect()
    }
}

/// Orders chapter numbers numerically; labels that are not numbers sort last.
pub fn chapter_sort_key(number: &str) -> f64 {
    number.trim().parse::<f64>().unwrap_or(f64::MAX)
}

/// "Chapter <number>: <title>", or "Chapter <number>" without a usable title.
pub fn chapter_display_title(number: &str, title: Option<&str>) -> String {
    match title.map(str::trim) {
        Some(t) if !t.is_empty() => format!("Chapter {}: {}", number, t),
        _ => format!("Chapter {}", number),
    }
}

/// A chapter as described by the metadata collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub struct ChapterRequest {
    pub id: String,
    /// Display number, kept as text because sources use values like "10.5".
    pub number: String,
    pub title: Option<String>,
    pub pages: Vec<PageSpec>,
}

impl ChapterRequest {
    /// Numeric value of the display number, used for ordering chapters.
    pub fn sort_key(&self) -> f64 {
        chapter_sort_key(&self.number)
    }

    /// Title shown in navigation, e.g. "Chapter 3: The Storm".
    pub fn display_title(&self) -> String {
        chapter_display_title(&self.number, self.title.as_deref())
    }
}

/// A volume to download and bind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub struct VolumeRequest {
    pub manga_id: String,
    pub manga_title: String,
    /// Volume label, "0" for chapters that belong to no volume.
    pub volume: String,
    pub chapters: Vec<ChapterRequest>,
}

impl VolumeRequest {
    /// Chapters ordered by their numeric display number.
    pub fn sorted_chapters(&self) -> Vec<ChapterRequest> {
        let mut chapters = self.chapters.clone();
        chapters.sort_by(|a, b| {
            a.sort_key()
                .partial_cmp(&b.sort_key())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        chapters
    }
}

/// Counters accumulated while fetching pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub struct FetchStats {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Extra attempts made after a first failed attempt.
    pub retries: usize,
}

impl AddAssign for FetchStats {
    fn add_assign(&mut self, other: Self) {
        self.downloaded += other.downloaded;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.retries += other.retries;
    }
}

/// Result of fetching one chapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub struct ChapterFetchOutcome {
    pub chapter_id: String,
    pub successful: usize,
    pub total: usize,
    pub stats: FetchStats,
    /// Final page files in page order; failed pages are absent.
    pub files: Vec<PathBuf>,
}

impl ChapterFetchOutcome {
    pub fn is_complete(&self) -> bool {
        self.successful == self.total
    }
}

/// Result of fetching every chapter of a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub struct VolumeDownloadReport {
    pub volume: String,
    pub volume_path: PathBuf,
    pub chapters: Vec<ChapterFetchOutcome>,
    pub stats: FetchStats,
}

impl VolumeDownloadReport {
    pub fn successful_chapters(&self) -> usize {
        self.chapters.iter().filter(|c| c.is_complete()).count()
    }

    pub fn is_complete(&self) -> bool {
        !self.chapters.is_empty() && self.successful_chapters() == self.chapters.len()
    }
}

/// Final classification of a processed volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub enum VolumeOutcome {
    /// Every page was fetched and the container was written.
    Complete { output: PathBuf },
    /// Some pages or chapters failed. `output` is set when a partial container was
    /// still written because incomplete volumes were accepted.
    Incomplete {
        successful_chapters: usize,
        total_chapters: usize,
        successful_pages: usize,
        total_pages: usize,
        output: Option<PathBuf>,
    },
    /// The volume could not be processed at all.
    Failed { reason: String },
}

impl VolumeOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, VolumeOutcome::Complete { .. })
    }
}

/// Aggregated report over a batch of volumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "specta", derive(specta::Type))]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcomes: Vec<(String, VolumeOutcome)>,
    pub stats: FetchStats,
}

impl BatchReport {
    pub fn successful(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_complete()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.successful()
    }
}

/// Cover selection for generated volumes.
#[derive(Debug, Clone, Default)]
pub enum CoverOptions {
    /// No cover page.
    None,
    /// Use the first page of the first chapter and leave it out of the chapter content.
    #[default]
    FirstPage,
    /// The same image for every volume.
    Single(PathBuf),
    /// An image per volume label; volumes without an entry fall back to the first page.
    PerVolume(HashMap<String, PathBuf>),
}

/// Utility function: Determines file type and MIME type from an image path
///
/// # Arguments
///
/// * `image_path` - Path to the file to analyze
///
/// # Returns
///
/// * `Ok((&str, &str))` - A tuple containing (normalized extension, MIME type)
/// * `Err(Error)` - An error if the file format is unsupported
///
/// # Supported formats
///
/// - JPEG/JPG: image/jpeg
/// - PNG: image/png
/// - GIF: image/gif
/// - WebP: image/webp
pub fn get_file_info(image_path: &Path) -> Result<(&'static str, &'static str)> {
    let ext = image_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => Ok(("jpg", "image/jpeg")),
        Some("png") => Ok(("png", "image/png")),
        Some("gif") => Ok(("gif", "image/gif")),
        Some("webp") => Ok(("webp", "image/webp")),
        _ => Err(Error::Unsupported(format!("Image format {:#?}", ext))),
    }
}
