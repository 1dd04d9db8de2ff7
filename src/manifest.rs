//! Durable per-volume progress records.
//!
//! A [`VolumeManifest`] lives at `<volume_dir>/manifest.json` and is the single
//! source of truth for resuming a download: which chapters exist, where their
//! pages were written, and whether every page validated. Mutations return a new
//! value; [`ManifestHandle`] serializes concurrent writers of one volume and
//! persists after every change.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::path_utils::{MANIFEST_FILE_NAME, temp_path_for};
use crate::types::{CompletionStatus, PageStatus};

/// One page entry of a chapter record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    pub page_number: u32,
    pub file_path: PathBuf,
    pub url: String,
    pub status: PageStatus,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    pub last_updated: DateTime<Utc>,
}

/// One chapter entry of a volume manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterRecord {
    pub id: String,
    pub number: String,
    #[serde(default)]
    pub title: Option<String>,
    pub directory: PathBuf,
    pub status: CompletionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_pages: Option<usize>,
    #[serde(default)]
    pub pages: BTreeMap<u32, PageRecord>,
}

impl ChapterRecord {
    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            number: String::new(),
            title: None,
            directory: PathBuf::new(),
            status: CompletionStatus::Incomplete,
            total_pages: None,
            successful_pages: None,
            pages: BTreeMap::new(),
        }
    }

    /// Complete iff every known page is valid and, when the expected page
    /// count is known, at least that many pages are recorded.
    fn derived_status(&self) -> CompletionStatus {
        let all_valid = !self.pages.is_empty()
            && self.pages.values().all(|p| p.status == PageStatus::Valid);
        let enough = self.total_pages.is_none_or(|total| self.pages.len() >= total);
        if all_valid && enough {
            CompletionStatus::Complete
        } else {
            CompletionStatus::Incomplete
        }
    }

    /// Page files recorded as valid, in page order.
    pub fn valid_files(&self) -> Vec<PathBuf> {
        self.pages
            .values()
            .filter(|p| p.status == PageStatus::Valid)
            .map(|p| p.file_path.clone())
            .collect()
    }
}

/// Fields a caller may set on a chapter. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct ChapterUpdate {
    pub id: String,
    pub number: Option<String>,
    pub title: Option<String>,
    pub directory: Option<PathBuf>,
    /// Explicit status; when absent the status is derived from the pages.
    pub status: Option<CompletionStatus>,
    pub total_pages: Option<usize>,
    pub successful_pages: Option<usize>,
}

/// Fields a caller may set on a page. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct PageUpdate {
    pub page_number: u32,
    pub file_path: Option<PathBuf>,
    pub url: Option<String>,
    pub status: Option<PageStatus>,
    pub skipped: Option<bool>,
}

/// Persisted snapshot of one volume's fetch state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeManifest {
    pub manga_id: String,
    pub manga_title: String,
    pub volume_number: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub status: CompletionStatus,
    #[serde(default)]
    pub chapters: BTreeMap<String, ChapterRecord>,
}

impl VolumeManifest {
    /// Creates an empty, incomplete manifest.
    pub fn new(manga_id: &str, manga_title: &str, volume_number: &str) -> Self {
        let now = Utc::now();
        Self {
            manga_id: manga_id.to_string(),
            manga_title: manga_title.to_string(),
            volume_number: volume_number.to_string(),
            created_at: now,
            last_updated: now,
            status: CompletionStatus::Incomplete,
            chapters: BTreeMap::new(),
        }
    }

    /// Path of the manifest file inside a volume directory.
    pub fn path_in(volume_path: &Path) -> PathBuf {
        volume_path.join(MANIFEST_FILE_NAME)
    }

    /// Reads the manifest of a volume directory.
    ///
    /// A missing file yields `None`. So does an unreadable or corrupt one, after
    /// logging a warning: the caller starts over rather than failing.
    pub async fn load(volume_path: &Path) -> Option<VolumeManifest> {
        let path = Self::path_in(volume_path);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Could not read manifest {:?}: {}", path, e);
                return None;
            }
        };
        match serde_json::from_slice::<VolumeManifest>(&bytes) {
            Ok(manifest) => {
                debug!(
                    "Loaded manifest {:?} with {} chapters",
                    path,
                    manifest.chapters.len()
                );
                Some(manifest)
            }
            Err(e) => {
                warn!("Ignoring corrupt manifest {:?}: {}", path, e);
                None
            }
        }
    }

    /// Writes the manifest atomically: a temporary sibling is written first and
    /// renamed over `manifest.json`.
    pub async fn save(&self, volume_path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(volume_path).await?;
        let path = Self::path_in(volume_path);
        let tmp = temp_path_for(&path);
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, &json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Merges chapter fields and recomputes the chapter and volume status.
    pub fn upsert_chapter(mut self, update: ChapterUpdate) -> Self {
        let now = Utc::now();
        let chapter = self
            .chapters
            .entry(update.id.clone())
            .or_insert_with(|| ChapterRecord::empty(&update.id));

        if let Some(number) = update.number {
            chapter.number = number;
        }
        if update.title.is_some() {
            chapter.title = update.title;
        }
        if let Some(directory) = update.directory {
            chapter.directory = directory;
        }
        if update.total_pages.is_some() {
            chapter.total_pages = update.total_pages;
        }
        if update.successful_pages.is_some() {
            chapter.successful_pages = update.successful_pages;
        }
        let status = match update.status {
            Some(status) => status,
            None => chapter.derived_status(),
        };
        chapter.status = status;

        self.last_updated = now;
        self.status = self.derived_status();
        self
    }

    /// Merges page fields, creating the chapter record when unknown, and
    /// recomputes the owning chapter's status and the volume status.
    pub fn upsert_page(mut self, chapter_id: &str, update: PageUpdate) -> Self {
        let now = Utc::now();
        let chapter = self
            .chapters
            .entry(chapter_id.to_string())
            .or_insert_with(|| ChapterRecord::empty(chapter_id));

        let page = chapter
            .pages
            .entry(update.page_number)
            .or_insert_with(|| PageRecord {
                page_number: update.page_number,
                file_path: PathBuf::new(),
                url: String::new(),
                status: PageStatus::Invalid,
                skipped: false,
                last_updated: now,
            });

        if let Some(file_path) = update.file_path {
            page.file_path = file_path;
        }
        if let Some(url) = update.url {
            page.url = url;
        }
        if let Some(status) = update.status {
            page.status = status;
        }
        if let Some(skipped) = update.skipped {
            page.skipped = skipped;
        }
        page.last_updated = now;

        chapter.status = chapter.derived_status();
        self.last_updated = now;
        self.status = self.derived_status();
        self
    }

    fn derived_status(&self) -> CompletionStatus {
        if !self.chapters.is_empty()
            && self
                .chapters
                .values()
                .all(|c| c.status == CompletionStatus::Complete)
        {
            CompletionStatus::Complete
        } else {
            CompletionStatus::Incomplete
        }
    }

    /// Sets the volume status explicitly, e.g. after the container was written.
    pub fn with_status(mut self, status: CompletionStatus) -> Self {
        self.status = status;
        self.last_updated = Utc::now();
        self
    }

    pub fn page_record(&self, chapter_id: &str, page_number: u32) -> Option<&PageRecord> {
        self.chapters.get(chapter_id)?.pages.get(&page_number)
    }

    pub fn is_page_valid(&self, chapter_id: &str, page_number: u32) -> bool {
        self.page_record(chapter_id, page_number)
            .is_some_and(|p| p.status == PageStatus::Valid)
    }

    /// (complete chapters, known chapters)
    pub fn chapter_summary(&self) -> (usize, usize) {
        let complete = self
            .chapters
            .values()
            .filter(|c| c.status == CompletionStatus::Complete)
            .count();
        (complete, self.chapters.len())
    }
}

/// Shared writer for the manifest of one volume.
///
/// Every mutation runs read-merge-write-save under one lock, so saves of a
/// volume never interleave. A failed save is logged and the in-memory state is
/// kept; the next successful save persists it.
#[derive(Clone, Debug)]
pub struct ManifestHandle {
    volume_path: PathBuf,
    inner: Arc<Mutex<VolumeManifest>>,
}

impl ManifestHandle {
    pub fn new(volume_path: &Path, manifest: VolumeManifest) -> Self {
        Self {
            volume_path: volume_path.to_path_buf(),
            inner: Arc::new(Mutex::new(manifest)),
        }
    }

    pub fn volume_path(&self) -> &Path {
        &self.volume_path
    }

    pub async fn snapshot(&self) -> VolumeManifest {
        self.inner.lock().await.clone()
    }

    /// Applies `change` to the current manifest and persists the result.
    pub async fn update<F>(&self, change: F)
    where
        F: FnOnce(VolumeManifest) -> VolumeManifest,
    {
        let mut guard = self.inner.lock().await;
        let next = change(guard.clone());
        *guard = next;
        if let Err(e) = guard.save(&self.volume_path).await {
            warn!(
                "Failed to persist manifest for {:?}: {}",
                self.volume_path, e
            );
        }
    }

    pub async fn record_page(&self, chapter_id: &str, update: PageUpdate) {
        self.update(|m| m.upsert_page(chapter_id, update)).await
    }

    pub async fn record_chapter(&self, update: ChapterUpdate) {
        self.update(|m| m.upsert_chapter(update)).await
    }
}
