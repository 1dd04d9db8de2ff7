use chrono::Utc;
use futures::future::join_all;
use log::{error, info, warn};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;

use crate::emitter::{emit_blocking, verify_container};
use crate::error::{Error, Result};
use crate::fetch::{FetchPolicy, PageFetcher, PageSource};
use crate::manifest::{ManifestHandle, VolumeManifest};
use crate::package::Package;
use crate::path_utils::{manga_dir, volume_dir, volume_file_stem};
use crate::transform::{KEPUB_EXTENSION, apply_device_profile};
use crate::types::{
    BatchReport, CompletionStatus, CoverOptions, Direction, FetchStats, MangaMetadata,
    VolumeDownloadReport, VolumeOutcome, VolumeRequest, chapter_display_title, chapter_sort_key,
};

/// The main Seihon configuration, built declaratively using the builder pattern.
///
/// One configuration drives the whole pipeline for a manga: fetching page
/// images into a resumable on-disk layout, binding each volume into an EPUB
/// and optionally rewriting it for Kobo devices. Entry points:
///
/// - [`download_volume`](SeihonConfig::download_volume): fetch only
/// - [`assemble_volume`](SeihonConfig::assemble_volume): bind already fetched pages
/// - [`process_volume`](SeihonConfig::process_volume): fetch, then bind
/// - [`process_volumes`](SeihonConfig::process_volumes): many volumes concurrently
///
/// ## Builder Pattern
///
/// ```rust,no_run
/// # use seihon::prelude::*;
/// # use std::path::PathBuf;
/// let config = SeihonConfig::builder()
///     .metadata(MangaMetadata::default_with_title("My Manga".to_string()))
///     .output_dir(PathBuf::from("./library"))
///     .device_variant(true)
///     .build()
///     .expect("Invalid configuration");
/// ```
#[derive(Clone, derive_builder::Builder)]
#[builder(setter(into, strip_option), build_fn(validate = "Self::validate"))]
pub struct SeihonConfig {
    // --- Core Settings ---
    /// Series metadata written into every volume.
    #[builder(default = "MangaMetadata::default_with_title(\"Untitled Manga\".to_string())")]
    pub metadata: MangaMetadata,

    /// Root of the library. Volumes land in `output_dir/<title>/volume_<label>/`
    /// and bound files in `output_dir/<title>/`.
    pub output_dir: PathBuf,

    /// Page progression of the bound volumes.
    #[builder(default = "Direction::Rtl")]
    pub reading_direction: Direction,

    // --- Fetching ---
    #[builder(default = "2")]
    pub max_concurrent_volumes: usize,

    #[builder(default = "5")]
    pub max_concurrent_chapters: usize,

    /// Concurrent page downloads within one chapter.
    #[builder(default = "5")]
    pub max_concurrent_pages: usize,

    /// Attempts per page, including the first one.
    #[builder(default = "3")]
    pub max_attempts: u32,

    /// Delay before the first retry; later retries multiply it by `backoff_multiplier`.
    #[builder(default = "Duration::from_secs(2)")]
    pub retry_delay: Duration,

    #[builder(default = "2.0")]
    pub backoff_multiplier: f64,

    /// A page fetch running longer than this counts as a failed attempt.
    #[builder(default = "Duration::from_secs(30)")]
    pub page_timeout: Duration,

    /// Reuse page files already on disk when they decode as images.
    #[builder(default = "true")]
    pub check_local: bool,

    /// Ignore the manifest and every local file.
    #[builder(default = "false")]
    pub force_redownload: bool,

    // --- Assembly ---
    /// Write `.kepub.epub` files with Kobo markup instead of plain EPUBs.
    #[builder(default = "false")]
    pub device_variant: bool,

    /// Replace bound files that already exist.
    #[builder(default = "false")]
    pub allow_overwrite: bool,

    #[builder(default)]
    pub cover_options: CoverOptions,

    /// Bind volumes even when some pages could not be fetched.
    #[builder(default = "false")]
    pub accept_incomplete: bool,

    #[builder(default = "num_cpus::get().min(4)")]
    pub max_concurrent_assemblies: usize,

    /// Cancels every fetch started from this configuration.
    #[builder(default)]
    pub cancellation: CancellationToken,
}

impl std::fmt::Debug for SeihonConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeihonConfig")
            .field("metadata", &self.metadata)
            .field("output_dir", &self.output_dir)
            .field("reading_direction", &self.reading_direction)
            .field("max_concurrent_volumes", &self.max_concurrent_volumes)
            .field("max_concurrent_chapters", &self.max_concurrent_chapters)
            .field("max_concurrent_pages", &self.max_concurrent_pages)
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("page_timeout", &self.page_timeout)
            .field("check_local", &self.check_local)
            .field("force_redownload", &self.force_redownload)
            .field("device_variant", &self.device_variant)
            .field("allow_overwrite", &self.allow_overwrite)
            .field("cover_options", &self.cover_options)
            .field("accept_incomplete", &self.accept_incomplete)
            .field("max_concurrent_assemblies", &self.max_concurrent_assemblies)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

/// One chapter handed to assembly: navigation title and page images in order.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeChapter {
    pub id: String,
    pub title: String,
    pub pages: Vec<PathBuf>,
}

impl VolumeChapter {
    /// Chapters of `manifest` in numeric order, each with its valid page files.
    pub fn from_manifest(manifest: &VolumeManifest) -> Vec<VolumeChapter> {
        let mut records: Vec<_> = manifest.chapters.values().collect();
        records.sort_by(|a, b| {
            chapter_sort_key(&a.number)
                .partial_cmp(&chapter_sort_key(&b.number))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        records
            .into_iter()
            .map(|record| VolumeChapter {
                id: record.id.clone(),
                title: chapter_display_title(&record.number, record.title.as_deref()),
                pages: record.valid_files(),
            })
            .collect()
    }
}

/// Title of a bound volume as shown by readers.
pub fn volume_title(manga_title: &str, volume: &str) -> String {
    if volume.trim() == "0" {
        format!("{} - Ungrouped Chapters", manga_title)
    } else {
        format!("{} - Volume {}", manga_title, volume.trim())
    }
}

impl SeihonConfig {
    pub fn builder() -> SeihonConfigBuilder {
        SeihonConfigBuilder::default()
    }

    /// Checks the configuration before any network or disk work.
    ///
    /// # Returns
    ///
    /// * `Ok(&self)` - The configuration can be used
    /// * `Err(Error)` - Missing title, missing output directory, or an output
    ///   path that exists but is not a directory
    pub fn preflight_check(&self) -> Result<&Self> {
        if self.metadata.title.trim().is_empty() {
            return Err(Error::Other("Manga title is required".to_string()));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(Error::Other("Output directory is required".to_string()));
        }
        if self.output_dir.exists() && !self.output_dir.is_dir() {
            return Err(Error::InvalidPath(
                self.output_dir.clone(),
                "Output path is not a directory.".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            max_concurrent_volumes: self.max_concurrent_volumes,
            max_concurrent_chapters: self.max_concurrent_chapters,
            max_concurrent_pages: self.max_concurrent_pages,
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay,
            backoff_multiplier: self.backoff_multiplier,
            page_timeout: self.page_timeout,
            check_local: self.check_local,
        }
    }

    /// A fetcher over `source` sharing this configuration's cancellation token.
    pub fn fetcher(&self, source: Arc<dyn PageSource>) -> PageFetcher {
        PageFetcher::new(source, self.fetch_policy()).with_cancellation(self.cancellation.clone())
    }

    pub fn manga_dir(&self) -> PathBuf {
        manga_dir(&self.output_dir, &self.metadata.title)
    }

    pub fn volume_path(&self, volume: &str) -> PathBuf {
        volume_dir(&self.manga_dir(), volume)
    }

    /// Path of the bound file for `volume`.
    pub fn output_path(&self, volume: &str) -> PathBuf {
        let extension = if self.device_variant { KEPUB_EXTENSION } else { "epub" };
        self.manga_dir().join(format!(
            "{}.{}",
            volume_file_stem(&self.metadata.title, volume),
            extension
        ))
    }

    /// Cover image for `volume` given its chapters.
    ///
    /// For a first-page cover the page is removed from its chapter.
    fn select_cover(&self, volume: &str, chapters: &mut [VolumeChapter]) -> Option<PathBuf> {
        let first_page = |chapters: &mut [VolumeChapter]| {
            chapters
                .iter_mut()
                .find(|c| !c.pages.is_empty())
                .map(|c| c.pages.remove(0))
        };
        match &self.cover_options {
            CoverOptions::None => None,
            CoverOptions::Single(path) => Some(path.clone()),
            CoverOptions::PerVolume(map) => match map.get(volume) {
                Some(path) => Some(path.clone()),
                None => first_page(chapters),
            },
            CoverOptions::FirstPage => first_page(chapters),
        }
    }

    /// Fetches every page of `request` into its volume directory.
    pub async fn download_volume(
        &self,
        source: Arc<dyn PageSource>,
        request: &VolumeRequest,
    ) -> Result<VolumeDownloadReport> {
        self.preflight_check()?;
        let (report, _) = self
            .fetcher(source)
            .fetch_volume(request, &self.volume_path(&request.volume), self.force_redownload)
            .await?;
        Ok(report)
    }

    /// Binds the valid pages recorded in `manifest` into the volume's file.
    pub async fn assemble_volume(&self, manifest: &VolumeManifest) -> Result<PathBuf> {
        let chapters = VolumeChapter::from_manifest(manifest);
        self.assemble_chapters(&manifest.volume_number, chapters).await
    }

    /// Binds `chapters` into the file for `volume`, then applies the device
    /// profile when the Kobo variant is enabled.
    ///
    /// # Returns
    ///
    /// * `Ok(PathBuf)` - Path of the bound file
    /// * `Err(Error::Assembly)` - No chapter had a usable page, or the written
    ///   file does not pass [`verify_container`]
    pub async fn assemble_chapters(&self, volume: &str, mut chapters: Vec<VolumeChapter>) -> Result<PathBuf> {
        self.preflight_check()?;
        let cover = self.select_cover(volume, &mut chapters);
        let destination = self.output_path(volume);
        let kept_existing = destination.exists() && !self.allow_overwrite;

        let title = volume_title(&self.metadata.title, volume);
        let identifier = self
            .metadata
            .identifier
            .as_ref()
            .map(|id| format!("{}:volume:{}", id, volume.trim()));
        let metadata = self.metadata.clone();
        let direction = self.reading_direction;
        let allow_overwrite = self.allow_overwrite;
        let target = destination.clone();

        let written = spawn_blocking(move || {
            let mut package = Package::from_metadata(&metadata, &title, identifier.as_deref())
                .with_direction(direction);
            if let Some(cover) = &cover {
                package = match package.clone().set_cover(cover) {
                    Ok(with_cover) => with_cover,
                    Err(e) => {
                        warn!("Cover {:?} could not be used: {}", cover, e);
                        package
                    }
                };
            }
            for chapter in &chapters {
                package = package.add_chapter(&chapter.id, &chapter.title, &chapter.pages)?;
            }
            emit_blocking(&package.finalize()?, &target, allow_overwrite)
        })
        .await
        .map_err(|e| Error::AsyncTaskError(e.to_string()))??;

        let written = if self.device_variant && !kept_existing {
            apply_device_profile(&written, self.reading_direction).await
        } else {
            written
        };

        let checked = written.clone();
        let report = spawn_blocking(move || verify_container(&checked))
            .await
            .map_err(|e| Error::AsyncTaskError(e.to_string()))??;
        if !report.is_valid() {
            return Err(Error::Assembly(format!(
                "{:?} failed verification: {:?}",
                written, report
            )));
        }
        Ok(written)
    }

    /// Downloads and binds one volume.
    ///
    /// Never fails: problems are reported through [`VolumeOutcome`].
    pub async fn process_volume(&self, source: Arc<dyn PageSource>, request: VolumeRequest) -> VolumeOutcome {
        let assemblies = Semaphore::new(self.max_concurrent_assemblies.max(1));
        self.process_with(&self.fetcher(source), &request, &assemblies).await.0
    }

    async fn process_with(
        &self,
        fetcher: &PageFetcher,
        request: &VolumeRequest,
        assemblies: &Semaphore,
    ) -> (VolumeOutcome, FetchStats) {
        if let Err(e) = self.preflight_check() {
            return (VolumeOutcome::Failed { reason: e.to_string() }, FetchStats::default());
        }
        if request.chapters.is_empty() {
            return (
                VolumeOutcome::Failed {
                    reason: format!("volume {} has no chapters", request.volume),
                },
                FetchStats::default(),
            );
        }

        let volume_path = self.volume_path(&request.volume);
        let (report, handle) = match fetcher
            .fetch_volume(request, &volume_path, self.force_redownload)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                error!("Volume {} could not be fetched: {}", request.volume, e);
                return (VolumeOutcome::Failed { reason: e.to_string() }, FetchStats::default());
            }
        };

        let complete = report.is_complete();
        let successful_pages: usize = report.chapters.iter().map(|c| c.successful).sum();
        let total_pages: usize = report.chapters.iter().map(|c| c.total).sum();
        let incomplete = |output: Option<PathBuf>| VolumeOutcome::Incomplete {
            successful_chapters: report.successful_chapters(),
            total_chapters: report.chapters.len(),
            successful_pages,
            total_pages,
            output,
        };

        if !complete && (!self.accept_incomplete || self.cancellation.is_cancelled()) {
            warn!(
                "Volume {} is incomplete ({}/{} pages), not binding it",
                request.volume, successful_pages, total_pages
            );
            mark_status(&handle, CompletionStatus::Incomplete).await;
            return (incomplete(None), report.stats);
        }

        let requested: HashSet<&str> = request.chapters.iter().map(|c| c.id.as_str()).collect();
        let chapters: Vec<VolumeChapter> = VolumeChapter::from_manifest(&handle.snapshot().await)
            .into_iter()
            .filter(|c| requested.contains(c.id.as_str()))
            .collect();

        let assembled = match assemblies.acquire().await {
            Ok(_permit) => self.assemble_chapters(&request.volume, chapters).await,
            Err(e) => Err(Error::from(e)),
        };
        match assembled {
            Ok(output) if complete => {
                mark_status(&handle, CompletionStatus::Complete).await;
                info!("Volume {} bound to {:?}", request.volume, output);
                (VolumeOutcome::Complete { output }, report.stats)
            }
            Ok(output) => {
                mark_status(&handle, CompletionStatus::Incomplete).await;
                info!("Incomplete volume {} bound to {:?}", request.volume, output);
                (incomplete(Some(output)), report.stats)
            }
            Err(e) => {
                error!("Volume {} could not be bound: {}", request.volume, e);
                mark_status(&handle, CompletionStatus::Incomplete).await;
                (VolumeOutcome::Failed { reason: e.to_string() }, report.stats)
            }
        }
    }

    /// Processes `requests` with at most `max_concurrent_volumes` in flight
    /// and at most `max_concurrent_assemblies` bindings at a time.
    pub async fn process_volumes(&self, source: Arc<dyn PageSource>, requests: Vec<VolumeRequest>) -> BatchReport {
        let started_at = Utc::now();
        let config = Arc::new(self.clone());
        let fetcher = self.fetcher(source);
        let volumes = Arc::new(Semaphore::new(self.max_concurrent_volumes.max(1)));
        let assemblies = Arc::new(Semaphore::new(self.max_concurrent_assemblies.max(1)));

        let mut labels = Vec::with_capacity(requests.len());
        let mut tasks = Vec::with_capacity(requests.len());
        for request in requests {
            labels.push(request.volume.clone());
            let config = Arc::clone(&config);
            let fetcher = fetcher.clone();
            let volumes = Arc::clone(&volumes);
            let assemblies = Arc::clone(&assemblies);
            tasks.push(tokio::spawn(async move {
                let _permit = volumes.acquire_owned().await?;
                Result::Ok(config.process_with(&fetcher, &request, &assemblies).await)
            }));
        }

        let mut report = BatchReport {
            started_at,
            completed_at: started_at,
            outcomes: Vec::with_capacity(labels.len()),
            stats: FetchStats::default(),
        };
        for (label, joined) in labels.into_iter().zip(join_all(tasks).await) {
            let outcome = match joined.map_err(Error::from).and_then(|r| r) {
                Ok((outcome, stats)) => {
                    report.stats += stats;
                    outcome
                }
                Err(e) => VolumeOutcome::Failed { reason: e.to_string() },
            };
            report.outcomes.push((label, outcome));
        }
        report.completed_at = Utc::now();

        info!(
            "Processed {} volumes: {} complete, {} not complete",
            report.outcomes.len(),
            report.successful(),
            report.failed()
        );
        report
    }
}

async fn mark_status(handle: &ManifestHandle, status: CompletionStatus) {
    handle.update(|m| m.with_status(status)).await
}

impl SeihonConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        let bounds = [
            ("max_concurrent_volumes", self.max_concurrent_volumes),
            ("max_concurrent_chapters", self.max_concurrent_chapters),
            ("max_concurrent_pages", self.max_concurrent_pages),
            ("max_concurrent_assemblies", self.max_concurrent_assemblies),
        ];
        for (name, value) in bounds {
            if value == Some(0) {
                return Err(format!("{} must be at least 1.", name));
            }
        }
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1.".to_string());
        }
        if let Some(multiplier) = self.backoff_multiplier {
            if multiplier.is_nan() || multiplier < 1.0 {
                return Err("backoff_multiplier must be at least 1.0.".to_string());
            }
        }
        match &self.output_dir {
            Some(dir) if !dir.as_os_str().is_empty() => {}
            _ => return Err("output_dir is required.".to_string()),
        }
        if let Some(metadata) = &self.metadata {
            if metadata.title.trim().is_empty() {
                return Err("Manga title is required.".to_string());
            }
        }
        Ok(())
    }
}
