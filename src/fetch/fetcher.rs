use futures::future::join_all;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::spawn_blocking;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fetch::{FetchPolicy, PageSource, is_valid_image};
use crate::manifest::{ChapterUpdate, ManifestHandle, PageUpdate, VolumeManifest};
use crate::path_utils::{chapter_dir_name, page_file_name, path_to_string_lossy, temp_path_for};
use crate::types::{
    ChapterFetchOutcome, CompletionStatus, FetchStats, PageSpec, PageStatus, VolumeDownloadReport,
    VolumeRequest,
};

/// Downloads page images with bounded concurrency, retries and resume support.
///
/// Cloning is cheap: the source, the manifest handle and the cancellation
/// token are shared.
#[derive(Clone)]
pub struct PageFetcher {
    source: Arc<dyn PageSource>,
    policy: FetchPolicy,
    manifest: Option<ManifestHandle>,
    cancel: CancellationToken,
}

/// How a single page ended.
struct PageResult {
    page_number: u32,
    url: String,
    outcome: Result<PathBuf>,
    retries: usize,
}

impl PageFetcher {
    pub fn new(source: Arc<dyn PageSource>, policy: FetchPolicy) -> Self {
        Self {
            source,
            policy,
            manifest: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Records every page and chapter outcome in `manifest`.
    pub fn with_manifest(mut self, manifest: ManifestHandle) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Shares a cancellation token with the caller.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Fetches every page of one chapter into `target_dir`.
    ///
    /// Pages whose file (or the file recorded for them in `resume`) already
    /// decodes as an image are skipped unless `force_redownload` is set. The
    /// remaining pages are fetched concurrently; a page that still fails after
    /// the last attempt is counted as failed without aborting the chapter.
    ///
    /// # Returns
    ///
    /// * `Ok(ChapterFetchOutcome)` - Counts of successful and total pages plus stats
    /// * `Err(Error)` - The target directory could not be created
    pub async fn fetch_chapter(
        &self,
        chapter_id: &str,
        pages: &[PageSpec],
        target_dir: &Path,
        resume: Option<&VolumeManifest>,
        force_redownload: bool,
    ) -> Result<ChapterFetchOutcome> {
        tokio::fs::create_dir_all(target_dir).await?;

        let planned: Vec<(PageSpec, PathBuf, Option<PathBuf>)> = pages
            .iter()
            .map(|spec| {
                let target = target_dir.join(page_file_name(spec.page_number, &spec.url));
                let recorded = resume
                    .and_then(|m| m.page_record(chapter_id, spec.page_number))
                    .filter(|p| p.status == PageStatus::Valid)
                    .map(|p| p.file_path.clone());
                (spec.clone(), target, recorded)
            })
            .collect();

        let check_local = self.policy.check_local && !force_redownload;
        let checked: Vec<(PageSpec, PathBuf, Option<PathBuf>)> = spawn_blocking(move || {
            planned
                .into_par_iter()
                .map(|(spec, target, recorded)| {
                    let existing = if !check_local {
                        None
                    } else if is_valid_image(&target) {
                        Some(target.clone())
                    } else {
                        recorded.filter(|p| is_valid_image(p))
                    };
                    (spec, target, existing)
                })
                .collect()
        })
        .await
        .map_err(|e| Error::AsyncTaskError(e.to_string()))?;

        let mut stats = FetchStats::default();
        let mut files: Vec<(u32, PathBuf)> = Vec::new();
        let semaphore = Arc::new(Semaphore::new(self.policy.max_concurrent_pages));
        let mut tasks = Vec::new();

        for (spec, target, existing) in checked {
            if let Some(existing) = existing {
                debug!(
                    "Skipping page {} of chapter {}: {} is valid",
                    spec.page_number,
                    chapter_id,
                    path_to_string_lossy(&existing)
                );
                stats.skipped += 1;
                self.record_page(
                    chapter_id,
                    PageUpdate {
                        page_number: spec.page_number,
                        file_path: Some(existing.clone()),
                        url: Some(spec.url.clone()),
                        status: Some(PageStatus::Valid),
                        skipped: Some(true),
                    },
                )
                .await;
                files.push((spec.page_number, existing));
                continue;
            }

            let fetcher = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let chapter_id = chapter_id.to_string();
            tasks.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    _ = fetcher.cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let result = match permit {
                    Some(_permit) => fetcher.fetch_page(&spec, &target).await,
                    None => PageResult {
                        page_number: spec.page_number,
                        url: spec.url.clone(),
                        outcome: Err(Error::Cancelled),
                        retries: 0,
                    },
                };
                fetcher.record_result(&chapter_id, &target, &result).await;
                result
            }));
        }

        for joined in join_all(tasks).await {
            match joined {
                Ok(result) => {
                    stats.retries += result.retries;
                    match result.outcome {
                        Ok(path) => {
                            stats.downloaded += 1;
                            files.push((result.page_number, path));
                        }
                        Err(e) => {
                            stats.failed += 1;
                            error!(
                                "Page {} of chapter {} failed ({}): {}",
                                result.page_number, chapter_id, result.url, e
                            );
                        }
                    }
                }
                Err(e) => {
                    stats.failed += 1;
                    error!("Page task of chapter {} panicked: {}", chapter_id, e);
                }
            }
        }

        files.sort_by_key(|(n, _)| *n);
        let outcome = ChapterFetchOutcome {
            chapter_id: chapter_id.to_string(),
            successful: stats.downloaded + stats.skipped,
            total: pages.len(),
            stats,
            files: files.into_iter().map(|(_, p)| p).collect(),
        };

        if let Some(manifest) = &self.manifest {
            manifest
                .record_chapter(ChapterUpdate {
                    id: chapter_id.to_string(),
                    status: Some(if outcome.is_complete() {
                        CompletionStatus::Complete
                    } else {
                        CompletionStatus::Incomplete
                    }),
                    total_pages: Some(outcome.total),
                    successful_pages: Some(outcome.successful),
                    ..Default::default()
                })
                .await;
        }

        info!(
            "Chapter {}: {}/{} pages ({} downloaded, {} skipped, {} failed, {} retries)",
            chapter_id,
            outcome.successful,
            outcome.total,
            stats.downloaded,
            stats.skipped,
            stats.failed,
            stats.retries
        );
        Ok(outcome)
    }

    /// Fetches every chapter of a volume into `volume_path`, chapters in
    /// numeric order and at most `max_concurrent_chapters` at a time.
    ///
    /// The manifest at `volume_path` is loaded to resume a previous run unless
    /// `force_redownload` is set, in which case a fresh one replaces it.
    /// Returns the report together with the handle that owns the manifest.
    pub async fn fetch_volume(
        &self,
        request: &VolumeRequest,
        volume_path: &Path,
        force_redownload: bool,
    ) -> Result<(VolumeDownloadReport, ManifestHandle)> {
        tokio::fs::create_dir_all(volume_path).await?;

        let resume = if force_redownload {
            None
        } else {
            VolumeManifest::load(volume_path).await
        };
        let manifest = resume.clone().unwrap_or_else(|| {
            VolumeManifest::new(&request.manga_id, &request.manga_title, &request.volume)
        });
        let handle = ManifestHandle::new(volume_path, manifest);
        let resume = Arc::new(resume);
        let fetcher = self.clone().with_manifest(handle.clone());
        let semaphore = Arc::new(Semaphore::new(self.policy.max_concurrent_chapters));

        info!(
            "Fetching volume {} of '{}' ({} chapters)",
            request.volume,
            request.manga_title,
            request.chapters.len()
        );

        let chapters = request.sorted_chapters();
        let mut tasks = Vec::with_capacity(chapters.len());
        for chapter in chapters {
            let directory = volume_path.join(chapter_dir_name(&chapter.number, chapter.title.as_deref()));
            handle
                .record_chapter(ChapterUpdate {
                    id: chapter.id.clone(),
                    number: Some(chapter.number.clone()),
                    title: chapter.title.clone(),
                    directory: Some(directory.clone()),
                    total_pages: Some(chapter.pages.len()),
                    ..Default::default()
                })
                .await;

            let fetcher = fetcher.clone();
            let semaphore = Arc::clone(&semaphore);
            let resume = Arc::clone(&resume);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                let total = chapter.pages.len();
                let outcome = match fetcher
                    .fetch_chapter(
                        &chapter.id,
                        &chapter.pages,
                        &directory,
                        (*resume).as_ref(),
                        force_redownload,
                    )
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Chapter {} failed: {}", chapter.id, e);
                        ChapterFetchOutcome {
                            chapter_id: chapter.id.clone(),
                            successful: 0,
                            total,
                            stats: FetchStats {
                                failed: total,
                                ..Default::default()
                            },
                            files: Vec::new(),
                        }
                    }
                };
                Result::Ok(outcome)
            }));
        }

        let mut report = VolumeDownloadReport {
            volume: request.volume.clone(),
            volume_path: volume_path.to_path_buf(),
            ..Default::default()
        };
        for task in tasks {
            let outcome = task.await??;
            report.stats += outcome.stats;
            report.chapters.push(outcome);
        }

        let (complete, known) = handle.snapshot().await.chapter_summary();
        info!(
            "Volume {} of '{}': {}/{} chapters complete",
            request.volume, request.manga_title, complete, known
        );
        Ok((report, handle))
    }

    /// Fetches several volumes, at most `max_concurrent_volumes` at a time.
    ///
    /// Each volume lands in `volume_path_for(request)`. Results keep the input order.
    pub async fn fetch_volumes<F>(
        &self,
        requests: Vec<VolumeRequest>,
        volume_path_for: F,
        force_redownload: bool,
    ) -> Vec<Result<VolumeDownloadReport>>
    where
        F: Fn(&VolumeRequest) -> PathBuf,
    {
        let semaphore = Arc::new(Semaphore::new(self.policy.max_concurrent_volumes));
        let mut tasks = Vec::with_capacity(requests.len());
        for request in requests {
            let fetcher = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let volume_path = volume_path_for(&request);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await?;
                fetcher
                    .fetch_volume(&request, &volume_path, force_redownload)
                    .await
                    .map(|(report, _)| report)
            }));
        }

        join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.map_err(Error::from).and_then(|r| r))
            .collect()
    }

    /// Runs the attempt loop of a single page.
    async fn fetch_page(&self, spec: &PageSpec, target: &Path) -> PageResult {
        let tmp = temp_path_for(target);
        let mut attempt: u32 = 1;

        let outcome = loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(Error::Cancelled),
                r = timeout(self.policy.page_timeout, self.attempt_page(&spec.url, &tmp, target)) => {
                    r.unwrap_or_else(|_| Err(Error::Fetch {
                        url: spec.url.clone(),
                        reason: format!("timed out after {:?}", self.policy.page_timeout),
                    }))
                }
            };

            match result {
                Ok(()) => break Ok(target.to_path_buf()),
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    if matches!(e, Error::Cancelled)
                        || !e.is_retryable()
                        || attempt >= self.policy.max_attempts
                    {
                        break Err(e);
                    }
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        "Attempt {}/{} for page {} failed: {}. Retrying in {:?}",
                        attempt, self.policy.max_attempts, spec.page_number, e, delay
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break Err(Error::Cancelled),
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        };

        PageResult {
            page_number: spec.page_number,
            url: spec.url.clone(),
            outcome,
            retries: (attempt - 1) as usize,
        }
    }

    /// One attempt: fetch, write to the temporary file, validate, rename.
    async fn attempt_page(&self, url: &str, tmp: &Path, target: &Path) -> Result<()> {
        let bytes = self.source.fetch(url).await?;
        if bytes.is_empty() {
            return Err(Error::Fetch {
                url: url.to_string(),
                reason: "empty response body".to_string(),
            });
        }
        tokio::fs::write(tmp, &bytes).await?;

        let tmp_owned = tmp.to_path_buf();
        let valid = spawn_blocking(move || is_valid_image(&tmp_owned))
            .await
            .map_err(|e| Error::AsyncTaskError(e.to_string()))?;
        if !valid {
            return Err(Error::Validation(tmp.to_path_buf()));
        }

        tokio::fs::rename(tmp, target).await?;
        Ok(())
    }

    async fn record_result(&self, chapter_id: &str, target: &Path, result: &PageResult) {
        let status = if result.outcome.is_ok() {
            PageStatus::Valid
        } else {
            PageStatus::Invalid
        };
        self.record_page(
            chapter_id,
            PageUpdate {
                page_number: result.page_number,
                file_path: Some(target.to_path_buf()),
                url: Some(result.url.clone()),
                status: Some(status),
                skipped: Some(false),
            },
        )
        .await;
    }

    async fn record_page(&self, chapter_id: &str, update: PageUpdate) {
        if let Some(manifest) = &self.manifest {
            manifest.record_page(chapter_id, update).await;
        }
    }
}
