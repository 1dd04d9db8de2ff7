//! Page fetching: sources, retry policy and the resumable page fetcher.
//!
//! A [`PageSource`] turns a URL into bytes. The [`fetcher::PageFetcher`] drives a
//! source under bounded concurrency, validates every page before it becomes
//! visible under its final name, and records each outcome in the volume manifest.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

pub mod fetcher;
pub mod http;

pub use fetcher::PageFetcher;
pub use http::HttpPageSource;

/// Anything that can return the raw bytes behind a page URL.
///
/// Implementations must be cheap to share across tasks; the fetcher holds them
/// behind an `Arc` and calls `fetch` concurrently.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetches the bytes at `url`. Errors are treated as transient and retried.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Concurrency, retry and timeout settings of the fetch layer.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub max_concurrent_volumes: usize,
    pub max_concurrent_chapters: usize,
    pub max_concurrent_pages: usize,
    /// Total attempts per page, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub page_timeout: Duration,
    /// Reuse valid files already on disk instead of fetching them again.
    pub check_local: bool,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_concurrent_volumes: 2,
            max_concurrent_chapters: 5,
            max_concurrent_pages: 5,
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            page_timeout: Duration::from_secs(30),
            check_local: true,
        }
    }
}

impl FetchPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        self.retry_delay
            .mul_f64(self.backoff_multiplier.max(1.0).powi(exponent))
    }
}

/// Whether the file at `path` decodes as an image.
///
/// This performs a full decode and blocks; call it from a blocking context.
pub fn is_valid_image(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    match image::ImageReader::open(path).and_then(|reader| reader.with_guessed_format()) {
        Ok(reader) => reader.decode().is_ok(),
        Err(_) => false,
    }
}
