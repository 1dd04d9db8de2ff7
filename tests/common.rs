//! Common test utilities and constants for the Seihon crate.
//!
//! Provides functions for setting up test directories, creating dummy image
//! files, a scripted in-memory page source, and helpers to inspect written
//! containers.

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use rand::{Rng, distributions::Alphanumeric};
use seihon::error::{Error, Result};
use seihon::fetch::PageSource;
use seihon::types::{ChapterRequest, PageSpec, VolumeRequest};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::fs;

#[allow(dead_code)]
pub const TEST_TMP_DIR: &str = "tests/tmp";
#[allow(dead_code)]
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);
#[allow(dead_code)]
pub const LONG_TEST_TIMEOUT: Duration = Duration::from_secs(120); // For full pipelines if they are slow

/// Helper function to create a clean test directory with source and output subdirectories.
/// Returns the base test path, the source path, and the output path.
#[allow(dead_code)]
pub async fn setup_test_dirs(sub_path: &str) -> (PathBuf, PathBuf, PathBuf) {
    let rand_string: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let unique_sub_path = format!("{}-{}", sub_path, rand_string);
    let test_dir = PathBuf::from(TEST_TMP_DIR).join(unique_sub_path);
    if test_dir.exists() {
        fs::remove_dir_all(&test_dir).await.unwrap();
    }
    let source_dir = test_dir.join("source");
    let output_dir = test_dir.join("output");

    fs::create_dir_all(&source_dir).await.unwrap();
    fs::create_dir_all(&output_dir).await.unwrap();

    (test_dir, source_dir, output_dir)
}

/// Creates a minimal dummy JPEG image at the given path.
#[allow(dead_code)]
pub async fn create_dummy_image(path: &Path, color: Rgb<u8>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let img = RgbImage::from_pixel(100, 140, color);
    let path_clone = path.to_path_buf();
    tokio::task::spawn_blocking(move || img.save_with_format(path_clone, ImageFormat::Jpeg))
        .await
        .map_err(|e| Error::AsyncTaskError(e.to_string()))?
        .map_err(Error::Image)?;
    Ok(())
}

/// Creates `count` dummy pages named `001.jpg`, `002.jpg`, ... in `dir`.
#[allow(dead_code)]
pub async fn create_dummy_pages(dir: &Path, count: usize) -> Result<Vec<PathBuf>> {
    let mut pages = Vec::with_capacity(count);
    for i in 1..=count {
        let path = dir.join(format!("{:03}.jpg", i));
        create_dummy_image(&path, Rgb([(i * 10 % 255) as u8, 40, 90])).await?;
        pages.push(path);
    }
    Ok(pages)
}

/// Encodes a small solid image in memory.
#[allow(dead_code)]
pub fn encoded_image(format: ImageFormat) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 24, Rgb([200, 30, 30])));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), format)
        .expect("encoding an in-memory image");
    bytes
}

/// What the mock source answers for a URL.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Always answers with these bytes.
    Serve(Vec<u8>),
    /// Fails the first `n` calls, then serves the bytes.
    FailTimes(usize, Vec<u8>),
    /// Never succeeds.
    AlwaysFail,
    /// Never answers.
    Hang,
}

/// Scripted in-memory [`PageSource`] that counts its calls.
///
/// URLs without a scripted behavior are served a PNG.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct MockPageSource {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls_per_url: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl MockPageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(self, url: &str, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(url.to_string(), behavior);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls_per_url
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
        self.calls_per_url.lock().unwrap().clear();
    }
}

#[async_trait]
impl PageSource for MockPageSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let call = {
            let mut per_url = self.calls_per_url.lock().unwrap();
            let count = per_url.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let behavior = self.behaviors.lock().unwrap().get(url).cloned();
        match behavior {
            None => Ok(encoded_image(ImageFormat::Png)),
            Some(Behavior::Serve(bytes)) => Ok(bytes),
            Some(Behavior::FailTimes(n, bytes)) if call > n => Ok(bytes),
            Some(Behavior::FailTimes(..)) | Some(Behavior::AlwaysFail) => Err(Error::Fetch {
                url: url.to_string(),
                reason: format!("scripted failure on call {}", call),
            }),
            Some(Behavior::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(Error::Fetch {
                    url: url.to_string(),
                    reason: "hung".to_string(),
                })
            }
        }
    }
}

/// A chapter whose pages live at `https://pages.test/<id>/<n>.png`.
#[allow(dead_code)]
pub fn chapter_request(id: &str, number: &str, pages: usize) -> ChapterRequest {
    ChapterRequest {
        id: id.to_string(),
        number: number.to_string(),
        title: None,
        pages: PageSpec::from_urls((1..=pages).map(|p| page_url(id, p))),
    }
}

#[allow(dead_code)]
pub fn page_url(chapter_id: &str, page: usize) -> String {
    format!("https://pages.test/{}/{}.png", chapter_id, page)
}

#[allow(dead_code)]
pub fn volume_request(volume: &str, chapters: Vec<ChapterRequest>) -> VolumeRequest {
    VolumeRequest {
        manga_id: "manga-1".to_string(),
        manga_title: "Test Manga".to_string(),
        volume: volume.to_string(),
        chapters,
    }
}

/// Entry names of a ZIP container in archive order.
#[allow(dead_code)]
pub fn zip_entry_names(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index_raw(i).unwrap().name().to_string())
        .collect()
}

/// Reads one entry of a ZIP container as text.
#[allow(dead_code)]
pub fn read_zip_entry(path: &Path, name: &str) -> String {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut content = String::new();
    entry.read_to_string(&mut content).unwrap();
    content
}

/// Lists files below `dir` whose name ends with `suffix`.
#[allow(dead_code)]
pub fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.to_string_lossy().ends_with(suffix) {
                found.push(path);
            }
        }
    }
    found
}
