//! Seihon - Manga Volume Downloading and Binding Library
//!
//! This crate fetches the page images of manga chapters into a resumable
//! on-disk layout and binds them, volume by volume, into EPUB 3 containers,
//! optionally rewritten for Kobo e-readers (`.kepub.epub`).
//!
//! # Getting Started
//!
//! Describe the series with [`MangaMetadata`], configure [`SeihonConfig`] via
//! its builder, and hand it the volumes to process together with a
//! [`PageSource`](fetch::PageSource) that knows how to fetch page bytes.
//!
//! ```rust,no_run
//! use seihon::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> seihon::error::Result<()> {
//!     // 1. Describe the series
//!     let metadata = MangaMetadata {
//!         title: "My Awesome Manga".to_string(),
//!         authors: vec!["Jane Doe".to_string()],
//!         ..MangaMetadata::default_with_title("My Awesome Manga".to_string())
//!     };
//!
//!     // 2. Configure the pipeline
//!     let config = SeihonConfig::builder()
//!         .metadata(metadata)
//!         .output_dir(PathBuf::from("./library"))
//!         .reading_direction(Direction::Rtl)
//!         .device_variant(true)
//!         .build()?;
//!     config.preflight_check()?;
//!
//!     // 3. Describe a volume and process it
//!     let request = VolumeRequest {
//!         manga_id: "series-1".to_string(),
//!         manga_title: "My Awesome Manga".to_string(),
//!         volume: "1".to_string(),
//!         chapters: vec![ChapterRequest {
//!             id: "chapter-1".to_string(),
//!             number: "1".to_string(),
//!             title: Some("The Beginning".to_string()),
//!             pages: PageSpec::from_urls(["https://example.org/1.jpg", "https://example.org/2.jpg"]),
//!         }],
//!     };
//!     let source = Arc::new(HttpPageSource::new()?);
//!     match config.process_volume(source, request).await {
//!         VolumeOutcome::Complete { output } => println!("Bound {:?}", output),
//!         other => println!("Volume not complete: {:?}", other),
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! The lower layers can be used on their own: [`fetch::PageFetcher`] for
//! downloading, [`package::Package`] and [`emitter::emit`] for binding, and
//! [`transform`] for rewriting existing containers.

pub mod emitter;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod package;
pub mod path_utils;
pub mod seihon;
pub mod transform;
pub mod types;
mod xml_utils;

// Publicly expose the main `SeihonConfig` struct and its builder
pub use seihon::{SeihonConfig, SeihonConfigBuilder};

pub use types::{
    BatchReport, ChapterRequest, CompletionStatus, CoverOptions, Direction, FetchStats,
    MangaMetadata, PageSpec, VolumeDownloadReport, VolumeOutcome, VolumeRequest,
};

/// Prelude module for convenient imports.
///
/// Re-exports the most commonly used types and traits so that
/// `use seihon::prelude::*;` is enough for typical pipelines.
pub mod prelude {
    pub use super::{
        BatchReport, ChapterRequest, CompletionStatus, CoverOptions, Direction, FetchStats,
        MangaMetadata, PageSpec, SeihonConfig, SeihonConfigBuilder, VolumeDownloadReport,
        VolumeOutcome, VolumeRequest, error, types,
    };
    pub use crate::emitter::{emit, verify_container};
    pub use crate::fetch::{FetchPolicy, HttpPageSource, PageFetcher, PageSource};
    pub use crate::manifest::VolumeManifest;
    pub use crate::package::Package;
    pub use crate::seihon::VolumeChapter;
    pub use crate::transform::{ContainerTransform, KoboTransform, apply_device_profile};
    pub use std::path::{Path, PathBuf};
    pub use std::sync::Arc;
}
