//! Path utilities for the on-disk layout of downloaded volumes.
//!
//! The layout is `<output>/<manga title>/volume_<label>/chapter_<NNNN>[_<title>]/<NNN>.<ext>`,
//! with a `manifest.json` beside the chapter directories. Every component that
//! comes from remote metadata goes through [`sanitize_filename`] first.

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

lazy_static! {
    static ref INVALID_FILENAME_CHARS: Regex =
        Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("invalid filename pattern");
}

/// Longest chapter title kept in a chapter directory name, in characters.
const MAX_TITLE_IN_DIR: usize = 50;

/// File name of the per-volume manifest.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Converts a path to a string with fallback to lossy conversion.
pub fn path_to_string_lossy(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Gets the file name from a path with fallback to lossy conversion.
pub fn get_file_name_lossy(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Checks that a destination path can be written as a single file.
///
/// # Arguments
///
/// * `path` - The path to validate
///
/// # Returns
///
/// * `Result<()>` - Ok if the path is usable, or an error describing the issue
pub fn validate_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidPath(
            path.to_path_buf(),
            "Path is empty".to_string(),
        ));
    }
    if path.file_name().is_none() {
        return Err(Error::InvalidPath(
            path.to_path_buf(),
            "Path has no file name".to_string(),
        ));
    }
    if path.is_dir() {
        return Err(Error::InvalidPath(
            path.to_path_buf(),
            "Path points to a directory".to_string(),
        ));
    }
    Ok(())
}

/// Hidden sibling a file is written to before it replaces `destination`.
pub fn part_path(destination: &Path) -> PathBuf {
    destination.with_file_name(format!(".{}.part", get_file_name_lossy(destination)))
}

/// Writes `part` through `write`, then renames it over `destination`.
///
/// `part` is removed when either step fails, so a failed write never leaves
/// a stray sibling behind.
pub fn write_via_part<F>(part: &Path, destination: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let result = write(part).and_then(|()| std::fs::rename(part, destination).map_err(Error::from));
    if result.is_err() && part.exists() {
        if let Err(cleanup) = std::fs::remove_file(part) {
            warn!("Could not remove partial file {:?}: {}", part, cleanup);
        }
    }
    result
}

/// Sanitizes a filename by replacing invalid characters with underscores.
///
/// Leading and trailing dots and spaces are stripped. An input that sanitizes
/// to nothing becomes `"unnamed"`.
pub fn sanitize_filename(filename: &str) -> String {
    let replaced = INVALID_FILENAME_CHARS.replace_all(filename, "_");
    let trimmed = replaced.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Directory holding every volume of one manga.
pub fn manga_dir(output_dir: &Path, manga_title: &str) -> PathBuf {
    output_dir.join(sanitize_filename(manga_title))
}

/// Directory of one volume inside the manga directory.
pub fn volume_dir(manga_dir: &Path, volume: &str) -> PathBuf {
    manga_dir.join(format!("volume_{}", sanitize_filename(volume)))
}

/// Chapter directory name: `chapter_<4-digit number>[_<sanitized title>]`.
///
/// Fractional numbers keep their fraction (`10.5` becomes `chapter_0010.5`).
/// Non-numeric labels are sanitized and used as-is.
pub fn chapter_dir_name(number: &str, title: Option<&str>) -> String {
    let number = number.trim();
    let padded = match number.split_once('.') {
        Some((whole, fraction)) if whole.parse::<u32>().is_ok() && fraction.parse::<u32>().is_ok() => {
            format!("{:04}.{}", whole.parse::<u32>().unwrap_or_default(), fraction)
        }
        _ => match number.parse::<u32>() {
            Ok(n) => format!("{:04}", n),
            Err(_) => sanitize_filename(number),
        },
    };

    let title = title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| sanitize_filename(&t.chars().take(MAX_TITLE_IN_DIR).collect::<String>()));

    match title {
        Some(t) => format!("chapter_{}_{}", padded, t.replace(' ', "_")),
        None => format!("chapter_{}", padded),
    }
}

/// Normalized image extension for a page URL.
///
/// The query string and fragment are ignored, the extension is lower-cased and
/// `jpeg` becomes `jpg`. Anything that is not jpg/png/gif/webp falls back to `jpg`.
pub fn extension_from_url(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last_segment = path.rsplit('/').next().unwrap_or(path);
    let ext = last_segment
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());

    match ext.as_deref() {
        Some("png") => "png",
        Some("gif") => "gif",
        Some("webp") => "webp",
        _ => "jpg",
    }
}

/// Page file name: `<3-digit page number>.<ext>`.
pub fn page_file_name(page_number: u32, url: &str) -> String {
    format!("{:03}.{}", page_number, extension_from_url(url))
}

/// Sibling path used while a file is being written.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Base file name (without extension) of a bound volume.
///
/// Volume "0" collects chapters without a volume and is named after that.
pub fn volume_file_stem(manga_title: &str, volume: &str) -> String {
    if volume.trim() == "0" {
        sanitize_filename(&format!("{}_ungrouped_chapters", manga_title))
    } else {
        sanitize_filename(&format!("{} - Volume {}", manga_title, volume.trim()))
    }
}
