//! Post-emission rewrites of a finished container for a device family.
//!
//! A container is unpacked into a scratch directory, every
//! [`ContainerTransform`] pass rewrites files there, and the result is packed
//! again with the OCF rules (`mimetype` first and stored) into a hidden sibling
//! that replaces the original. A failing pass never damages the original.

use log::{debug, error, info};
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio::task::spawn_blocking;
use zip::ZipArchive;

use crate::emitter::ocf::{MIMETYPE_ENTRY, OcfWriter};
use crate::error::{Error, Result};
use crate::path_utils::{get_file_name_lossy, part_path, validate_path, write_via_part};
use crate::types::Direction;

pub mod kobo;
pub mod markup;

pub use kobo::KoboTransform;
pub use markup::{split_sentences, transform_content_document, transform_nav_document};

/// Extension of Kobo containers, including the trailing `.epub`.
pub const KEPUB_EXTENSION: &str = "kepub.epub";

/// One rewrite pass over an unpacked container.
pub trait ContainerTransform: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Rewrites files below `root`, the directory the container was unpacked to.
    fn apply(&self, root: &Path) -> Result<()>;
}

/// Runs `passes` over the container at `container`, in place.
///
/// Errors are logged and the original path is returned with the container
/// left as it was.
pub fn apply_transforms(container: &Path, passes: &[&dyn ContainerTransform]) -> PathBuf {
    match try_apply_transforms(container, passes) {
        Ok(path) => path,
        Err(e) => {
            error!("Transforming {:?} failed, keeping the original: {}", container, e);
            container.to_path_buf()
        }
    }
}

/// Like [`apply_transforms`] but reports the error.
pub fn try_apply_transforms(container: &Path, passes: &[&dyn ContainerTransform]) -> Result<PathBuf> {
    validate_path(container)?;
    if !container.is_file() {
        return Err(Error::NotFound(format!("container {:?}", container)));
    }

    let scratch = tempfile::tempdir()?;
    let entries = unpack(container, scratch.path())?;
    for pass in passes {
        debug!("Applying '{}' to {:?}", pass.name(), container);
        pass.apply(scratch.path())?;
    }

    write_via_part(&part_path(container), container, |part| {
        repack(scratch.path(), &entries, part)
    })?;
    info!("Applied {} transform pass(es) to {:?}", passes.len(), container);
    Ok(container.to_path_buf())
}

/// Applies the Kobo profile to the container at `container` on the blocking pool.
pub async fn apply_device_profile(container: &Path, direction: Direction) -> PathBuf {
    let path = container.to_path_buf();
    let task = spawn_blocking(move || {
        let kobo = KoboTransform::new(direction);
        apply_transforms(&path, &[&kobo])
    });
    match task.await {
        Ok(path) => path,
        Err(e) => {
            error!("Device profile task for {:?} failed: {}", container, e);
            container.to_path_buf()
        }
    }
}

/// Copies an existing EPUB to `<stem>.kepub.epub` in `output_dir` (the EPUB's
/// own directory by default) and applies the Kobo profile to the copy.
///
/// The copy is removed again when the profile cannot be applied.
pub fn convert_to_kepub(epub_path: &Path, output_dir: Option<&Path>, direction: Direction) -> Result<PathBuf> {
    if !epub_path.is_file() {
        return Err(Error::NotFound(format!("EPUB file {:?}", epub_path)));
    }
    let output_dir = match output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            dir.to_path_buf()
        }
        None => epub_path.parent().map(Path::to_path_buf).unwrap_or_default(),
    };

    let file_name = get_file_name_lossy(epub_path);
    let lower = file_name.to_lowercase();
    let stem = if lower.ends_with(".kepub.epub") {
        &file_name[..file_name.len() - ".kepub.epub".len()]
    } else if lower.ends_with(".epub") {
        &file_name[..file_name.len() - ".epub".len()]
    } else {
        file_name.as_str()
    };
    let kepub_path = output_dir.join(format!("{}.{}", stem, KEPUB_EXTENSION));
    if kepub_path != epub_path {
        std::fs::copy(epub_path, &kepub_path)?;
    }

    let kobo = KoboTransform::new(direction);
    match try_apply_transforms(&kepub_path, &[&kobo]) {
        Ok(path) => {
            info!("Converted {:?} to {:?}", epub_path, path);
            Ok(path)
        }
        Err(e) => {
            if kepub_path != epub_path {
                let _ = std::fs::remove_file(&kepub_path);
            }
            Err(e)
        }
    }
}

/// Extracts `container` into `dir` and returns its file entry names in order.
fn unpack(container: &Path, dir: &Path) -> Result<Vec<String>> {
    let mut archive = ZipArchive::new(File::open(container)?)?;
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        if !entry.is_dir() {
            names.push(entry.name().to_string());
        }
    }
    archive.extract(dir)?;
    Ok(names)
}

fn repack(dir: &Path, entries: &[String], destination: &Path) -> Result<()> {
    let mut writer = OcfWriter::create(destination)?;
    for name in entries.iter().filter(|n| n.as_str() != MIMETYPE_ENTRY) {
        writer.add_file(name, &dir.join(name))?;
    }
    writer.finish()
}
