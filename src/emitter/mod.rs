//! Serialization of a [`Package`] into an OCF container (EPUB 3).
//!
//! Entry order is fixed: `mimetype` (stored), `META-INF/container.xml`,
//! `OEBPS/content.opf`, `OEBPS/toc.ncx`, `OEBPS/nav.xhtml`, then every other
//! item in package order. The container is written to a hidden `.part` sibling
//! and renamed into place, so the destination never holds a truncated file.

use chrono::Utc;
use log::info;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tokio::task::spawn_blocking;

use crate::error::{Error, Result};
use crate::package::documents::CONTAINER_XML;
use crate::package::{GeneratedDocument, ItemSource, Package};
use crate::path_utils::{part_path, validate_path, write_via_part};

mod documents;
pub(crate) mod normalize;
pub mod ocf;
pub mod verify;

pub use verify::{ContainerReport, verify_container};

pub(crate) use documents::GENERATOR;

use normalize::{NormalizedPackage, normalize};
use ocf::{CONTAINER_ENTRY, OcfWriter};

/// Directory of the package document inside the container.
pub const CONTENT_DIR: &str = "OEBPS";
pub const PACKAGE_DOCUMENT: &str = "OEBPS/content.opf";

/// Writes `package` to `destination` on the blocking pool.
///
/// See [`emit_blocking`].
pub async fn emit(package: &Package, destination: &Path, allow_overwrite: bool) -> Result<PathBuf> {
    let package = package.clone();
    let destination = destination.to_path_buf();
    spawn_blocking(move || emit_blocking(&package, &destination, allow_overwrite))
        .await
        .map_err(|e| Error::AsyncTaskError(e.to_string()))?
}

/// Writes `package` to `destination`.
///
/// An existing destination is returned untouched unless `allow_overwrite` is
/// set. A package that is not yet finalized is finalized on a copy first.
///
/// # Returns
///
/// * `Ok(PathBuf)` - Path of the container
/// * `Err(Error::Assembly)` - The package has no content to put in the spine
pub fn emit_blocking(package: &Package, destination: &Path, allow_overwrite: bool) -> Result<PathBuf> {
    validate_path(destination)?;
    if destination.exists() && !allow_overwrite {
        info!(
            "Container {:?} already exists and overwriting is disabled, keeping it",
            destination
        );
        return Ok(destination.to_path_buf());
    }

    let package = if package.is_finalized() {
        Cow::Borrowed(package)
    } else {
        Cow::Owned(package.clone().finalize()?)
    };
    let normalized = normalize(&package)?;
    if normalized.content_count() == 0 {
        return Err(Error::Assembly(format!(
            "'{}' has no content documents in its spine",
            package.metadata().title
        )));
    }

    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    write_via_part(&part_path(destination), destination, |part| {
        write_container(&package, &normalized, part)
    })?;
    info!(
        "Wrote {:?} ({} spine entries, {} items)",
        destination,
        normalized.spine.len(),
        normalized.items.len()
    );
    Ok(destination.to_path_buf())
}

fn write_container(package: &Package, normalized: &NormalizedPackage<'_>, path: &Path) -> Result<()> {
    let metadata = package.metadata();
    let modified = metadata.modified.unwrap_or_else(Utc::now);

    let mut writer = OcfWriter::create(path)?;
    writer.add_bytes(CONTAINER_ENTRY, CONTAINER_XML.as_bytes())?;
    writer.add_bytes(
        PACKAGE_DOCUMENT,
        documents::package_document(normalized, metadata, package.has_cover(), modified).as_bytes(),
    )?;

    for document in [GeneratedDocument::Ncx, GeneratedDocument::Navigation] {
        for item in normalized
            .items
            .iter()
            .filter(|i| i.item.source == ItemSource::Generated(document))
        {
            let body = match document {
                GeneratedDocument::Ncx => documents::ncx_document(normalized, metadata),
                GeneratedDocument::Navigation => documents::nav_document(normalized, metadata),
            };
            writer.add_bytes(&entry_name(&item.href), body.as_bytes())?;
        }
    }

    for item in normalized.items.iter().filter(|i| !i.is_generated()) {
        let name = entry_name(&item.href);
        match (&item.rewritten, &item.item.source) {
            (Some(bytes), _) => writer.add_bytes(&name, bytes)?,
            (None, ItemSource::Inline(bytes)) => writer.add_bytes(&name, bytes)?,
            (None, ItemSource::File(source)) => writer.add_file(&name, source)?,
            (None, ItemSource::Generated(_)) => {}
        }
    }

    writer.finish()
}

fn entry_name(href: &str) -> String {
    format!("{}/{}", CONTENT_DIR, href)
}
