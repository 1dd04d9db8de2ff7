//! Structural checks of a written container.
//!
//! This is not a general EPUB validator. It checks the invariants this crate
//! promises for its own output: the mimetype entry, a resolvable package
//! document, unique well-formed ids, spine references that resolve, manifest
//! hrefs that exist in the archive, and a navigation document.

use log::debug;
use quick_xml::events::Event;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use zip::{CompressionMethod, ZipArchive};

use crate::emitter::normalize::resolve_href;
use crate::emitter::ocf::{CONTAINER_ENTRY, EPUB_MIMETYPE, MIMETYPE_ENTRY};
use crate::error::{Error, Result};
use crate::package::ids::is_valid_id;
use crate::xml_utils::{self, attribute, rootfile_path};

/// Findings of [`verify_container`]. Empty lists mean the check passed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerReport {
    pub entry_names: Vec<String>,
    pub mimetype_first_and_stored: bool,
    pub package_document: Option<String>,
    pub spine_idrefs: Vec<String>,
    pub unresolved_idrefs: Vec<String>,
    pub invalid_ids: Vec<String>,
    pub duplicate_ids: Vec<String>,
    pub missing_hrefs: Vec<String>,
    pub has_nav: bool,
}

impl ContainerReport {
    pub fn is_valid(&self) -> bool {
        self.mimetype_first_and_stored
            && self.package_document.is_some()
            && !self.spine_idrefs.is_empty()
            && self.unresolved_idrefs.is_empty()
            && self.invalid_ids.is_empty()
            && self.duplicate_ids.is_empty()
            && self.missing_hrefs.is_empty()
            && self.has_nav
    }
}

/// Opens the container at `path` and checks its structure.
pub fn verify_container(path: &Path) -> Result<ContainerReport> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut report = ContainerReport::default();
    for i in 0..archive.len() {
        report.entry_names.push(archive.by_index_raw(i)?.name().to_string());
    }

    if !archive.is_empty() {
        let mut first = archive.by_index(0)?;
        let mut content = String::new();
        first.read_to_string(&mut content)?;
        report.mimetype_first_and_stored = first.name() == MIMETYPE_ENTRY
            && first.compression() == CompressionMethod::Stored
            && content == EPUB_MIMETYPE;
    }

    let container = read_entry(&mut archive, CONTAINER_ENTRY)?;
    let Some(opf_path) = rootfile_path(&container)? else {
        return Ok(report);
    };
    let opf = read_entry(&mut archive, &opf_path)?;
    report.package_document = Some(opf_path.clone());
    let opf_dir = opf_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");

    let mut ids = HashSet::new();
    let mut reader = xml_utils::reader(&opf);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"item" => {
                    let id = attribute(&reader, &e, b"id")?.unwrap_or_default();
                    let href = attribute(&reader, &e, b"href")?.unwrap_or_default();
                    let properties = attribute(&reader, &e, b"properties")?.unwrap_or_default();
                    if !is_valid_id(&id) {
                        report.invalid_ids.push(id.clone());
                    }
                    if !ids.insert(id.clone()) {
                        report.duplicate_ids.push(id.clone());
                    }
                    let entry = resolve_href(opf_dir, &href);
                    if !report.entry_names.contains(&entry) {
                        report.missing_hrefs.push(href);
                    }
                    if properties.split_whitespace().any(|p| p == "nav") {
                        report.has_nav = true;
                    }
                }
                b"itemref" => {
                    if let Some(idref) = attribute(&reader, &e, b"idref")? {
                        report.spine_idrefs.push(idref);
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    report.unresolved_idrefs = report
        .spine_idrefs
        .iter()
        .filter(|idref| !ids.contains(*idref))
        .cloned()
        .collect();

    debug!(
        "Verified {:?}: {} entries, {} spine entries, valid: {}",
        path,
        report.entry_names.len(),
        report.spine_idrefs.len(),
        report.is_valid()
    );
    Ok(report)
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Result<String> {
    let mut entry = archive
        .by_name(name)
        .map_err(|_| Error::NotFound(format!("container entry '{}'", name)))?;
    let mut content = String::new();
    entry.read_to_string(&mut content)?;
    Ok(content)
}
