use log::{debug, warn};
use quick_xml::events::Event;
use std::fmt::Write;
use std::path::Path;

use crate::emitter::GENERATOR;
use crate::emitter::ocf::CONTAINER_ENTRY;
use crate::error::{Error, Result};
use crate::package::{NCX_MEDIA_TYPE, XHTML_MEDIA_TYPE};
use crate::transform::ContainerTransform;
use crate::transform::markup::{transform_content_document, transform_nav_document};
use crate::types::Direction;
use crate::xml_utils::{self, attribute, insert_attribute, rootfile_path, set_id};

/// Metadata entries a Kobo reader uses to treat the book as manga.
const KOBO_METAS: [(&str, &str); 3] = [
    ("book-type", "manga"),
    ("orientation-lock", "portrait"),
    ("generator", GENERATOR),
];

/// Rewrites an unpacked container into Kobo's KEPUB flavour.
#[derive(Debug, Clone, Copy, Default)]
pub struct KoboTransform {
    pub direction: Direction,
}

impl KoboTransform {
    pub fn new(direction: Direction) -> Self {
        Self { direction }
    }
}

#[derive(Debug)]
struct ManifestEntry {
    id: String,
    href: String,
    media_type: String,
    properties: String,
}

impl ContainerTransform for KoboTransform {
    fn name(&self) -> &'static str {
        "kobo"
    }

    fn apply(&self, root: &Path) -> Result<()> {
        let container = std::fs::read_to_string(root.join(CONTAINER_ENTRY))?;
        let opf_rel = rootfile_path(&container)?
            .ok_or_else(|| Error::Transform("container.xml names no package document".to_string()))?;
        let opf_path = root.join(&opf_rel);
        let opf_dir = opf_path.parent().unwrap_or(root).to_path_buf();
        let opf = std::fs::read_to_string(&opf_path)?;
        let entries = manifest_entries(&opf)?;

        for entry in &entries {
            let path = opf_dir.join(&entry.href);
            if !path.is_file() {
                warn!("Manifest item '{}' has no file at {:?}, skipping", entry.id, path);
                continue;
            }
            if entry.media_type == NCX_MEDIA_TYPE {
                rewrite_file(&path, patch_ncx_document)?;
            } else if entry.media_type == XHTML_MEDIA_TYPE {
                if entry.properties.split_whitespace().any(|p| p == "nav") {
                    rewrite_file(&path, transform_nav_document)?;
                } else {
                    rewrite_file(&path, transform_content_document)?;
                }
            }
        }

        let ncx_id = entries
            .iter()
            .find(|e| e.media_type == NCX_MEDIA_TYPE)
            .map(|e| e.id.as_str());
        let patched = patch_package_document(&opf, self.direction, ncx_id)?;
        if patched != opf {
            std::fs::write(&opf_path, patched)?;
        }
        debug!("Kobo pass rewrote {} manifest items", entries.len());
        Ok(())
    }
}

fn rewrite_file(path: &Path, rewrite: fn(&str) -> Result<String>) -> Result<()> {
    let original = std::fs::read_to_string(path)?;
    let updated = rewrite(&original)
        .map_err(|e| Error::Transform(format!("{:?}: {}", path, e)))?;
    if updated != original {
        std::fs::write(path, updated)?;
    }
    Ok(())
}

fn manifest_entries(opf: &str) -> Result<Vec<ManifestEntry>> {
    let mut reader = xml_utils::reader(opf);
    let mut entries = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"item" => {
                entries.push(ManifestEntry {
                    id: attribute(&reader, &e, b"id")?.unwrap_or_default(),
                    href: attribute(&reader, &e, b"href")?.unwrap_or_default(),
                    media_type: attribute(&reader, &e, b"media-type")?.unwrap_or_default(),
                    properties: attribute(&reader, &e, b"properties")?.unwrap_or_default(),
                });
            }
            Event::Eof => return Ok(entries),
            _ => {}
        }
    }
}

/// Adds the spine direction, the spine `toc` reference and the Kobo metadata
/// entries that are missing. Existing values are never replaced.
pub fn patch_package_document(opf: &str, direction: Direction, ncx_id: Option<&str>) -> Result<String> {
    let mut present_metas = Vec::new();
    let mut reader = xml_utils::reader(opf);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"meta" => {
                if let Some(name) = attribute(&reader, &e, b"name")? {
                    present_metas.push(name);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let mut out = String::with_capacity(opf.len() + 256);
    let mut reader = xml_utils::reader(opf);
    loop {
        let start = xml_utils::position(&reader);
        let event = reader.read_event()?;
        let raw = &opf[start..xml_utils::position(&reader)];
        match event {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"spine" => {
                let mut tag = raw.to_string();
                if direction == Direction::Rtl
                    && attribute(&reader, &e, b"page-progression-direction")?.is_none()
                {
                    tag = insert_attribute(&tag, "page-progression-direction", direction.as_str());
                }
                if let (Some(ncx_id), None) = (ncx_id, attribute(&reader, &e, b"toc")?) {
                    tag = insert_attribute(&tag, "toc", ncx_id);
                }
                out.push_str(&tag);
            }
            Event::End(e) if e.local_name().as_ref() == b"metadata" => {
                for (name, content) in KOBO_METAS {
                    if !present_metas.iter().any(|m| m == name) {
                        let _ = writeln!(out, "  <meta name=\"{}\" content=\"{}\"/>", name, content);
                    }
                }
                out.push_str(raw);
            }
            Event::Eof => break,
            _ => out.push_str(raw),
        }
    }
    Ok(out)
}

/// Gives every navPoint whose id lacks "kobo" a `kobo_nav_<n>` id.
pub fn patch_ncx_document(ncx: &str) -> Result<String> {
    let mut out = String::with_capacity(ncx.len() + 64);
    let mut reader = xml_utils::reader(ncx);
    let mut count = 0usize;
    loop {
        let start = xml_utils::position(&reader);
        let event = reader.read_event()?;
        let raw = &ncx[start..xml_utils::position(&reader)];
        match event {
            Event::Start(e) if e.local_name().as_ref() == b"navPoint" => {
                count += 1;
                match attribute(&reader, &e, b"id")? {
                    Some(id) if id.contains("kobo") => out.push_str(raw),
                    _ => out.push_str(&set_id(raw, &format!("kobo_nav_{}", count))),
                }
            }
            Event::Eof => break,
            _ => out.push_str(raw),
        }
    }
    Ok(out)
}
