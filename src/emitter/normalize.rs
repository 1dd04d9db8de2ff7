//! Id and href normalization applied right before serialization.
//!
//! Item ids are forced into the id grammar and hrefs lose their spaces. When
//! either changes, references inside inline XHTML documents are rewritten so
//! they keep pointing at the renamed items.

use lazy_static::lazy_static;
use log::{debug, warn};
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::package::ids::{is_valid_id, normalize_href, sanitize_id, unique_href, unique_id};
use crate::package::{ItemSource, NavEntry, Package, PackageItem};

lazy_static! {
    static ref REFERENCE_ATTRIBUTE: Regex =
        Regex::new(r#"(\s(?:href|src|id)\s*=\s*)("[^"]*"|'[^']*')"#).expect("invalid attribute pattern");
}

/// An item as it will be written.
pub(crate) struct NormalizedItem<'a> {
    pub item: &'a PackageItem,
    pub id: String,
    pub href: String,
    /// Rewritten bytes for inline documents whose references changed.
    pub rewritten: Option<Vec<u8>>,
}

impl NormalizedItem<'_> {
    pub fn is_generated(&self) -> bool {
        matches!(self.item.source, ItemSource::Generated(_))
    }
}

pub(crate) struct NormalizedPackage<'a> {
    pub items: Vec<NormalizedItem<'a>>,
    /// (id, linear) in reading order.
    pub spine: Vec<(String, bool)>,
    pub toc: Vec<NavEntry>,
}

impl<'a> NormalizedPackage<'a> {
    pub fn item(&self, id: &str) -> Option<&NormalizedItem<'a>> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn href_of(&self, id: &str) -> Option<&str> {
        self.item(id).map(|i| i.href.as_str())
    }

    /// Spine entries pointing at content the emitter writes from the package.
    pub fn content_count(&self) -> usize {
        self.spine
            .iter()
            .filter(|(id, _)| self.item(id).is_some_and(|i| !i.is_generated()))
            .count()
    }
}

pub(crate) fn normalize(package: &Package) -> Result<NormalizedPackage<'_>> {
    let mut id_map: HashMap<&str, String> = HashMap::new();
    let mut href_map: HashMap<&str, String> = HashMap::new();
    let mut ids: Vec<String> = Vec::new();
    let mut hrefs: Vec<String> = Vec::new();

    for item in package.items() {
        let id = unique_id(&sanitize_id(&item.id), |c| ids.iter().any(|i| i == c));
        let href = unique_href(&normalize_href(&item.href), |c| hrefs.iter().any(|h| h == c));
        if id != item.id {
            debug!("Item id '{}' normalized to '{}'", item.id, id);
        }
        if href != item.href {
            debug!("Item href '{}' normalized to '{}'", item.href, href);
        }
        id_map.insert(item.id.as_str(), id.clone());
        href_map.insert(item.href.as_str(), href.clone());
        ids.push(id);
        hrefs.push(href);
    }

    let changed = package
        .items()
        .iter()
        .any(|item| id_map[item.id.as_str()] != item.id || href_map[item.href.as_str()] != item.href);

    let mut items = Vec::with_capacity(package.items().len());
    for item in package.items() {
        let href = href_map[item.href.as_str()].clone();
        let rewritten = match &item.source {
            ItemSource::Inline(bytes) if changed && item.is_xhtml() => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    Error::Assembly(format!("document '{}' is not UTF-8: {}", item.href, e))
                })?;
                match rewrite_references(text, &item.href, &href, &href_map) {
                    Cow::Owned(updated) => Some(updated.into_bytes()),
                    Cow::Borrowed(_) => None,
                }
            }
            _ => None,
        };
        items.push(NormalizedItem {
            item,
            id: id_map[item.id.as_str()].clone(),
            href,
            rewritten,
        });
    }

    let spine = package
        .spine()
        .iter()
        .filter_map(|entry| match id_map.get(entry.idref.as_str()) {
            Some(id) => Some((id.clone(), entry.linear)),
            None => {
                warn!("Skipping spine entry '{}': no such item", entry.idref);
                None
            }
        })
        .collect();

    let toc = remap_nav(package.toc(), &id_map);

    Ok(NormalizedPackage { items, spine, toc })
}

fn remap_nav(entries: &[NavEntry], id_map: &HashMap<&str, String>) -> Vec<NavEntry> {
    entries
        .iter()
        .filter_map(|entry| {
            let Some(target) = id_map.get(entry.target.as_str()) else {
                warn!("Dropping navigation entry '{}': no such item", entry.title);
                return None;
            };
            Some(NavEntry {
                title: entry.title.clone(),
                target: target.clone(),
                children: remap_nav(&entry.children, id_map),
            })
        })
        .collect()
}

/// Rewrites `href`/`src`/`id` attribute values of one XHTML document.
fn rewrite_references<'t>(
    text: &'t str,
    old_doc_href: &str,
    new_doc_href: &str,
    href_map: &HashMap<&str, String>,
) -> Cow<'t, str> {
    let old_dir = parent_dir(old_doc_href);
    let new_dir = parent_dir(new_doc_href);

    REFERENCE_ATTRIBUTE.replace_all(text, |caps: &Captures| {
        let prefix = &caps[1];
        let quoted = &caps[2];
        let quote = &quoted[..1];
        let value = &quoted[1..quoted.len() - 1];

        let updated = if prefix.trim_start().starts_with("id") {
            if is_valid_id(value) {
                value.to_string()
            } else {
                sanitize_id(value)
            }
        } else {
            rewrite_link(value, old_dir, new_dir, href_map)
        };
        format!("{}{}{}{}", prefix, quote, updated, quote)
    })
}

fn rewrite_link(value: &str, old_dir: &str, new_dir: &str, href_map: &HashMap<&str, String>) -> String {
    if value.contains(':') || value.starts_with('/') || value.starts_with('#') || value.is_empty() {
        return value.to_string();
    }
    let (path, fragment) = match value.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment)),
        None => (value, None),
    };
    let resolved = resolve_href(old_dir, path);
    let target = match href_map.get(resolved.as_str()) {
        Some(mapped) => relative_href(new_dir, mapped),
        None => normalize_href(path),
    };
    match fragment {
        Some(fragment) => format!("{}#{}", target, fragment),
        None => target,
    }
}

fn parent_dir(href: &str) -> &str {
    href.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Resolves `relative` against the directory `base_dir` (both container-relative).
pub(crate) fn resolve_href(base_dir: &str, relative: &str) -> String {
    let mut parts: Vec<&str> = base_dir.split('/').filter(|p| !p.is_empty()).collect();
    for segment in relative.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Path of `target` as seen from a document in `from_dir`.
pub(crate) fn relative_href(from_dir: &str, target: &str) -> String {
    let from: Vec<&str> = from_dir.split('/').filter(|p| !p.is_empty()).collect();
    let to: Vec<&str> = target.split('/').filter(|p| !p.is_empty()).collect();
    let common = from.iter().zip(to.iter()).take_while(|(a, b)| a == b).count();
    let mut parts: Vec<&str> = std::iter::repeat_n("..", from.len() - common).collect();
    parts.extend_from_slice(&to[common..]);
    parts.join("/")
}
