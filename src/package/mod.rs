//! In-memory model of a packaged volume.
//!
//! A [`Package`] holds the metadata, the manifest items, the reading order
//! (spine) and the navigation tree of one container. It is built by value:
//! every mutating operation consumes the package and returns the updated one.
//! Nothing touches the filesystem except existence checks of source images; the
//! [`crate::emitter`] turns a finalized package into bytes.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Direction, MangaMetadata, get_file_info};

pub(crate) mod documents;
pub mod ids;

use ids::{id_fragment, unique_href, unique_id};

/// Child groups are created for chapters with more pages than this.
pub const PAGES_PER_NAV_GROUP: usize = 10;

pub const COVER_IMAGE_ID: &str = "cover-img";
pub const COVER_PAGE_ID: &str = "cover";
pub const NAV_ID: &str = "nav";
pub const NCX_ID: &str = "ncx";
pub const DEFAULT_STYLE_ID: &str = "style_default";
pub const COVER_STYLE_ID: &str = "style_cover";

pub const XHTML_MEDIA_TYPE: &str = "application/xhtml+xml";
pub const NCX_MEDIA_TYPE: &str = "application/x-dtbncx+xml";
pub const CSS_MEDIA_TYPE: &str = "text/css";

/// Documents the emitter renders from the package itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratedDocument {
    Navigation,
    Ncx,
}

/// Where the bytes of an item come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemSource {
    File(PathBuf),
    Inline(Vec<u8>),
    Generated(GeneratedDocument),
}

/// One entry of the package manifest. `href` is relative to the package document.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub properties: Option<String>,
    pub source: ItemSource,
}

impl PackageItem {
    pub fn is_xhtml(&self) -> bool {
        self.media_type == XHTML_MEDIA_TYPE
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpineEntry {
    pub idref: String,
    pub linear: bool,
}

/// Navigation node; `target` is the id of a content item.
#[derive(Debug, Clone, PartialEq)]
pub struct NavEntry {
    pub title: String,
    pub target: String,
    pub children: Vec<NavEntry>,
}

impl NavEntry {
    fn leaf(title: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            target: target.into(),
            children: Vec::new(),
        }
    }

    /// Depth of the subtree rooted here (a leaf has depth 1).
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(NavEntry::depth).max().unwrap_or(0)
    }
}

/// Package-level metadata written to the package document.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageMetadata {
    pub identifier: String,
    pub title: String,
    pub language: String,
    pub authors: Vec<String>,
    pub publisher: String,
    pub description: Option<String>,
    pub subjects: Vec<String>,
    pub direction: Direction,
    /// Fixed modification time; the emission time is used when absent.
    pub modified: Option<DateTime<Utc>>,
}

/// A chapter added to the package, kept so `finalize` can check navigation.
#[derive(Debug, Clone, PartialEq)]
struct ChapterMark {
    title: String,
    heading_id: String,
    page_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    metadata: PackageMetadata,
    items: Vec<PackageItem>,
    spine: Vec<SpineEntry>,
    toc: Vec<NavEntry>,
    chapters: Vec<ChapterMark>,
    has_cover: bool,
    finalized: bool,
}

impl Package {
    /// Creates an empty package carrying only its stylesheets.
    ///
    /// A missing identifier is a name-based UUID of the full title, so
    /// rebuilding the same volume yields the same identifier.
    pub fn new(
        title: &str,
        language: &str,
        author: Option<&str>,
        identifier: Option<&str>,
        publisher: Option<&str>,
    ) -> Self {
        let identifier = identifier
            .map(str::to_string)
            .unwrap_or_else(|| title_identifier(title));
        let language = if language.trim().is_empty() {
            "en".to_string()
        } else {
            language.trim().to_string()
        };

        let mut package = Self {
            metadata: PackageMetadata {
                identifier,
                title: title.to_string(),
                language,
                authors: author.map(|a| vec![a.to_string()]).unwrap_or_default(),
                publisher: publisher.unwrap_or("Seihon").to_string(),
                description: None,
                subjects: Vec::new(),
                direction: Direction::Rtl,
                modified: None,
            },
            items: Vec::new(),
            spine: Vec::new(),
            toc: Vec::new(),
            chapters: Vec::new(),
            has_cover: false,
            finalized: false,
        };
        package.ensure_styles();
        package
    }

    /// Creates a package from volume-level metadata.
    pub fn from_metadata(metadata: &MangaMetadata, title: &str, identifier: Option<&str>) -> Self {
        let identifier = identifier.or(metadata.identifier.as_deref());
        let mut package = Self::new(
            title,
            &metadata.language,
            None,
            identifier,
            metadata.publisher.as_deref(),
        );
        package.metadata.authors = metadata.authors.clone();
        package.metadata.description = metadata.description.clone();
        package.metadata.subjects = metadata.tags.clone();
        package.metadata.modified = metadata.modified;
        package
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.metadata.direction = direction;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    pub fn with_subjects(mut self, subjects: Vec<String>) -> Self {
        self.metadata.subjects = subjects;
        self
    }

    /// Pins `dcterms:modified`, making repeated emissions byte-identical.
    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.metadata.modified = Some(modified);
        self
    }

    pub fn metadata(&self) -> &PackageMetadata {
        &self.metadata
    }

    pub fn items(&self) -> &[PackageItem] {
        &self.items
    }

    pub fn spine(&self) -> &[SpineEntry] {
        &self.spine
    }

    pub fn toc(&self) -> &[NavEntry] {
        &self.toc
    }

    pub fn has_cover(&self) -> bool {
        self.has_cover
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn item(&self, id: &str) -> Option<&PackageItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Number of spine entries that resolve to an item.
    pub fn content_count(&self) -> usize {
        self.spine
            .iter()
            .filter(|s| self.item(&s.idref).is_some())
            .count()
    }

    /// Sets the cover image, replacing any previous cover.
    ///
    /// The image becomes `cover-img` (property `cover-image`) and a cover page
    /// is placed first in the spine.
    pub fn set_cover(mut self, image_path: &Path) -> Result<Self> {
        self.check_mutable()?;
        if !image_path.is_file() {
            return Err(Error::NotFound(format!(
                "Cover image does not exist: {:?}",
                image_path
            )));
        }
        let (ext, media_type) = get_file_info(image_path)?;

        self.items.retain(|item| {
            item.id != COVER_IMAGE_ID
                && item.id != COVER_PAGE_ID
                && item.properties.as_deref() != Some("cover-image")
        });
        self.spine.retain(|entry| entry.idref != COVER_PAGE_ID);
        self.toc.retain(|entry| entry.target != COVER_PAGE_ID);

        let image_href = format!("images/cover.{}", ext);
        self.items.push(PackageItem {
            id: COVER_IMAGE_ID.to_string(),
            href: image_href.clone(),
            media_type: media_type.to_string(),
            properties: Some("cover-image".to_string()),
            source: ItemSource::File(image_path.to_path_buf()),
        });
        let page = documents::cover_page(
            &self.metadata.title,
            &image_href,
            "style/cover.css",
            &self.metadata.language,
        );
        self.items.push(PackageItem {
            id: COVER_PAGE_ID.to_string(),
            href: "cover.xhtml".to_string(),
            media_type: XHTML_MEDIA_TYPE.to_string(),
            properties: None,
            source: ItemSource::Inline(page.into_bytes()),
        });
        self.spine.insert(
            0,
            SpineEntry {
                idref: COVER_PAGE_ID.to_string(),
                linear: true,
            },
        );
        self.has_cover = true;
        debug!("Cover set to {:?}", image_path);
        Ok(self)
    }

    /// Appends a chapter: a heading page followed by one page per image.
    ///
    /// Images that are missing or of an unsupported type are skipped with a
    /// warning. A chapter left without images is skipped entirely. Chapters with
    /// more than [`PAGES_PER_NAV_GROUP`] pages get child navigation groups
    /// titled "Pages i-j".
    pub fn add_chapter(mut self, chapter_id: &str, title: &str, images: &[PathBuf]) -> Result<Self> {
        self.check_mutable()?;

        let usable: Vec<(&PathBuf, &'static str, &'static str)> = images
            .iter()
            .filter_map(|path| {
                if !path.is_file() {
                    warn!("Skipping missing image {:?} in chapter '{}'", path, title);
                    return None;
                }
                match get_file_info(path) {
                    Ok((ext, media_type)) => Some((path, ext, media_type)),
                    Err(e) => {
                        warn!("Skipping image {:?} in chapter '{}': {}", path, title, e);
                        None
                    }
                }
            })
            .collect();

        if usable.is_empty() {
            warn!("Chapter '{}' has no usable images, skipping it", title);
            return Ok(self);
        }

        let key = id_fragment(chapter_id);
        let lang = self.metadata.language.clone();

        let heading_id = self.unique_item_id(&format!("chapter_{}", key));
        let heading_href = self.unique_item_href(&format!("chapters/{}.xhtml", key));
        let heading = documents::chapter_heading(title, usable.len(), "../style/default.css", &lang);
        self.push_content(heading_id.clone(), heading_href, heading);

        let mut page_ids = Vec::with_capacity(usable.len());
        for (index, (path, ext, media_type)) in usable.iter().enumerate() {
            let number = index + 1;

            let image_id = self.unique_item_id(&format!("img_{}_{:03}", key, number));
            let image_href = self.unique_item_href(&format!("images/{}/{:03}.{}", key, number, ext));
            self.items.push(PackageItem {
                id: image_id,
                href: image_href.clone(),
                media_type: media_type.to_string(),
                properties: None,
                source: ItemSource::File((*path).clone()),
            });

            let page_id = self.unique_item_id(&format!("page_{}_{:03}", key, number));
            let page_href = self.unique_item_href(&format!("pages/{}_{:03}.xhtml", key, number));
            let page = documents::image_page(
                &format!("{} - Page {}", title, number),
                &format!("../{}", image_href),
                "../style/default.css",
                &lang,
            );
            self.push_content(page_id.clone(), page_href, page);
            page_ids.push(page_id);
        }

        self.toc.push(chapter_nav(title, &heading_id, &page_ids));
        self.chapters.push(ChapterMark {
            title: title.to_string(),
            heading_id,
            page_ids,
        });
        debug!("Added chapter '{}' with {} pages", title, usable.len());
        Ok(self)
    }

    /// Completes the package for emission.
    ///
    /// Adds the navigation documents and stylesheets if missing, gives every
    /// chapter with pages a navigation entry, drops spine entries that do not
    /// resolve, and falls back to a cover entry when the navigation is empty.
    /// Further mutations are rejected. Finalizing twice is a no-op.
    pub fn finalize(mut self) -> Result<Self> {
        if self.finalized {
            return Ok(self);
        }

        self.ensure_styles();
        if self.item(NAV_ID).is_none() {
            self.items.push(PackageItem {
                id: NAV_ID.to_string(),
                href: "nav.xhtml".to_string(),
                media_type: XHTML_MEDIA_TYPE.to_string(),
                properties: Some("nav".to_string()),
                source: ItemSource::Generated(GeneratedDocument::Navigation),
            });
        }
        if self.item(NCX_ID).is_none() {
            self.items.push(PackageItem {
                id: NCX_ID.to_string(),
                href: "toc.ncx".to_string(),
                media_type: NCX_MEDIA_TYPE.to_string(),
                properties: None,
                source: ItemSource::Generated(GeneratedDocument::Ncx),
            });
        }

        let missing: Vec<NavEntry> = self
            .chapters
            .iter()
            .filter(|c| !c.page_ids.is_empty())
            .filter(|c| !self.toc.iter().any(|n| n.target == c.heading_id))
            .map(|c| chapter_nav(&c.title, &c.heading_id, &c.page_ids))
            .collect();
        self.toc.extend(missing);

        let before = self.spine.len();
        let items = &self.items;
        self.spine.retain(|entry| {
            let resolves = items.iter().any(|i| i.id == entry.idref);
            if !resolves {
                warn!("Dropping spine entry '{}': no such item", entry.idref);
            }
            resolves
        });
        if self.spine.len() != before {
            debug!("Dropped {} unresolved spine entries", before - self.spine.len());
        }

        if self.toc.is_empty() && self.has_cover {
            self.toc.push(NavEntry::leaf("Cover", COVER_PAGE_ID));
        }

        self.finalized = true;
        Ok(self)
    }

    fn check_mutable(&self) -> Result<()> {
        if self.finalized {
            return Err(Error::Assembly(
                "package is finalized and can no longer be changed".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_styles(&mut self) {
        for (id, href, css) in [
            (DEFAULT_STYLE_ID, "style/default.css", documents::DEFAULT_CSS),
            (COVER_STYLE_ID, "style/cover.css", documents::COVER_CSS),
        ] {
            if self.item(id).is_none() {
                self.items.push(PackageItem {
                    id: id.to_string(),
                    href: href.to_string(),
                    media_type: CSS_MEDIA_TYPE.to_string(),
                    properties: None,
                    source: ItemSource::Inline(css.as_bytes().to_vec()),
                });
            }
        }
    }

    fn push_content(&mut self, id: String, href: String, document: String) {
        self.items.push(PackageItem {
            id: id.clone(),
            href,
            media_type: XHTML_MEDIA_TYPE.to_string(),
            properties: None,
            source: ItemSource::Inline(document.into_bytes()),
        });
        self.spine.push(SpineEntry {
            idref: id,
            linear: true,
        });
    }

    fn unique_item_id(&self, base: &str) -> String {
        unique_id(base, |candidate| self.items.iter().any(|i| i.id == candidate))
    }

    fn unique_item_href(&self, base: &str) -> String {
        unique_href(base, |candidate| {
            self.items.iter().any(|i| i.href == candidate)
        })
    }
}

/// Navigation entry of a chapter; long chapters get "Pages i-j" children.
fn chapter_nav(title: &str, heading_id: &str, page_ids: &[String]) -> NavEntry {
    let mut entry = NavEntry::leaf(title, heading_id);
    if page_ids.len() > PAGES_PER_NAV_GROUP {
        entry.children = page_ids
            .chunks(PAGES_PER_NAV_GROUP)
            .enumerate()
            .map(|(group, ids)| {
                let first = group * PAGES_PER_NAV_GROUP + 1;
                let last = first + ids.len() - 1;
                NavEntry::leaf(format!("Pages {}-{}", first, last), ids[0].clone())
            })
            .collect();
    }
    entry
}

/// `urn:uuid:` identifier derived from every byte of `title`.
pub fn title_identifier(title: &str) -> String {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("seihon:{}", title).as_bytes());
    format!("urn:uuid:{}", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_ids(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("page_c_{:03}", i)).collect()
    }

    #[test]
    fn test_short_chapter_nav_is_flat() {
        let nav = chapter_nav("Chapter 1", "chapter_c", &page_ids(10));
        assert!(nav.children.is_empty());
        assert_eq!(nav.depth(), 1);
    }

    #[test]
    fn test_non_latin_titles_get_distinct_identifiers() {
        let first = Package::new("進撃の巨人 - Volume 1", "ja", None, None, None);
        let second = Package::new("鬼滅の刃だ - Volume 1", "ja", None, None, None);
        assert_ne!(first.metadata().identifier, second.metadata().identifier);
        assert_eq!(
            Package::new("進撃の巨人 - Volume 1", "ja", None, None, None).metadata().identifier,
            first.metadata().identifier
        );
    }

    #[test]
    fn test_long_chapter_nav_is_grouped() {
        let nav = chapter_nav("Chapter 1", "chapter_c", &page_ids(21));
        let titles: Vec<&str> = nav.children.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, vec!["Pages 1-10", "Pages 11-20", "Pages 21-21"]);
        assert_eq!(nav.children[1].target, "page_c_011");
        assert_eq!(nav.depth(), 2);
    }

    #[test]
    fn test_new_package_has_styles_and_derived_identifier() {
        let package = Package::new("My Book", "", None, None, None);
        assert!(package.item(DEFAULT_STYLE_ID).is_some());
        assert!(package.item(COVER_STYLE_ID).is_some());
        assert_eq!(package.metadata().identifier, title_identifier("My Book"));
        assert!(package.metadata().identifier.starts_with("urn:uuid:"));
        assert_eq!(package.metadata().language, "en");
        assert_eq!(package.content_count(), 0);
        assert_eq!(
            Package::new("My Book", "", None, None, None).metadata().identifier,
            package.metadata().identifier
        );
    }

    #[test]
    fn test_finalized_package_rejects_mutation() {
        let package = Package::new("Book", "en", None, None, None).finalize().unwrap();
        assert!(package.item(NAV_ID).is_some());
        assert!(package.item(NCX_ID).is_some());
        let err = package.add_chapter("c1", "Chapter 1", &[]).unwrap_err();
        assert!(matches!(err, Error::Assembly(_)));
    }
}
