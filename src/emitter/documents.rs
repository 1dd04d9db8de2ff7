//! Package document, NCX and navigation document generation.

use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use std::fmt::Write;

use crate::emitter::normalize::NormalizedPackage;
use crate::package::{COVER_IMAGE_ID, COVER_PAGE_ID, NavEntry, PackageMetadata};
use crate::types::Direction;

pub(crate) const GENERATOR: &str = concat!("Seihon ", env!("CARGO_PKG_VERSION"));

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// `content.opf`: metadata, manifest and spine.
pub(crate) fn package_document(
    package: &NormalizedPackage<'_>,
    metadata: &PackageMetadata,
    has_cover: bool,
    modified: DateTime<Utc>,
) -> String {
    let mut opf = String::from(XML_DECLARATION);
    let _ = writeln!(
        opf,
        "<package xmlns=\"http://www.idpf.org/2007/opf\" version=\"3.0\" unique-identifier=\"book-id\" xml:lang=\"{}\">",
        escape(metadata.language.as_str())
    );

    opf.push_str("  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\" xmlns:opf=\"http://www.idpf.org/2007/opf\">\n");
    let _ = writeln!(
        opf,
        "    <dc:identifier id=\"book-id\">{}</dc:identifier>",
        escape(metadata.identifier.as_str())
    );
    let _ = writeln!(opf, "    <dc:title>{}</dc:title>", escape(metadata.title.as_str()));
    let _ = writeln!(
        opf,
        "    <dc:language>{}</dc:language>",
        escape(metadata.language.as_str())
    );
    for (i, author) in metadata.authors.iter().enumerate() {
        let id = if i == 0 {
            "creator".to_string()
        } else {
            format!("creator_{}", i + 1)
        };
        let _ = writeln!(
            opf,
            "    <dc:creator id=\"{}\">{}</dc:creator>",
            id,
            escape(author.as_str())
        );
    }
    let _ = writeln!(
        opf,
        "    <dc:publisher>{}</dc:publisher>",
        escape(metadata.publisher.as_str())
    );
    if let Some(description) = &metadata.description {
        let _ = writeln!(
            opf,
            "    <dc:description>{}</dc:description>",
            escape(description.as_str())
        );
    }
    for subject in &metadata.subjects {
        let _ = writeln!(opf, "    <dc:subject>{}</dc:subject>", escape(subject.as_str()));
    }
    let _ = writeln!(
        opf,
        "    <meta property=\"dcterms:modified\">{}</meta>",
        modified.format("%Y-%m-%dT%H:%M:%SZ")
    );
    let _ = writeln!(opf, "    <meta name=\"generator\" content=\"{}\"/>", GENERATOR);
    if metadata.direction == Direction::Rtl {
        opf.push_str("    <meta name=\"primary-writing-mode\" content=\"vertical-rl\"/>\n");
    }
    if has_cover && package.item(COVER_IMAGE_ID).is_some() {
        let _ = writeln!(opf, "    <meta name=\"cover\" content=\"{}\"/>", COVER_IMAGE_ID);
    }
    opf.push_str("  </metadata>\n");

    opf.push_str("  <manifest>\n");
    for item in &package.items {
        let _ = write!(
            opf,
            "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"",
            escape(item.id.as_str()),
            escape(item.href.as_str()),
            escape(item.item.media_type.as_str())
        );
        if let Some(properties) = &item.item.properties {
            let _ = write!(opf, " properties=\"{}\"", escape(properties.as_str()));
        }
        opf.push_str("/>\n");
    }
    opf.push_str("  </manifest>\n");

    let _ = writeln!(
        opf,
        "  <spine toc=\"ncx\" page-progression-direction=\"{}\">",
        metadata.direction
    );
    for (idref, linear) in &package.spine {
        if *linear {
            let _ = writeln!(opf, "    <itemref idref=\"{}\"/>", escape(idref.as_str()));
        } else {
            let _ = writeln!(
                opf,
                "    <itemref idref=\"{}\" linear=\"no\"/>",
                escape(idref.as_str())
            );
        }
    }
    opf.push_str("  </spine>\n");
    opf.push_str("</package>\n");
    opf
}

/// Navigation entries to render, falling back to a single start entry.
fn effective_toc(package: &NormalizedPackage<'_>) -> Vec<NavEntry> {
    if !package.toc.is_empty() {
        return package.toc.clone();
    }
    if package.item(COVER_PAGE_ID).is_some() {
        return vec![NavEntry {
            title: "Cover".to_string(),
            target: COVER_PAGE_ID.to_string(),
            children: Vec::new(),
        }];
    }
    package
        .spine
        .first()
        .map(|(id, _)| NavEntry {
            title: "Start".to_string(),
            target: id.clone(),
            children: Vec::new(),
        })
        .into_iter()
        .collect()
}

/// `toc.ncx`: legacy navigation mirroring the navigation tree.
pub(crate) fn ncx_document(package: &NormalizedPackage<'_>, metadata: &PackageMetadata) -> String {
    let toc = effective_toc(package);
    let depth = toc.iter().map(NavEntry::depth).max().unwrap_or(1);

    let mut ncx = String::from(XML_DECLARATION);
    let _ = writeln!(
        ncx,
        "<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\" xml:lang=\"{}\">",
        escape(metadata.language.as_str())
    );
    ncx.push_str("  <head>\n");
    let _ = writeln!(
        ncx,
        "    <meta name=\"dtb:uid\" content=\"{}\"/>",
        escape(metadata.identifier.as_str())
    );
    let _ = writeln!(ncx, "    <meta name=\"dtb:depth\" content=\"{}\"/>", depth);
    ncx.push_str("    <meta name=\"dtb:totalPageCount\" content=\"0\"/>\n");
    ncx.push_str("    <meta name=\"dtb:maxPageNumber\" content=\"0\"/>\n");
    ncx.push_str("  </head>\n");
    let _ = writeln!(
        ncx,
        "  <docTitle><text>{}</text></docTitle>",
        escape(metadata.title.as_str())
    );
    ncx.push_str("  <navMap>\n");
    let mut play_order = 0;
    for entry in &toc {
        write_nav_point(&mut ncx, package, entry, 2, &mut play_order);
    }
    ncx.push_str("  </navMap>\n");
    ncx.push_str("</ncx>\n");
    ncx
}

fn write_nav_point(
    ncx: &mut String,
    package: &NormalizedPackage<'_>,
    entry: &NavEntry,
    indent: usize,
    play_order: &mut usize,
) {
    let Some(href) = package.href_of(&entry.target) else {
        return;
    };
    *play_order += 1;
    let pad = "  ".repeat(indent);
    let _ = writeln!(
        ncx,
        "{pad}<navPoint id=\"navpoint-{order}\" playOrder=\"{order}\">",
        pad = pad,
        order = play_order
    );
    let _ = writeln!(
        ncx,
        "{}  <navLabel><text>{}</text></navLabel>",
        pad,
        escape(entry.title.as_str())
    );
    let _ = writeln!(ncx, "{}  <content src=\"{}\"/>", pad, escape(href));
    for child in &entry.children {
        write_nav_point(ncx, package, child, indent + 1, play_order);
    }
    let _ = writeln!(ncx, "{}</navPoint>", pad);
}

/// `nav.xhtml`: table of contents and landmarks.
pub(crate) fn nav_document(package: &NormalizedPackage<'_>, metadata: &PackageMetadata) -> String {
    let toc = effective_toc(package);
    let lang = escape(metadata.language.as_str());

    let mut nav = String::from(XML_DECLARATION);
    nav.push_str("<!DOCTYPE html>\n");
    let _ = writeln!(
        nav,
        "<html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" xml:lang=\"{lang}\" lang=\"{lang}\">",
        lang = lang
    );
    nav.push_str("<head>\n  <meta charset=\"UTF-8\"/>\n");
    let _ = writeln!(nav, "  <title>{}</title>", escape(metadata.title.as_str()));
    nav.push_str("</head>\n<body>\n");

    nav.push_str("  <nav epub:type=\"toc\" id=\"toc\">\n    <h1>Table of Contents</h1>\n");
    write_nav_list(&mut nav, package, &toc, 2);
    nav.push_str("  </nav>\n");

    nav.push_str("  <nav epub:type=\"landmarks\" id=\"landmarks\" hidden=\"hidden\">\n    <h2>Landmarks</h2>\n    <ol>\n");
    nav.push_str("      <li><a epub:type=\"toc\" href=\"nav.xhtml#toc\">Table of Contents</a></li>\n");
    if let Some(cover_href) = package.href_of(COVER_PAGE_ID) {
        let _ = writeln!(
            nav,
            "      <li><a epub:type=\"cover\" href=\"{}\">Cover</a></li>",
            escape(cover_href)
        );
    }
    let body_start = package
        .spine
        .iter()
        .find(|(id, _)| id != COVER_PAGE_ID)
        .and_then(|(id, _)| package.href_of(id));
    if let Some(start) = body_start {
        let _ = writeln!(
            nav,
            "      <li><a epub:type=\"bodymatter\" href=\"{}\">Start</a></li>",
            escape(start)
        );
    }
    nav.push_str("    </ol>\n  </nav>\n");
    nav.push_str("</body>\n</html>\n");
    nav
}

fn write_nav_list(nav: &mut String, package: &NormalizedPackage<'_>, entries: &[NavEntry], indent: usize) {
    let pad = "  ".repeat(indent);
    let _ = writeln!(nav, "{}<ol>", pad);
    for entry in entries {
        let Some(href) = package.href_of(&entry.target) else {
            continue;
        };
        let _ = write!(
            nav,
            "{}  <li><a href=\"{}\">{}</a>",
            pad,
            escape(href),
            escape(entry.title.as_str())
        );
        if entry.children.is_empty() {
            nav.push_str("</li>\n");
        } else {
            nav.push('\n');
            write_nav_list(nav, package, &entry.children, indent + 2);
            let _ = writeln!(nav, "{}  </li>", pad);
        }
    }
    let _ = writeln!(nav, "{}</ol>", pad);
}
