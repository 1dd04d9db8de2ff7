//! Static content documents rendered from the bundled templates.
//!
//! Placeholders use the `%name%` form and are filled in a single pass, so a
//! substituted value is never scanned for placeholders again. Values are
//! XML-escaped before they are substituted.

use lazy_static::lazy_static;
use quick_xml::escape::escape;
use regex::{Captures, Regex};

pub(crate) const DEFAULT_CSS: &str = include_str!("../../templates/default.css");
pub(crate) const COVER_CSS: &str = include_str!("../../templates/cover.css");
pub(crate) const CONTAINER_XML: &str = include_str!("../../templates/container.xml");

const PAGE_TEMPLATE: &str = include_str!("../../templates/page.xhtml");
const COVER_TEMPLATE: &str = include_str!("../../templates/cover.xhtml");
const CHAPTER_TEMPLATE: &str = include_str!("../../templates/chapter.xhtml");

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"%(\w+)%").expect("invalid placeholder pattern");
}

/// Replaces every known `%name%` in `template`; unknown names are left as is.
fn render(template: &str, values: &[(&str, &str)]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            match values.iter().find(|(name, _)| *name == &caps[1]) {
                Some((_, value)) => escape(*value).into_owned(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Image page: one image centered on its own page.
pub(crate) fn image_page(title: &str, image_src: &str, css_href: &str, lang: &str) -> String {
    render(
        PAGE_TEMPLATE,
        &[("lang", lang), ("css", css_href), ("src", image_src), ("alt", title), ("title", title)],
    )
}

pub(crate) fn cover_page(title: &str, image_src: &str, css_href: &str, lang: &str) -> String {
    render(
        COVER_TEMPLATE,
        &[("lang", lang), ("css", css_href), ("src", image_src), ("alt", title), ("title", title)],
    )
}

/// Chapter heading page shown before the first page of a chapter.
pub(crate) fn chapter_heading(title: &str, page_count: usize, css_href: &str, lang: &str) -> String {
    let pages = if page_count == 1 {
        "1 page.".to_string()
    } else {
        format!("{} pages.", page_count)
    };
    render(
        CHAPTER_TEMPLATE,
        &[("lang", lang), ("css", css_href), ("pages", &pages), ("title", title)],
    )
}
