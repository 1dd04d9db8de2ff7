//! Small helpers for reading and patching XML without a DOM.
//!
//! Rewrites work on raw tag text taken from the source document, so everything
//! that is not explicitly changed is written back byte for byte.

use lazy_static::lazy_static;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use regex::Regex;

use crate::error::{Error, Result};

lazy_static! {
    static ref ID_ATTRIBUTE: Regex =
        Regex::new(r#"(\sid\s*=\s*)("[^"]*"|'[^']*')"#).expect("invalid id attribute pattern");
}

/// Reader over a whole document with text kept exactly as written.
pub(crate) fn reader(src: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(src);
    reader.config_mut().trim_text(false);
    reader
}

/// Byte offset of the reader inside its source.
pub(crate) fn position(reader: &Reader<&[u8]>) -> usize {
    reader.buffer_position() as usize
}

/// Decoded and unescaped value of the attribute with local name `name`.
pub(crate) fn attribute(
    reader: &Reader<&[u8]>,
    e: &BytesStart<'_>,
    name: &[u8],
) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == name {
            let raw = reader.decoder().decode(&attr.value)?;
            let value = unescape(&raw)
                .map_err(|e| Error::Other(format!("Bad attribute value '{}': {:?}", raw, e)))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Whether the `class` attribute lists `class`.
pub(crate) fn has_class(reader: &Reader<&[u8]>, e: &BytesStart<'_>, class: &str) -> Result<bool> {
    Ok(attribute(reader, e, b"class")?
        .is_some_and(|value| value.split_whitespace().any(|c| c == class)))
}

/// Adds `name="value"` to a raw start or empty tag such as `<p class="x">`.
pub(crate) fn insert_attribute(raw_tag: &str, name: &str, value: &str) -> String {
    let (head, tail) = if raw_tag.ends_with("/>") {
        raw_tag.split_at(raw_tag.len() - 2)
    } else {
        raw_tag.split_at(raw_tag.len().saturating_sub(1))
    };
    format!("{} {}=\"{}\"{}", head.trim_end(), name, escape(value), tail)
}

/// Sets the `id` attribute of a raw tag, replacing an existing one.
pub(crate) fn set_id(raw_tag: &str, value: &str) -> String {
    if ID_ATTRIBUTE.is_match(raw_tag) {
        let replacement = format!("${{1}}\"{}\"", escape(value));
        ID_ATTRIBUTE.replace(raw_tag, replacement.as_str()).into_owned()
    } else {
        insert_attribute(raw_tag, "id", value)
    }
}

/// `full-path` of the first rootfile in `META-INF/container.xml`.
pub(crate) fn rootfile_path(container: &str) -> Result<Option<String>> {
    let mut reader = reader(container);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"rootfile" => {
                return attribute(&reader, &e, b"full-path");
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_attribute() {
        assert_eq!(insert_attribute("<p>", "id", "a"), "<p id=\"a\">");
        assert_eq!(
            insert_attribute("<img src=\"x.jpg\" />", "id", "b"),
            "<img src=\"x.jpg\" id=\"b\"/>"
        );
    }

    #[test]
    fn test_set_id_replaces_existing_value() {
        assert_eq!(
            set_id("<navPoint id=\"navpoint-1\" playOrder=\"1\">", "kobo_nav_1"),
            "<navPoint id=\"kobo_nav_1\" playOrder=\"1\">"
        );
        assert_eq!(set_id("<navPoint>", "kobo_nav_2"), "<navPoint id=\"kobo_nav_2\">");
    }
}
