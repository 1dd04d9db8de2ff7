//! Kobo markup for content and navigation documents.
//!
//! Documents are rewritten as a stream of quick-xml events whose raw source
//! slices are copied to the output. Only paragraphs, image containers, images
//! and navigation anchors are touched; everything else is written back exactly
//! as it was read, including entities in text.

use lazy_static::lazy_static;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use regex::Regex;

use crate::error::{Error, Result};
use crate::xml_utils::{self, attribute, has_class, insert_attribute};

pub const KOBO_NAMESPACE: &str = "http://ns.kobo.com/1.0";
pub const KOBO_SPAN_CLASS: &str = "koboSpan";

lazy_static! {
    static ref SENTENCE_END: Regex = Regex::new(r"[.!?]+").expect("invalid sentence pattern");
}

/// Part of an element's content, kept as raw source text.
#[derive(Debug)]
enum Piece {
    /// Text (including entity references) at `depth` below the element.
    Text { raw: String, depth: usize },
    Markup { raw: String, kobo_span: bool },
}

impl Piece {
    fn raw(&self) -> &str {
        match self {
            Piece::Text { raw, .. } | Piece::Markup { raw, .. } => raw,
        }
    }
}

/// Splits `text` after every run of sentence punctuation.
///
/// Fragments concatenate back to `text`. A whitespace-only fragment is merged
/// into the fragment before it, or into the next one when it comes first.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut bounds = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(text) {
        bounds.push((start, m.end()));
        start = m.end();
    }
    if start < text.len() {
        bounds.push((start, text.len()));
    }

    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(bounds.len());
    let mut pending_start: Option<usize> = None;
    for (start, end) in bounds {
        if text[start..end].trim().is_empty() {
            match merged.last_mut() {
                Some(last) => last.1 = end,
                None => pending_start = pending_start.or(Some(start)),
            }
            continue;
        }
        merged.push((pending_start.take().unwrap_or(start), end));
    }
    if let (Some(start), true) = (pending_start, merged.is_empty()) {
        merged.push((start, text.len()));
    }

    merged.into_iter().map(|(s, e)| &text[s..e]).collect()
}

/// Adds Kobo spans and ids to an XHTML content document.
///
/// Paragraphs that already contain a kobo span are left alone, so running the
/// rewrite twice gives the same document as running it once.
pub fn transform_content_document(src: &str) -> Result<String> {
    let mut reader = xml_utils::reader(src);
    let mut out = String::with_capacity(src.len() + src.len() / 4);
    let mut root_seen = false;
    let mut paragraph_index = 0usize;
    let mut image_div_index = 0usize;
    let mut image_index = 0usize;
    // One entry per open element: whether it is a kobo span.
    let mut open: Vec<bool> = Vec::new();

    loop {
        let start = xml_utils::position(&reader);
        let event = reader.read_event()?;
        let raw = &src[start..xml_utils::position(&reader)];
        match event {
            Event::Start(_) if !root_seen => {
                root_seen = true;
                open.push(false);
                out.push_str(&with_kobo_namespace(raw));
            }
            Event::Start(e) if e.local_name().as_ref() == b"p" => {
                let index = paragraph_index;
                paragraph_index += 1;
                let (pieces, end_raw) = read_element_content(&mut reader, src)?;
                out.push_str(&render_paragraph(&reader, &e, raw, &pieces, index)?);
                out.push_str(&end_raw);
            }
            Event::Start(e) => {
                if e.local_name().as_ref() == b"div" && has_class(&reader, &e, "image")? {
                    let index = image_div_index;
                    image_div_index += 1;
                    if attribute(&reader, &e, b"id")?.is_none() {
                        open.push(false);
                        out.push_str(&insert_attribute(raw, "id", &format!("kobo_img_{}", index)));
                        continue;
                    }
                }
                open.push(has_class(&reader, &e, KOBO_SPAN_CLASS)?);
                out.push_str(raw);
            }
            Event::End(_) => {
                open.pop();
                out.push_str(raw);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"img" && !open.iter().any(|k| *k) => {
                out.push_str(&kobo_span(&format!("kobo.img.{}.1", image_index), raw));
                image_index += 1;
            }
            Event::Eof => break,
            _ => out.push_str(raw),
        }
    }
    Ok(out)
}

/// Adds the namespace to the root and wraps plain anchor texts in
/// `kobo.toc.<n>` spans.
pub fn transform_nav_document(src: &str) -> Result<String> {
    let mut reader = xml_utils::reader(src);
    let mut out = String::with_capacity(src.len() + src.len() / 4);
    let mut root_seen = false;
    let mut anchor_count = 0usize;

    loop {
        let start = xml_utils::position(&reader);
        let event = reader.read_event()?;
        let raw = &src[start..xml_utils::position(&reader)];
        match event {
            Event::Start(_) if !root_seen => {
                root_seen = true;
                out.push_str(&with_kobo_namespace(raw));
            }
            Event::Start(e) if e.local_name().as_ref() == b"a" => {
                let (pieces, end_raw) = read_element_content(&mut reader, src)?;
                out.push_str(raw);
                let plain = !pieces.is_empty()
                    && pieces.iter().all(|p| matches!(p, Piece::Text { .. }))
                    && pieces.iter().any(|p| !p.raw().trim().is_empty());
                let text: String = pieces.iter().map(Piece::raw).collect();
                if plain {
                    anchor_count += 1;
                    out.push_str(&kobo_span(&format!("kobo.toc.{}", anchor_count), &text));
                } else {
                    out.push_str(&text);
                }
                out.push_str(&end_raw);
            }
            Event::Eof => break,
            _ => out.push_str(raw),
        }
    }
    Ok(out)
}

fn with_kobo_namespace(raw_root: &str) -> String {
    if raw_root.contains("xmlns:kobo") {
        raw_root.to_string()
    } else {
        insert_attribute(raw_root, "xmlns:kobo", KOBO_NAMESPACE)
    }
}

fn kobo_span(id: &str, content: &str) -> String {
    format!(
        "<span class=\"{}\" id=\"{}\">{}</span>",
        KOBO_SPAN_CLASS,
        escape(id),
        content
    )
}

/// Reads up to the end tag of the element that was just opened.
///
/// Returns the content pieces and the raw end tag.
fn read_element_content(reader: &mut Reader<&[u8]>, src: &str) -> Result<(Vec<Piece>, String)> {
    let mut pieces: Vec<Piece> = Vec::new();
    let mut depth = 0usize;
    loop {
        let start = xml_utils::position(reader);
        let event = reader.read_event()?;
        let raw = &src[start..xml_utils::position(reader)];
        match event {
            Event::Start(e) => {
                let kobo_span = has_class(reader, &e, KOBO_SPAN_CLASS)?;
                depth += 1;
                pieces.push(Piece::Markup { raw: raw.to_string(), kobo_span });
            }
            Event::Empty(e) => {
                let kobo_span = has_class(reader, &e, KOBO_SPAN_CLASS)?;
                pieces.push(Piece::Markup { raw: raw.to_string(), kobo_span });
            }
            Event::End(_) if depth == 0 => return Ok((pieces, raw.to_string())),
            Event::End(_) => {
                depth -= 1;
                pieces.push(Piece::Markup { raw: raw.to_string(), kobo_span: false });
            }
            Event::Text(_) | Event::GeneralRef(_) => match pieces.last_mut() {
                Some(Piece::Text { raw: text, depth: d }) if *d == depth => text.push_str(raw),
                _ => pieces.push(Piece::Text { raw: raw.to_string(), depth }),
            },
            Event::Eof => {
                return Err(Error::Transform(
                    "document ended inside an open element".to_string(),
                ));
            }
            _ => pieces.push(Piece::Markup { raw: raw.to_string(), kobo_span: false }),
        }
    }
}

fn render_paragraph(
    reader: &Reader<&[u8]>,
    start: &BytesStart<'_>,
    raw_start: &str,
    pieces: &[Piece],
    index: usize,
) -> Result<String> {
    let already_spanned = pieces
        .iter()
        .any(|p| matches!(p, Piece::Markup { kobo_span: true, .. }));
    let has_text = pieces
        .iter()
        .any(|p| matches!(p, Piece::Text { raw, .. } if !raw.trim().is_empty()));
    if already_spanned || !has_text {
        let mut out = raw_start.to_string();
        pieces.iter().for_each(|p| out.push_str(p.raw()));
        return Ok(out);
    }

    let (mut out, paragraph_id) = match attribute(reader, start, b"id")? {
        Some(id) => (raw_start.to_string(), id),
        None => {
            let id = format!("kobo_p_{}", index);
            (insert_attribute(raw_start, "id", &id), id)
        }
    };

    // Runs inside inline elements are wrapped in place, so the markup around
    // them is kept and the span texts concatenate to the paragraph text.
    let mut span_count = 0usize;
    for piece in pieces {
        match piece {
            Piece::Text { raw, .. } if !raw.is_empty() => {
                for fragment in split_sentences(raw) {
                    span_count += 1;
                    out.push_str(&kobo_span(&format!("{}-{}", paragraph_id, span_count), fragment));
                }
            }
            other => out.push_str(other.raw()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_sentences() {
        assert_eq!(split_sentences("Hi. Bye!"), vec!["Hi.", " Bye!"]);
        assert_eq!(split_sentences("Wait... what?! ok"), vec!["Wait...", " what?!", " ok"]);
        assert_eq!(split_sentences("Hi. "), vec!["Hi. "]);
        assert_eq!(split_sentences("no punctuation"), vec!["no punctuation"]);
        assert_eq!(split_sentences("   "), vec!["   "]);
    }

    #[test]
    fn test_paragraph_split_into_spans() -> Result<()> {
        let doc = "<html><body><p>Hi. Bye!</p></body></html>";
        let out = transform_content_document(doc)?;
        assert_eq!(
            out,
            "<html xmlns:kobo=\"http://ns.kobo.com/1.0\"><body><p id=\"kobo_p_0\">\
             <span class=\"koboSpan\" id=\"kobo_p_0-1\">Hi.</span>\
             <span class=\"koboSpan\" id=\"kobo_p_0-2\"> Bye!</span></p></body></html>"
        );
        Ok(())
    }

    #[test]
    fn test_nested_markup_and_entities_are_preserved() -> Result<()> {
        let doc = "<html><body><p id=\"a\">Tom &amp; Jerry. <em>Run!</em> Now.</p></body></html>";
        let out = transform_content_document(doc)?;
        assert!(out.contains("<span class=\"koboSpan\" id=\"a-1\">Tom &amp; Jerry. </span>"));
        assert!(out.contains("<em><span class=\"koboSpan\" id=\"a-2\">Run!</span></em>"));
        assert!(out.contains("<span class=\"koboSpan\" id=\"a-3\"> Now.</span>"));
        Ok(())
    }

    fn span_texts(doc: &str) -> String {
        let span = Regex::new(r#"<span class="koboSpan" id="[^"]*">([^<]*)</span>"#).unwrap();
        span.captures_iter(doc).map(|c| c[1].to_string()).collect()
    }

    #[test]
    fn test_nested_text_is_spanned() -> Result<()> {
        let doc = "<html><body><p>Tom. <em>Run!</em> Now.</p><p><b>Only bold.</b></p></body></html>";
        let out = transform_content_document(doc)?;
        assert_eq!(span_texts(&out), "Tom. Run! Now.Only bold.");
        assert!(out.contains(
            "<p id=\"kobo_p_1\"><b><span class=\"koboSpan\" id=\"kobo_p_1-1\">Only bold.</span></b></p>"
        ));
        assert!(out.contains("<em><span class=\"koboSpan\" id=\"kobo_p_0-2\">Run!</span></em>"));
        assert_eq!(transform_content_document(&out)?, out);
        Ok(())
    }

    #[test]
    fn test_images_and_idempotence() -> Result<()> {
        let doc = "<html><body><div class=\"image\"><img src=\"a.jpg\" alt=\"\"/></div></body></html>";
        let once = transform_content_document(doc)?;
        assert!(once.contains("<div class=\"image\" id=\"kobo_img_0\">"));
        assert!(once.contains("<span class=\"koboSpan\" id=\"kobo.img.0.1\"><img src=\"a.jpg\" alt=\"\"/></span>"));
        assert_eq!(transform_content_document(&once)?, once);
        Ok(())
    }

    #[test]
    fn test_nav_anchors_wrapped() -> Result<()> {
        let doc = "<html><body><nav><ol><li><a href=\"c.xhtml\">Chapter 1</a></li></ol></nav></body></html>";
        let out = transform_nav_document(doc)?;
        assert!(out.contains("<a href=\"c.xhtml\"><span class=\"koboSpan\" id=\"kobo.toc.1\">Chapter 1</span></a>"));
        assert_eq!(transform_nav_document(&out)?, out);
        Ok(())
    }
}
