//! JATS full-text XML → title / abstract / body sections.
//!
//! Only three regions matter: the first `article-title`, every `abstract`
//! and every `body`. All text inside them (including nested markup such as
//! `<italic>` or `<sec>`) is concatenated and whitespace-collapsed.

use quick_xml::events::{BytesText, Event};
use quick_xml::Reader;
use rumina_common::{Result, RuminaError};
use rumina_verify::normalise::{collapse_whitespace, unescape_entities};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JatsSections {
    pub title: String,
    pub abstract_text: String,
    pub body: String,
}

pub fn parse_jats(xml: &str) -> Result<JatsSections> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut title = Vec::new();
    let mut abstract_parts = Vec::new();
    let mut body = Vec::new();

    // State machine
    let mut in_title      = false;
    let mut title_done    = false;
    let mut abstract_depth = 0usize;
    let mut body_depth     = 0usize;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"article-title" if !title_done => in_title = true,
                b"abstract" => abstract_depth += 1,
                b"body"     => body_depth += 1,
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"article-title" if in_title => {
                    in_title = false;
                    title_done = true;
                }
                b"abstract" => abstract_depth = abstract_depth.saturating_sub(1),
                b"body"     => body_depth = body_depth.saturating_sub(1),
                _ => {}
            },
            Ok(Event::Text(ref e)) => {
                let text = decode_text(e);
                push_text(&text, in_title, abstract_depth, body_depth, &mut title, &mut abstract_parts, &mut body);
            }
            Ok(Event::CData(e)) => {
                let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                push_text(&text, in_title, abstract_depth, body_depth, &mut title, &mut abstract_parts, &mut body);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(RuminaError::Xml(format!(
                    "at byte {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(JatsSections {
        title: collapse_whitespace(&title.join(" ")),
        abstract_text: collapse_whitespace(&abstract_parts.join(" ")),
        body: collapse_whitespace(&body.join(" ")),
    })
}

/// XML-escaped text; HTML named entities that XML does not define are
/// resolved by the looser unescaper instead of failing the document.
fn decode_text(e: &BytesText<'_>) -> String {
    match e.unescape() {
        Ok(text) => text.into_owned(),
        Err(_) => {
            let raw = String::from_utf8_lossy(e);
            unescape_entities(&raw).into_owned()
        }
    }
}

fn push_text(
    text: &str,
    in_title: bool,
    abstract_depth: usize,
    body_depth: usize,
    title: &mut Vec<String>,
    abstract_parts: &mut Vec<String>,
    body: &mut Vec<String>,
) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if in_title       { title.push(text.to_string()); }
    if abstract_depth > 0 { abstract_parts.push(text.to_string()); }
    if body_depth > 0     { body.push(text.to_string()); }
}
