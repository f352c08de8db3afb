//! De-HTML.
//!
//! Turns the HTML body candidate into the plain markdown-ish text the
//! forum stores. Quote containers become `>`-prefixed lines so the reply
//! trimmer treats them like plain-text quotes, and inline images become
//! `[image: <name>]` placeholders for the attachment handler to resolve.

use once_cell::sync::Lazy;
use quick_xml::events::{BytesCData, BytesEnd, BytesRef, BytesStart, BytesText, Event};

static LINE_RE: Lazy<regex::Regex> = Lazy::new(|| regex::Regex::new(r"(\r?\n)+").unwrap());

struct Dehtml {
    strbuilder: String,
    add_text: AddText,
    last_href: Option<String>,
    /// `<blockquote>` nesting depth.
    blockquotes: i32,
    /// Some providers wrap a quote in `<div name="quote">`. After such a
    /// div, this count is increased at each `<div>` and decreased at each
    /// `</div>`, so we know when the quote ends.
    divs_since_quote_div: Option<i32>,
}

impl Dehtml {
    fn line_prefix(&self) -> &str {
        if self.blockquotes > 0 || self.divs_since_quote_div.is_some() {
            "> "
        } else {
            ""
        }
    }

    fn append_block_break(&mut self) {
        self.strbuilder += &("\n\n".to_owned() + self.line_prefix());
        self.add_text = AddText::YesRemoveLineEnds;
    }
}

#[derive(Debug, PartialEq)]
enum AddText {
    No,
    YesRemoveLineEnds,
    YesPreserveLineEnds,
}

// dehtml() returns way too many newlines; however, an optimisation on this
// issue is not needed as the newlines are typically removed in further
// processing by the caller
pub fn dehtml(buf: &str) -> Option<String> {
    let s = dehtml_quick_xml(buf);
    if !s.trim().is_empty() {
        return Some(s);
    }
    let s = dehtml_manually(buf);
    if !s.trim().is_empty() {
        return Some(s);
    }
    None
}

fn dehtml_quick_xml(buf: &str) -> String {
    let buf = buf.trim().trim_start_matches("<!doctype html>");

    let mut dehtml = Dehtml {
        strbuilder: String::with_capacity(buf.len()),
        add_text: AddText::YesRemoveLineEnds,
        last_href: None,
        blockquotes: 0,
        divs_since_quote_div: None,
    };

    let mut reader = quick_xml::Reader::from_str(buf);
    reader.config_mut().check_end_names = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => dehtml_starttag_cb(e, &mut dehtml),
            Ok(Event::End(ref e)) => dehtml_endtag_cb(e, &mut dehtml),
            Ok(Event::Text(ref e)) => dehtml_text_cb(e, &mut dehtml),
            Ok(Event::GeneralRef(ref e)) => dehtml_generalref_cb(e, &mut dehtml),
            Ok(Event::CData(ref e)) => dehtml_cdata_cb(e, &mut dehtml),
            Ok(Event::Empty(ref e)) => {
                // Handle empty tags as a start tag immediately followed by
                // an end tag, so `<br/>` works like `<br></br>`.
                dehtml_starttag_cb(e, &mut dehtml);
                dehtml_endtag_cb(
                    &BytesEnd::new(String::from_utf8_lossy(e.name().as_ref()).into_owned()),
                    &mut dehtml,
                );
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => (),
        }
    }

    dehtml.strbuilder
}

fn append_decoded_text(raw: &[u8], dehtml: &mut Dehtml) {
    let last_added = escaper::decode_html_buf_sloppy(raw).unwrap_or_default();

    if dehtml.add_text == AddText::YesRemoveLineEnds {
        dehtml.strbuilder += LINE_RE.replace_all(&last_added, "\r").as_ref();
    } else {
        dehtml.strbuilder += LINE_RE
            .replace_all(&last_added, format!("\n{}", dehtml.line_prefix()).as_str())
            .as_ref();
    }
}

fn dehtml_text_cb(event: &BytesText, dehtml: &mut Dehtml) {
    if dehtml.add_text != AddText::No {
        append_decoded_text(event, dehtml);
    }
}

fn dehtml_cdata_cb(event: &BytesCData, dehtml: &mut Dehtml) {
    if dehtml.add_text != AddText::No {
        append_decoded_text(event, dehtml);
    }
}

/// Entity references arrive as their own events; decode them back into
/// the characters they stand for.
fn dehtml_generalref_cb(event: &BytesRef, dehtml: &mut Dehtml) {
    if dehtml.add_text != AddText::No {
        let entity = format!("&{};", String::from_utf8_lossy(event));
        dehtml.strbuilder += &escaper::decode_html_buf_sloppy(entity.as_bytes())
            .unwrap_or(entity.clone());
    }
}

fn dehtml_endtag_cb(event: &BytesEnd, dehtml: &mut Dehtml) {
    let tag = String::from_utf8_lossy(event.name().as_ref())
        .trim()
        .to_lowercase();

    match tag.as_str() {
        "p" | "table" | "td" | "style" | "script" | "title" | "pre" => {
            dehtml.append_block_break();
        }
        "blockquote" => {
            dehtml.blockquotes -= 1;
            dehtml.append_block_break();
        }
        "div" => {
            if let Some(ref mut divs) = dehtml.divs_since_quote_div {
                *divs -= 1;
                if *divs <= 0 {
                    dehtml.divs_since_quote_div = None;
                }
            }
            dehtml.append_block_break();
        }
        "a" => {
            if let Some(ref last_href) = dehtml.last_href.take() {
                dehtml.strbuilder += "](";
                dehtml.strbuilder += last_href;
                dehtml.strbuilder += ")";
            }
        }
        "b" | "strong" => {
            dehtml.strbuilder += "**";
        }
        "i" | "em" => {
            dehtml.strbuilder += "*";
        }
        _ => {}
    }
}

fn dehtml_starttag_cb(event: &BytesStart, dehtml: &mut Dehtml) {
    let tag = String::from_utf8_lossy(event.name().as_ref())
        .trim()
        .to_lowercase();

    match tag.as_str() {
        "p" | "table" | "td" => {
            dehtml.append_block_break();
        }
        "blockquote" => {
            dehtml.blockquotes += 1;
            dehtml.append_block_break();
        }
        "div" => {
            let is_quote_div = event.html_attributes().any(|r| {
                r.map(|a| a.value.as_ref() == &b"quote"[..]).unwrap_or(false)
            });
            if let Some(ref mut divs) = dehtml.divs_since_quote_div {
                *divs += 1;
            } else if is_quote_div {
                dehtml.divs_since_quote_div = Some(1);
            }
            dehtml.append_block_break();
        }
        "br" => {
            dehtml.strbuilder += &("\n".to_owned() + dehtml.line_prefix());
            dehtml.add_text = AddText::YesRemoveLineEnds;
        }
        "style" | "script" | "title" => {
            dehtml.add_text = AddText::No;
        }
        "pre" => {
            dehtml.strbuilder += &("\n\n".to_owned() + dehtml.line_prefix());
            dehtml.add_text = AddText::YesPreserveLineEnds;
        }
        "a" => {
            if let Some(href) = attr_value(event, "href") {
                if !href.is_empty() {
                    dehtml.last_href = Some(href);
                    dehtml.strbuilder += "[";
                }
            }
        }
        "img" => {
            // Render the placeholder the attachment handler later resolves
            // against uploaded files.
            let name = attr_value(event, "alt")
                .filter(|alt| !alt.trim().is_empty())
                .or_else(|| {
                    attr_value(event, "src").map(|src| {
                        src.rsplit(['/', '\\'])
                            .next()
                            .unwrap_or_default()
                            .to_string()
                    })
                })
                .unwrap_or_default();
            if !name.is_empty() {
                dehtml.strbuilder += &format!("[image: {name}]");
            }
        }
        "b" | "strong" => {
            dehtml.strbuilder += "**";
        }
        "i" | "em" => {
            dehtml.strbuilder += "*";
        }
        _ => {}
    }
}

fn attr_value(event: &BytesStart, name: &str) -> Option<String> {
    event
        .html_attributes()
        .filter_map(|attr| attr.ok())
        .find(|attr| {
            String::from_utf8_lossy(attr.key.as_ref())
                .trim()
                .eq_ignore_ascii_case(name)
        })
        .map(|attr| {
            escaper::decode_html_buf_sloppy(attr.value.as_ref())
                .unwrap_or_default()
                .trim()
                .to_string()
        })
}

fn dehtml_manually(buf: &str) -> String {
    // Just strip out everything between "<" and ">"
    let mut strbuilder = String::new();
    let mut show_next_chars = true;
    for c in buf.chars() {
        match c {
            '<' => show_next_chars = false,
            '>' => show_next_chars = true,
            _ => {
                if show_next_chars {
                    strbuilder.push(c)
                }
            }
        }
    }
    strbuilder
}
