//! Reply trimming.
//!
//! Strips quoted history and signatures from an incoming body and keeps
//! what was stripped: the elided remainder is reattached, collapsed, for
//! messages that end up in private conversations.
//!
//! All passes only shrink the retained region from one of its two ends,
//! so the retained text is always one contiguous run of lines and the
//! elided remainder is simply everything outside it.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::constants::PREVIOUS_DISCUSSION_MARKER;

static SIGNOFF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(Sent from my \S|Sent from Mail for |Get Outlook for )").unwrap());

/// Result of trimming one body.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrimmedBody {
    /// The author's own words.
    pub text: String,

    /// Everything removed: quotes, signatures, our own digest block.
    pub elided: String,
}

/// Trims quoted history and signatures from a message body.
pub fn simplify(mut input: String) -> TrimmedBody {
    input.retain(|c| c != '\r');
    let lines: Vec<&str> = input.split('\n').collect();

    let mut start = 0;
    let mut end = lines.len();

    cut_previous_discussion(&lines, &mut end);
    cut_message_footer(&lines, start, &mut end);
    cut_nonstandard_footer(&lines, start, &mut end);
    cut_signoff(&lines, start, &mut end);
    cut_bottom_quote(&lines, start, &mut end);
    cut_top_quote(&lines, &mut start, end);

    let text = render(&lines[start..end]);
    let mut elided_lines: Vec<&str> = Vec::new();
    elided_lines.extend(&lines[..start]);
    elided_lines.extend(&lines[end..]);
    let elided = render(&elided_lines);

    TrimmedBody { text, elided }
}

/// Cuts at the marker our own outbound digests place above quoted prior
/// discussion.
fn cut_previous_discussion(lines: &[&str], end: &mut usize) {
    for (ix, line) in lines.iter().enumerate().take(*end) {
        if line.trim() == PREVIOUS_DISCUSSION_MARKER {
            *end = ix;
            return;
        }
    }
}

/// Cuts the standard (RFC 3676, §4.3) footer if it is found.
fn cut_message_footer(lines: &[&str], start: usize, end: &mut usize) {
    for (ix, &line) in lines.iter().enumerate().take(*end).skip(start) {
        // quoted-printable may encode `-- ` to `-- =20` which is converted
        // back to `--  `
        match line {
            "-- " | "--  " => {
                *end = ix;
                return;
            }
            _ => (),
        }
    }
}

/// Cuts nonstandard rule-line footers.
fn cut_nonstandard_footer(lines: &[&str], start: usize, end: &mut usize) {
    for (ix, &line) in lines.iter().enumerate().take(*end).skip(start) {
        if line == "--"
            || line == "---"
            || line == "----"
            || line.starts_with("-----")
            || line.starts_with("_____")
            || line.starts_with("=====")
            || line.starts_with("*****")
            || line.starts_with("~~~~~")
        {
            *end = ix;
            return;
        }
    }
}

/// Cuts trailing mobile-client sign-offs ("Sent from my …").
fn cut_signoff(lines: &[&str], start: usize, end: &mut usize) {
    for (ix, &line) in lines.iter().enumerate().take(*end).skip(start) {
        if SIGNOFF_RE.is_match(line) {
            let only_trailer = lines[ix + 1..*end]
                .iter()
                .all(|l| is_empty_line(l) || is_plain_quote(l));
            if only_trailer {
                *end = ix;
                return;
            }
        }
    }
}

fn cut_bottom_quote(lines: &[&str], start: usize, end: &mut usize) {
    let mut last_quoted_line = None;
    for (l, line) in lines[start..*end].iter().enumerate().rev() {
        if is_plain_quote(line) {
            last_quoted_line = Some(l)
        } else if !is_empty_line(line) {
            break;
        }
    }
    if let Some(mut l_last) = last_quoted_line {
        if l_last > 1 && is_empty_line(lines[start + l_last - 1]) {
            l_last -= 1
        }
        if l_last > 1 && is_quoted_headline(lines[start + l_last - 1]) {
            l_last -= 1
        }
        *end = start + l_last;
    }
}

fn cut_top_quote(lines: &[&str], start: &mut usize, end: usize) {
    let mut last_quoted_line = None;
    let mut has_quoted_headline = false;
    for (l, line) in lines[*start..end].iter().enumerate() {
        if is_plain_quote(line) {
            last_quoted_line = Some(l)
        } else if !is_empty_line(line) {
            if is_quoted_headline(line) && !has_quoted_headline && last_quoted_line.is_none() {
                has_quoted_headline = true
            } else {
                // non-quoting line found
                break;
            }
        }
    }
    if let Some(last_quoted_line) = last_quoted_line {
        *start += last_quoted_line + 1;
    }
}

/// Re-creates a buffer from a line run: collapses blank runs to at most
/// one empty line, drops leading and trailing blanks.
fn render(lines: &[&str]) -> String {
    let mut ret = String::new();
    let mut pending_linebreaks = 0;
    let mut empty_body = true;
    for line in lines {
        if is_empty_line(line) {
            pending_linebreaks += 1
        } else {
            if !empty_body {
                if pending_linebreaks > 2 {
                    pending_linebreaks = 2
                }
                while 0 != pending_linebreaks {
                    ret += "\n";
                    pending_linebreaks -= 1
                }
            }
            ret += line.trim_end();
            empty_body = false;
            pending_linebreaks = 1
        }
    }
    ret
}

fn is_empty_line(buf: &str) -> bool {
    // Everything up to ' ' is considered whitespace here; mail bodies do
    // grow stray control characters.
    buf.chars().all(|c| c <= ' ')
}

fn is_quoted_headline(buf: &str) -> bool {
    // Catches "On 01.02.2016, xy@z wrote:" in its many localized shapes
    // when it is the line directly adjacent to a quote. Checking for an
    // address would fail for clients that show the display name only.
    buf.len() <= 80 && buf.ends_with(':')
}

fn is_plain_quote(buf: &str) -> bool {
    buf.starts_with('>')
}
