//! # MIME message parsing module.

use std::collections::HashMap;

use mailparse::{addrparse_header, DispositionType, MailAddr, MailHeader, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::constants::{AUTO_GENERATED_ID_TAG, DESIRED_TEXT_LEN, NO_SUBJECT};
use crate::context::Context;
use crate::error::ProcessingError;
use crate::headerdef::{HeaderDef, HeaderDefMap};
use crate::tools::{addr_normalize, generated_msgid, truncate};

/// Permissive `Name <addr>` extraction used when structured parsing of the
/// From header fails. Real-world senders produce enough malformed From
/// lines that rejecting them outright would lose legitimate mail.
static FROM_FALLBACK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(?:"?\s*(?P<name>[^"<@]{1,80}?)\s*"?\s*<)?\s*(?P<addr>[a-z0-9][a-z0-9._%+=-]*@[a-z0-9][a-z0-9.-]+)\s*>?"#)
        .unwrap()
});

/// A parsed incoming message.
///
/// This wraps the raw mail and exposes exactly what the pipeline needs,
/// without side effects: sender, subject, merged destination addresses,
/// thread references, body candidates and attachments. It is created with
/// [`MimeMessage::from_bytes`].
#[derive(Debug)]
pub struct MimeMessage {
    /// Lowercased header map; first occurrence wins.
    headers: HashMap<String, String>,

    /// Unique identifier: the Message-Id header, or a hash-derived
    /// synthetic id when the header is missing.
    pub message_id: String,

    /// Normalized sender address.
    pub from_addr: String,

    /// Sender display name as given, if any.
    pub from_display_name: Option<String>,

    /// Destination addresses merged from To, Cc, X-Forwarded-To and
    /// Delivered-To, in header order, normalized and deduplicated.
    pub recipients: Vec<String>,

    /// Addresses from the To header only, normalized.
    pub to_addrs: Vec<String>,

    /// Addresses from the Cc header only, normalized.
    pub cc_addrs: Vec<String>,

    /// Addresses from a Bcc header, normalized. Usually absent on received
    /// mail, but some forwarding setups leave it in; co-recipient
    /// invitations consider it.
    pub bcc_addrs: Vec<String>,

    /// Subject, defaulted when the header is absent.
    pub subject: String,

    /// Sent timestamp from the Date header, 0 when unusable.
    pub date: i64,

    /// Thread references: In-Reply-To first, then References nearest
    /// ancestor first, deduplicated.
    pub references: Vec<String>,

    /// First usable text/plain body.
    pub text_part: Option<String>,

    /// First usable text/html body.
    pub html_part: Option<String>,

    /// File attachments in MIME order.
    pub attachments: Vec<Attachment>,

    /// Machine-readable block of a delivery failure report, if any.
    pub delivery_status: Option<DeliveryStatus>,
}

/// One MIME attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Attachment {
    /// Whether the attachment is an image, by declared content type.
    pub fn is_image(&self) -> bool {
        self.mime_type
            .parse::<mime::Mime>()
            .map(|m| m.type_() == mime::IMAGE)
            .unwrap_or(false)
    }
}

/// Parsed `message/delivery-status` fields (RFC 3464).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStatus {
    pub action: Option<String>,
    /// Enhanced status code, e.g. "5.1.1".
    pub status: Option<String>,
    pub final_recipient: Option<String>,
    pub diagnostic_code: Option<String>,
}

impl MimeMessage {
    /// Parses a raw message.
    ///
    /// Fails with [`ProcessingError::EmptyMessage`] when the input is blank
    /// or so broken that no headers can be recovered.
    pub fn from_bytes(context: &Context, raw: &[u8]) -> Result<Self, ProcessingError> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ProcessingError::EmptyMessage("blank input".to_string()));
        }
        let mail = mailparse::parse_mail(raw)
            .map_err(|e| ProcessingError::EmptyMessage(format!("unparseable mail: {e}")))?;

        let mut headers = HashMap::new();
        merge_headers(&mut headers, &mail.headers);

        let message_id = headers
            .get("message-id")
            .and_then(|v| parse_message_id(v))
            .unwrap_or_else(|| generated_msgid(raw));

        let (from_addr, from_display_name) = match parse_from(&mail.headers) {
            Some(from) => from,
            None => {
                warn!(context, "could not parse From header, sender unknown");
                (String::new(), None)
            }
        };

        let (recipients, to_addrs, cc_addrs, bcc_addrs) = collect_recipients(&mail.headers);

        let subject = mail
            .headers
            .get_header_value(HeaderDef::Subject)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| NO_SUBJECT.to_string());

        let date = mail
            .headers
            .get_header_value(HeaderDef::Date)
            .and_then(|v| mailparse::dateparse(&v).ok())
            .unwrap_or_default();

        let mut references = Vec::new();
        if let Some(value) = mail.headers.get_header_value(HeaderDef::InReplyTo) {
            references.extend(parse_message_ids(&value));
        }
        if let Some(value) = mail.headers.get_header_value(HeaderDef::References) {
            // References lists ancestors oldest first; flip so the direct
            // parent is checked before the thread root.
            references.extend(parse_message_ids(&value).into_iter().rev());
        }
        let references = dedup_preserving_order(references);

        let mut parser = MimeMessage {
            headers,
            message_id,
            from_addr,
            from_display_name,
            recipients,
            to_addrs,
            cc_addrs,
            bcc_addrs,
            subject,
            date,
            references,
            text_part: None,
            html_part: None,
            attachments: Vec::new(),
            delivery_status: None,
        };
        parser.parse_mime_recursive(context, &mail);

        Ok(parser)
    }

    /// Returns a top-level header value.
    pub fn get_header(&self, headerdef: HeaderDef) -> Option<&str> {
        self.headers
            .get(&headerdef.get_headername())
            .map(|s| s.as_str())
    }

    /// Whether this message replies to one of our own auto-generated
    /// notices; their Message-Ids carry a recognizable tag.
    pub fn is_reply_to_auto_generated(&self) -> bool {
        self.references
            .iter()
            .any(|id| id.starts_with(AUTO_GENERATED_ID_TAG))
    }

    /// Whether the message carries standard bounce markers.
    pub fn has_bounce_markers(&self) -> bool {
        if self.delivery_status.is_some() {
            return true;
        }
        if let Some(return_path) = self.get_header(HeaderDef::ReturnPath) {
            if return_path.trim() == "<>" {
                return true;
            }
        }
        // Exim and friends list the failed addresses instead of attaching
        // a machine-readable report.
        if self.get_header(HeaderDef::XFailedRecipients).is_some() {
            return true;
        }
        // Some providers do not send standard delivery-status reports.
        let from = self.from_addr.to_ascii_lowercase();
        from.contains("mailer-daemon") || from.contains("mail-daemon")
    }

    fn parse_mime_recursive(&mut self, context: &Context, mail: &ParsedMail<'_>) {
        let mimetype = mail.ctype.mimetype.to_lowercase();

        if mimetype.starts_with("multipart") {
            if mail.ctype.params.get("boundary").is_none() {
                self.add_single_part(context, mail);
                return;
            }
            self.handle_multiple(context, mail, &mimetype);
        } else if mimetype == "message/rfc822" {
            let Ok(raw) = mail.get_body_raw() else { return };
            if raw.iter().all(|b| b.is_ascii_whitespace()) {
                return;
            }
            match mailparse::parse_mail(&raw) {
                Ok(inner) => self.parse_mime_recursive(context, &inner),
                Err(err) => warn!(context, "ignoring broken nested message: {err}"),
            }
        } else {
            self.add_single_part(context, mail);
        }
    }

    fn handle_multiple(&mut self, context: &Context, mail: &ParsedMail<'_>, mimetype: &str) {
        match mimetype {
            "multipart/signed" => {
                // RFC 1847: the first part is the signed content, the
                // second the signature. We take the content and skip the
                // signature; verification is not this pipeline's job.
                if let Some(first) = mail.subparts.first() {
                    self.parse_mime_recursive(context, first);
                }
            }
            "multipart/report" => {
                // RFC 6522: first part for humans, second for machines.
                let report_type = mail.ctype.params.get("report-type").map(|s| s.as_str());
                // Some providers forget the report-type; assume
                // delivery-status then.
                if matches!(report_type, Some("delivery-status") | None) {
                    if let Some(status_part) = mail
                        .subparts
                        .iter()
                        .find(|p| p.ctype.mimetype.to_lowercase().contains("delivery-status"))
                    {
                        self.delivery_status = parse_delivery_status(status_part);
                    }
                }
                for part in &mail.subparts {
                    self.parse_mime_recursive(context, part);
                }
            }
            _ => {
                // multipart/alternative included: walk everything, the
                // text and html slots are first-wins so true alternatives
                // do not double up.
                for part in &mail.subparts {
                    self.parse_mime_recursive(context, part);
                }
            }
        }
    }

    fn add_single_part(&mut self, context: &Context, mail: &ParsedMail<'_>) {
        let mimetype = mail.ctype.mimetype.to_lowercase();

        if mimetype.contains("delivery-status") {
            // Already consumed through the enclosing report, or a bare
            // status part; either way it is no body candidate.
            if self.delivery_status.is_none() {
                self.delivery_status = parse_delivery_status(mail);
            }
            return;
        }

        if let Some(filename) = get_attachment_filename(mail) {
            match mail.get_body_raw() {
                Ok(data) if !data.is_empty() => {
                    self.attachments.push(Attachment {
                        filename,
                        mime_type: mimetype,
                        data,
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(context, "could not decode attachment {filename:?}: {err}");
                }
            }
            return;
        }

        match mimetype.as_str() {
            "text/plain" => {
                if self.text_part.is_none() {
                    self.text_part = decode_text_part(mail);
                }
            }
            "text/html" => {
                if self.html_part.is_none() {
                    self.html_part = decode_text_part(mail);
                }
            }
            _ => {
                // Unnamed non-text parts (signatures, calendar invites)
                // produce no forum content.
            }
        }
    }
}

fn merge_headers(headers: &mut HashMap<String, String>, fields: &[MailHeader<'_>]) {
    for field in fields {
        let key = field.get_key().to_lowercase();
        // First occurrence wins; duplicated headers are a smuggling vector.
        headers
            .entry(key)
            .or_insert_with(|| field.get_value().trim().to_string());
    }
}

fn parse_from(headers: &[MailHeader<'_>]) -> Option<(String, Option<String>)> {
    let from_header = headers
        .iter()
        .find(|h| h.get_key().eq_ignore_ascii_case("from"))?;

    if let Ok(list) = addrparse_header(from_header) {
        for addr in list.iter() {
            match addr {
                MailAddr::Single(info) => {
                    return Some((
                        addr_normalize(&info.addr),
                        info.display_name.clone().filter(|n| !n.trim().is_empty()),
                    ));
                }
                MailAddr::Group(group) => {
                    if let Some(info) = group.addrs.first() {
                        return Some((
                            addr_normalize(&info.addr),
                            info.display_name.clone().filter(|n| !n.trim().is_empty()),
                        ));
                    }
                }
            }
        }
    }

    // Structured parsing failed; salvage what we can.
    let value = from_header.get_value();
    let captures = FROM_FALLBACK_RE.captures(&value)?;
    let addr = addr_normalize(captures.name("addr")?.as_str());
    let name = captures
        .name("name")
        .map(|m| m.as_str().trim().to_string())
        .filter(|n| !n.is_empty());
    Some((addr, name))
}

fn collect_recipients(
    headers: &[MailHeader<'_>],
) -> (Vec<String>, Vec<String>, Vec<String>, Vec<String>) {
    let mut merged = Vec::new();
    let mut to_addrs = Vec::new();
    let mut cc_addrs = Vec::new();
    let mut bcc_addrs = Vec::new();

    for header in headers {
        let key = header.get_key().to_lowercase();
        match key.as_str() {
            "to" | "cc" | "x-forwarded-to" | "delivered-to" => {
                for addr in addresses_from_header(header) {
                    match key.as_str() {
                        "to" => to_addrs.push(addr.clone()),
                        "cc" => cc_addrs.push(addr.clone()),
                        _ => {}
                    }
                    merged.push(addr);
                }
            }
            // Bcc never joins the destination-resolution list.
            "bcc" => bcc_addrs.extend(addresses_from_header(header)),
            _ => {}
        }
    }

    (
        dedup_preserving_order(merged),
        dedup_preserving_order(to_addrs),
        dedup_preserving_order(cc_addrs),
        dedup_preserving_order(bcc_addrs),
    )
}

fn addresses_from_header(header: &MailHeader<'_>) -> Vec<String> {
    if let Ok(list) = addrparse_header(header) {
        let mut res = Vec::new();
        for addr in list.iter() {
            match addr {
                MailAddr::Single(info) => res.push(addr_normalize(&info.addr)),
                MailAddr::Group(group) => {
                    res.extend(group.addrs.iter().map(|info| addr_normalize(&info.addr)))
                }
            }
        }
        if !res.is_empty() {
            return res;
        }
    }
    // Bare or malformed lists, e.g. a Delivered-To without angle brackets.
    let value = header.get_value();
    value
        .split(',')
        .filter_map(|part| FROM_FALLBACK_RE.captures(part))
        .filter_map(|c| c.name("addr").map(|m| addr_normalize(m.as_str())))
        .collect()
}

fn dedup_preserving_order(addrs: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    addrs
        .into_iter()
        .filter(|addr| !addr.is_empty() && seen.insert(addr.clone()))
        .collect()
}

/// Parses a list of message ids as used in References headers.
pub(crate) fn parse_message_ids(ids: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut chars = ids.char_indices();
    while let Some((start, c)) = chars.next() {
        if c != '<' {
            continue;
        }
        let rest = &ids[start + 1..];
        if let Some(end) = rest.find('>') {
            let id = rest[..end].trim();
            if !id.is_empty() {
                result.push(id.to_string());
            }
        }
    }
    if result.is_empty() {
        // Not everyone brackets their ids.
        result.extend(
            ids.split_ascii_whitespace()
                .filter(|s| s.contains('@'))
                .map(|s| s.to_string()),
        );
    }
    result
}

/// Extracts a single message id, stripping angle brackets.
pub(crate) fn parse_message_id(id: &str) -> Option<String> {
    parse_message_ids(id).into_iter().next()
}

fn get_attachment_filename(mail: &ParsedMail<'_>) -> Option<String> {
    let disposition = mail.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| mail.ctype.params.get("name"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    match disposition.disposition {
        DispositionType::Attachment => {
            Some(filename.unwrap_or_else(|| "attachment".to_string()))
        }
        // Inline parts count as attachments only when they are named
        // files rather than body candidates.
        _ => filename.filter(|_| {
            let mimetype = mail.ctype.mimetype.to_lowercase();
            mimetype != "text/plain" && mimetype != "text/html"
        }),
    }
}

/// Decodes one text part: declared charset, then UTF-8, then Latin-1.
/// A part that cannot be turned into usable text is treated as absent.
fn decode_text_part(mail: &ParsedMail<'_>) -> Option<String> {
    let raw = mail.get_body_raw().ok()?;
    if raw.is_empty() {
        return None;
    }

    let declared = mail.ctype.charset.to_lowercase();
    let text = decode_with_charset(&raw, &declared)
        .or_else(|| String::from_utf8(raw.clone()).ok())
        .unwrap_or_else(|| raw.iter().map(|&b| b as char).collect());

    if text.contains('\0') || text.trim().is_empty() {
        return None;
    }
    if text.chars().count() > DESIRED_TEXT_LEN {
        return Some(truncate(&text, DESIRED_TEXT_LEN).to_string());
    }
    Some(text)
}

fn decode_with_charset(raw: &[u8], label: &str) -> Option<String> {
    if label.is_empty() {
        return None;
    }
    let charset = charset::Charset::for_label(label.as_bytes())?;
    let (text, _, malformed) = charset.decode(raw);
    if malformed {
        return None;
    }
    Some(text.into_owned())
}

static DSN_ACTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^Action:[ \t]*([a-z-]+)").unwrap());
static DSN_STATUS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^Status:[ \t]*([0-9]\.[0-9]{1,3}\.[0-9]{1,3})").unwrap());
static DSN_RECIPIENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^Final-Recipient:[ \t]*rfc822;[ \t]*(\S+)").unwrap());
static DSN_DIAGNOSTIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^Diagnostic-Code:[ \t]*(.+)$").unwrap());

/// Pulls the interesting fields out of a `message/delivery-status` part.
///
/// The part consists of several header blocks (per-message, then one per
/// recipient); a line-wise scan over the whole part sidesteps the block
/// structure and takes the first occurrence of each field.
fn parse_delivery_status(mail: &ParsedMail<'_>) -> Option<DeliveryStatus> {
    let raw = mail.get_body_raw().ok()?;
    let text = String::from_utf8_lossy(&raw);

    let capture = |re: &Regex| {
        re.captures(&text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
    };

    let status = DeliveryStatus {
        action: capture(&DSN_ACTION_RE),
        status: capture(&DSN_STATUS_RE),
        final_recipient: capture(&DSN_RECIPIENT_RE),
        diagnostic_code: capture(&DSN_DIAGNOSTIC_RE),
    };
    if status == DeliveryStatus::default() {
        None
    } else {
        Some(status)
    }
}
