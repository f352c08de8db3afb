//! # Message classification.
//!
//! Three gates every message passes before destination resolution:
//! subject/sender screening, bounce handling and auto-generated
//! detection. Each one can terminate the run.

use anyhow::{Context as _, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Config;
use crate::constants::{EMAIL_KEY_LEN, HARD_BOUNCE_SCORE, SOFT_BOUNCE_SCORE};
use crate::context::Context;
use crate::error::ProcessingError;
use crate::headerdef::HeaderDef;
use crate::mimeparser::MimeMessage;
use crate::record::IncomingEmail;
use crate::tools::time;

/// VERP bounce address: `anything+verp-<32 hex>@domain`.
static VERP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+verp-([0-9a-f]{32})@").unwrap());

static PRECEDENCE_AUTO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(list|junk|bulk|auto_reply)$").unwrap());

static AUTOMATED_FROM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(mailer-daemon|postmaster|noreply)@").unwrap());

/// Subject screening and sender screening.
///
/// Runs before any record is created: screened mail must leave no trace.
pub async fn screen(context: &Context, mime: &MimeMessage) -> Result<(), ProcessingError> {
    if let Some(pattern) = context.get_config(Config::IgnoredEmailSubjects).await? {
        if !pattern.is_empty() {
            let re = context.compiled_regex(&pattern)?;
            if re.is_match(&mime.subject) {
                return Err(ProcessingError::ScreenedEmail(format!(
                    "subject {:?} matches ignore pattern",
                    mime.subject
                )));
            }
        }
    }
    if !mime.from_addr.is_empty()
        && context
            .forum
            .should_block(&mime.from_addr)
            .await
            .context("screening policy failed")?
    {
        return Err(ProcessingError::ScreenedEmail(format!(
            "sender {} is blocked",
            mime.from_addr
        )));
    }
    Ok(())
}

/// Whether the message is a delivery failure notification.
pub fn is_bounce(mime: &MimeMessage) -> bool {
    mime.has_bounce_markers() || verp_key(mime).is_some()
}

/// Extracts the VERP bounce key from the destination addresses, if any.
pub fn verp_key(mime: &MimeMessage) -> Option<String> {
    for addr in &mime.recipients {
        if let Some(captures) = VERP_RE.captures(addr) {
            let key = captures.get(1)?.as_str();
            debug_assert_eq!(key.len(), EMAIL_KEY_LEN);
            return Some(key.to_string());
        }
    }
    None
}

/// Records a bounce: flags the record and the delivery-log entry and
/// scores the sender. The caller ends the run with `BouncedEmail`.
pub async fn handle_bounce(
    context: &Context,
    mime: &MimeMessage,
    record: &mut IncomingEmail,
    auto_generated: bool,
) -> Result<(), ProcessingError> {
    record.set_bounced(context).await?;

    if let Some(key) = verp_key(mime) {
        if let Some(entry) = context
            .forum
            .email_log_by_bounce_key(&key)
            .await
            .context("delivery-log lookup failed")?
        {
            context
                .forum
                .mark_email_log_bounced(entry.id)
                .await
                .context("could not mark delivery-log entry bounced")?;
            let weight = bounce_weight(mime, auto_generated);
            register_bounce(context, &entry.to_address, weight).await?;
        } else {
            info!(context, "VERP key {key} has no delivery-log entry");
        }
    }

    Ok(())
}

/// Soft (4.x.x) bounces weigh 1, hard (5.x.x) bounces weigh 2. Without a
/// status code, auto-generated reports count as hard.
fn bounce_weight(mime: &MimeMessage, auto_generated: bool) -> i64 {
    match mime
        .delivery_status
        .as_ref()
        .and_then(|ds| ds.status.as_deref())
    {
        Some(code) if code.starts_with("4.") => SOFT_BOUNCE_SCORE,
        Some(code) if code.starts_with("5.") => HARD_BOUNCE_SCORE,
        Some(_) => SOFT_BOUNCE_SCORE,
        None if auto_generated => HARD_BOUNCE_SCORE,
        None => SOFT_BOUNCE_SCORE,
    }
}

/// Adds `weight` to the sender's windowed bounce score.
///
/// At most one increment is counted per sender per calendar day; both the
/// day key and the score live in the expiring `kv` table and are updated
/// in one transaction, so concurrent bounces cannot double-count. When
/// the score crosses the configured threshold, mail delivery to the
/// address is revoked and the action is audit-logged.
pub async fn register_bounce(
    context: &Context,
    addr: &str,
    weight: i64,
) -> Result<(), ProcessingError> {
    let addr = crate::tools::addr_normalize(addr);
    let window_days = context.get_config_int(Config::BounceScoreWindowDays).await?;
    let threshold = context.get_config_int(Config::BounceScoreThreshold).await?;

    let day = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let dedupe_key = format!("bounce_day:{addr}:{day}");
    let score_key = format!("bounce_score:{addr}");
    let now = time();
    let score_expiry = now + window_days * 86_400;
    // Day keys only need to survive the calendar day, plus slack for
    // clock skew between workers.
    let day_expiry = now + 2 * 86_400;

    let new_score = context
        .sql
        .transaction(move |transaction| {
            transaction.execute("DELETE FROM kv WHERE expires < ?", (now,))?;

            let already_counted: i64 = transaction.query_row(
                "SELECT COUNT(*) FROM kv WHERE key=?",
                (&dedupe_key,),
                |row| row.get(0),
            )?;
            if already_counted > 0 {
                return Ok(None);
            }
            transaction.execute(
                "INSERT INTO kv (key, value, expires) VALUES (?, '1', ?)",
                (&dedupe_key, day_expiry),
            )?;

            let old_score: i64 = transaction
                .query_row("SELECT value FROM kv WHERE key=?", (&score_key,), |row| {
                    row.get::<_, String>(0)
                })
                .map(|s| s.parse().unwrap_or(0))
                .unwrap_or(0);
            let new_score = old_score + weight;
            transaction.execute(
                "INSERT INTO kv (key, value, expires) VALUES (?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value, expires=excluded.expires",
                (&score_key, new_score.to_string(), score_expiry),
            )?;
            Ok(Some(new_score))
        })
        .await?;

    let Some(score) = new_score else {
        info!(context, "bounce for {addr} already counted today");
        return Ok(());
    };

    context.emit_event(crate::EventType::BounceRegistered {
        addr: addr.clone(),
        score,
    });
    info!(context, "bounce score for {addr} is now {score}");

    if score >= threshold {
        context
            .forum
            .revoke_email(&addr)
            .await
            .context("could not revoke mail delivery")?;
        warn!(
            context,
            "revoked mail delivery to {addr}: bounce score {score} >= {threshold}"
        );
        context.emit_event(crate::EventType::SenderMailRevoked { addr, score });
    }
    Ok(())
}

/// Whether the message is machine-generated.
///
/// Allow-listed senders are never treated as auto-generated.
pub async fn is_auto_generated(context: &Context, mime: &MimeMessage) -> Result<bool> {
    if let Some(allowlist) = context.get_config(Config::AutoGeneratedAllowlist).await? {
        if allowlist
            .split('|')
            .any(|allowed| !allowed.is_empty() && crate::tools::addr_cmp(allowed, &mime.from_addr))
        {
            return Ok(false);
        }
    }

    if let Some(precedence) = mime.get_header(HeaderDef::Precedence) {
        if PRECEDENCE_AUTO_RE.is_match(precedence.trim()) {
            return Ok(true);
        }
    }
    if AUTOMATED_FROM_RE.is_match(&mime.from_addr) {
        return Ok(true);
    }
    if let Some(auto_submitted) = mime.get_header(HeaderDef::AutoSubmitted) {
        if !auto_submitted.trim().eq_ignore_ascii_case("no") {
            return Ok(true);
        }
    }
    if mime.get_header(HeaderDef::XAutoResponseSuppress).is_some()
        || mime.get_header(HeaderDef::XAutoreply).is_some()
    {
        return Ok(true);
    }
    // Mailing-list traffic must not spawn forum content either.
    if mime.get_header(HeaderDef::ListId).is_some()
        || mime.get_header(HeaderDef::ListUnsubscribe).is_some()
    {
        return Ok(true);
    }
    Ok(false)
}

/// Flags the record and decides whether auto-generated mail ends the run.
pub async fn check_auto_generated(
    context: &Context,
    mime: &MimeMessage,
    record: &mut IncomingEmail,
) -> Result<bool, ProcessingError> {
    if !is_auto_generated(context, mime).await? {
        return Ok(false);
    }
    record.set_auto_generated(context).await?;

    if mime.is_reply_to_auto_generated() {
        return Err(ProcessingError::AutoGeneratedEmailReply);
    }
    if context
        .get_config_bool(Config::BlockAutoGeneratedEmails)
        .await?
    {
        return Err(ProcessingError::AutoGeneratedEmail);
    }
    Ok(true)
}
