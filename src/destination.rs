//! # Destination resolution.
//!
//! Decides which forum action a message maps to. Order matters: thread
//! continuation beats everything, then the unsubscribe command, then the
//! destination addresses in header order.

use anyhow::{Context as _, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::Config;
use crate::context::Context;
use crate::error::ProcessingError;
use crate::forum::{Category, EmailLogEntry, Group, TopicState, User};
use crate::mimeparser::MimeMessage;
use crate::record;

static REPLY_KEY_PLACEHOLDER: &str = "%{reply_key}";

/// Resolved forum destination of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Reply into an existing topic.
    Reply {
        topic_id: i64,
        /// Post the reply refers to.
        post_id: i64,
    },
    /// New private conversation with a group.
    GroupInbox(Group),
    /// New topic in a category.
    CategoryInbox(Category),
    /// The sender wants out of notification mail.
    UnsubscribeCommand,
}

/// Resolves the destination for a classified message.
///
/// `trimmed_body` is consulted for the unsubscribe literal.
pub async fn resolve(
    context: &Context,
    mime: &MimeMessage,
    sender: &User,
    trimmed_body: &str,
) -> Result<Destination, ProcessingError> {
    // 1. Thread continuation: a reply to a message we have processed
    // before stays on that topic, whatever address it was sent to.
    if !mime.references.is_empty() {
        if let Some((topic_id, post_id)) =
            record::find_post_by_message_ids(context, &mime.references).await?
        {
            let destination = Destination::Reply { topic_id, post_id };
            check_topic(context, topic_id).await?;
            return Ok(destination);
        }
    }

    // 2. Unsubscribe command.
    if context.get_config_bool(Config::UnsubscribeViaEmail).await?
        && (is_unsubscribe_text(&mime.subject) || is_unsubscribe_text(trimmed_body))
    {
        return Ok(Destination::UnsubscribeCommand);
    }

    // 3. Address-based resolution, first hit in header order wins.
    for addr in &mime.recipients {
        if let Some(group) = context
            .forum
            .group_by_email(addr)
            .await
            .context("group lookup failed")?
        {
            return Ok(Destination::GroupInbox(group));
        }
        if let Some(category) = context
            .forum
            .category_by_email(addr)
            .await
            .context("category lookup failed")?
        {
            check_category_policy(context, &category, sender).await?;
            return Ok(Destination::CategoryInbox(category));
        }
        if let Some(key) = reply_key_from_addr(context, addr).await? {
            let entry = context
                .forum
                .email_log_by_reply_key(&key)
                .await
                .context("reply-key lookup failed")?;
            let Some(entry) = entry else {
                // A reply address with a dead key resolves nowhere; other
                // addresses may still match.
                continue;
            };
            return resolve_reply_key(context, entry, sender).await;
        }
    }

    Err(ProcessingError::BadDestinationAddress)
}

async fn resolve_reply_key(
    context: &Context,
    entry: EmailLogEntry,
    sender: &User,
) -> Result<Destination, ProcessingError> {
    if entry.user_id != sender.id {
        return Err(ProcessingError::ReplyUserNotMatching);
    }
    check_topic(context, entry.topic_id).await?;
    Ok(Destination::Reply {
        topic_id: entry.topic_id,
        post_id: entry.post_id,
    })
}

/// Replies need the topic to still exist and accept posts.
async fn check_topic(context: &Context, topic_id: i64) -> Result<(), ProcessingError> {
    match context
        .forum
        .topic_state(topic_id)
        .await
        .context("topic lookup failed")?
    {
        None | Some(TopicState::Trashed) => Err(ProcessingError::TopicNotFound(topic_id)),
        Some(TopicState::Closed) => Err(ProcessingError::TopicClosed(topic_id)),
        Some(TopicState::Open) => Ok(()),
    }
}

async fn check_category_policy(
    context: &Context,
    category: &Category,
    sender: &User,
) -> Result<(), ProcessingError> {
    if sender.staged && !category.email_in_allow_strangers {
        return Err(ProcessingError::StrangersNotAllowed(category.id));
    }
    let min_trust = context.get_config_int(Config::EmailInMinTrust).await?;
    if !sender.staged && sender.trust_level < min_trust {
        return Err(ProcessingError::InsufficientTrustLevel(category.id));
    }
    Ok(())
}

fn is_unsubscribe_text(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("unsubscribe")
}

/// Extracts the reply key if `addr` matches one of the configured
/// reply-by-email address templates.
pub(crate) async fn reply_key_from_addr(
    context: &Context,
    addr: &str,
) -> Result<Option<String>, ProcessingError> {
    let mut templates = Vec::new();
    if let Some(main) = context.get_config(Config::ReplyByEmailAddress).await? {
        templates.push(main);
    }
    if let Some(alternatives) = context
        .get_config(Config::AlternativeReplyByEmailAddresses)
        .await?
    {
        templates.extend(
            alternatives
                .split('|')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
        );
    }

    for template in &templates {
        let re = context.compiled_regex(&template_to_pattern(template))?;
        if let Some(captures) = re.captures(addr) {
            if let Some(key) = captures.get(1) {
                return Ok(Some(key.as_str().to_string()));
            }
        }
    }
    Ok(None)
}

/// Turns `reply+%{reply_key}@example.com` into an anchored regex with one
/// capture group for the 32-hex key.
fn template_to_pattern(template: &str) -> String {
    let escaped = regex::escape(template.trim());
    let placeholder = regex::escape(REPLY_KEY_PLACEHOLDER);
    format!(
        "^{}$",
        escaped.replace(&placeholder, "([[:xdigit:]]{32})")
    )
}

/// True if `addr` is one of the system's own inbound addresses (reply
/// templates, group or category inboxes). Used to keep those out of the
/// co-recipient invitation pass.
pub(crate) async fn is_system_address(context: &Context, addr: &str) -> Result<bool> {
    if reply_key_from_addr(context, addr).await.ok().flatten().is_some() {
        return Ok(true);
    }
    static VERP_ADDR_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\+verp-[0-9a-f]{32}@").unwrap());
    if VERP_ADDR_RE.is_match(addr) {
        return Ok(true);
    }
    if context.forum.group_by_email(addr).await?.is_some() {
        return Ok(true);
    }
    if context.forum.category_by_email(addr).await?.is_some() {
        return Ok(true);
    }
    Ok(false)
}
