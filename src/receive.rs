//! # Inbound mail reception pipeline.
//!
//! The single entry point is [`receive_email`]: raw bytes in, exactly one
//! forum action or one classified error out. Stages run strictly in
//! sequence; the first failure aborts the run, is persisted on the
//! processing record and re-raised to the caller. Retry policy belongs to
//! the queue worker driving this function, not to the pipeline.

use std::cmp::min;

use anyhow::Context as _;

use crate::classify;
use crate::config::Config;
use crate::constants::NO_SUBJECT;
use crate::context::Context;
use crate::dehtml::dehtml;
use crate::destination::{self, Destination};
use crate::error::ProcessingError;
use crate::forum::{CreateResult, CreatedPost, LikeOutcome, NewPost, PostDestination, User};
use crate::log::LogExt;
use crate::mimeparser::MimeMessage;
use crate::record::IncomingEmail;
use crate::simplify::{simplify, TrimmedBody};
use crate::tools::{addr_cmp, time};
use crate::users::{self, RunState};

/// The forum action one pipeline run produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailAction {
    /// A reply was added to an existing topic.
    Reply { topic_id: i64, post_id: i64 },
    /// A new topic was opened in a category.
    NewTopic { topic_id: i64, post_id: i64 },
    /// A new private conversation with a group was opened.
    GroupMessage { topic_id: i64, post_id: i64 },
    /// A like was recorded instead of a post.
    Liked { post_id: i64 },
    /// The sender was unsubscribed.
    Unsubscribed,
}

/// This is the struct that is returned after receiving one email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEmail {
    /// Row id of the processing record.
    pub record_id: i64,

    /// The action the message mapped to.
    pub action: EmailAction,
}

/// Processes one raw message.
///
/// Idempotent per message identifier: redelivery finds the existing
/// processing record and does not create a second post.
pub async fn receive_email(
    context: &Context,
    raw: &[u8],
) -> Result<ReceivedEmail, ProcessingError> {
    let mime = match MimeMessage::from_bytes(context, raw) {
        Ok(mime) => mime,
        Err(err) => {
            context.emit_event(crate::EventType::IncomingEmailFailed {
                record_id: None,
                kind: err.kind(),
            });
            return Err(err);
        }
    };
    info!(
        context,
        "receiving message {} from {:?}", mime.message_id, mime.from_addr
    );

    // Screening runs before the record exists; screened mail leaves no
    // trace.
    if let Err(err) = classify::screen(context, &mime).await {
        context.emit_event(crate::EventType::IncomingEmailFailed {
            record_id: None,
            kind: err.kind(),
        });
        return Err(err);
    }

    let mut record = IncomingEmail::find_or_create(context, &mime, raw).await?;

    // Redelivery of an already-handled message must not post again.
    if let (Some(topic_id), Some(post_id)) = (record.topic_id, record.post_id) {
        info!(context, "message {} already processed", mime.message_id);
        let action = match record.post_number {
            Some(1) => EmailAction::NewTopic { topic_id, post_id },
            _ => EmailAction::Reply { topic_id, post_id },
        };
        return Ok(ReceivedEmail {
            record_id: record.id,
            action,
        });
    }

    match process_message(context, &mime, &mut record).await {
        Ok(action) => {
            context.emit_event(crate::EventType::IncomingEmailProcessed {
                record_id: record.id,
            });
            Ok(ReceivedEmail {
                record_id: record.id,
                action,
            })
        }
        Err(err) => {
            if err.is_recorded() {
                if let Err(db_err) = record.set_error(context, &err.record_text()).await {
                    error!(context, "could not persist error on record: {db_err:#}");
                }
            }
            context.emit_event(crate::EventType::IncomingEmailFailed {
                record_id: Some(record.id),
                kind: err.kind(),
            });
            Err(err)
        }
    }
}

/// The post-record stages: classification, user resolution, body
/// selection, destination resolution and the forum action itself.
async fn process_message(
    context: &Context,
    mime: &MimeMessage,
    record: &mut IncomingEmail,
) -> Result<EmailAction, ProcessingError> {
    let mut run = RunState::new();

    let auto_generated = classify::is_auto_generated(context, mime).await?;
    if classify::is_bounce(mime) {
        classify::handle_bounce(context, mime, record, auto_generated).await?;
        return Err(ProcessingError::BouncedEmail(mime.from_addr.clone()));
    }
    classify::check_auto_generated(context, mime, record).await?;

    let sender = users::resolve_sender(
        context,
        &mut run,
        &mime.from_addr,
        mime.from_display_name.as_deref(),
    )
    .await?;
    record.set_user(context, sender.id).await?;

    let body = select_body(context, mime).await?;
    let destination = destination::resolve(context, mime, &sender, &body.text).await?;

    // Everything except a bare command needs content to post.
    if destination != Destination::UnsubscribeCommand
        && body.text.is_empty()
        && mime.attachments.is_empty()
    {
        return Err(ProcessingError::NoBodyDetected);
    }

    match destination {
        Destination::UnsubscribeCommand => {
            context
                .forum
                .unsubscribe(sender.id)
                .await
                .context("unsubscribe failed")?;
            info!(context, "unsubscribed {} by mail", sender.username);
            Ok(EmailAction::Unsubscribed)
        }
        Destination::Reply { topic_id, post_id } => {
            if let Some(like) = try_like(context, mime, &sender, &body.text, post_id).await? {
                return Ok(like);
            }
            let raw_body = finish_body(context, mime, &sender, &body, false).await;
            let created = create_post(
                context,
                mime,
                NewPost {
                    user_id: sender.id,
                    raw: raw_body,
                    title: None,
                    destination: PostDestination::Topic(topic_id),
                    created_at: clamped_created_at(mime),
                },
            )
            .await?;
            record
                .set_post(context, created.topic_id, created.post_id, created.post_number)
                .await?;
            Ok(EmailAction::Reply {
                topic_id: created.topic_id,
                post_id: created.post_id,
            })
        }
        Destination::CategoryInbox(category) => {
            let raw_body = finish_body(context, mime, &sender, &body, false).await;
            let created = create_post(
                context,
                mime,
                NewPost {
                    user_id: sender.id,
                    raw: raw_body,
                    title: Some(topic_title(mime)),
                    destination: PostDestination::Category(category.id),
                    created_at: clamped_created_at(mime),
                },
            )
            .await?;
            record
                .set_post(context, created.topic_id, created.post_id, created.post_number)
                .await?;
            info!(
                context,
                "created topic {} in category {}", created.topic_id, category.name
            );
            Ok(EmailAction::NewTopic {
                topic_id: created.topic_id,
                post_id: created.post_id,
            })
        }
        Destination::GroupInbox(group) => {
            let raw_body = finish_body(context, mime, &sender, &body, true).await;
            let created = create_post(
                context,
                mime,
                NewPost {
                    user_id: sender.id,
                    raw: raw_body,
                    title: Some(topic_title(mime)),
                    destination: PostDestination::Group(group.id),
                    created_at: clamped_created_at(mime),
                },
            )
            .await?;
            record
                .set_post(context, created.topic_id, created.post_id, created.post_number)
                .await?;
            invite_co_recipients(context, &mut run, mime, &sender, created.topic_id).await;
            Ok(EmailAction::GroupMessage {
                topic_id: created.topic_id,
                post_id: created.post_id,
            })
        }
    }
}

/// Picks the body candidate and trims it.
async fn select_body(
    context: &Context,
    mime: &MimeMessage,
) -> Result<TrimmedBody, ProcessingError> {
    let prefer_html = context
        .get_config_bool(Config::IncomingEmailPreferHtml)
        .await?;

    let use_html = mime.html_part.is_some() && (prefer_html || mime.text_part.is_none());
    let candidate = if use_html {
        mime.html_part.as_deref().and_then(dehtml)
    } else {
        mime.text_part.clone()
    };

    Ok(candidate.map(simplify).unwrap_or_default())
}

/// Reattaches the elided remainder (group messages only) and the uploaded
/// attachments.
async fn finish_body(
    context: &Context,
    mime: &MimeMessage,
    sender: &User,
    body: &TrimmedBody,
    for_group_message: bool,
) -> String {
    let mut text = body.text.clone();
    if for_group_message && !body.elided.is_empty() {
        // Private conversations keep the full quoted context, collapsed.
        text.push_str(&format!(
            "\n\n<details class='elided'>\n<summary title='expand'>&#183;&#183;&#183;</summary>\n\n{}\n\n</details>",
            body.elided
        ));
    }
    crate::attachments::add_attachments(
        context,
        sender,
        &mime.attachments,
        &text,
        for_group_message,
    )
    .await
}

/// Records a like instead of a reply when the trimmed body is exactly a
/// like token: `+1` or the configured localized word. An already-liked
/// post counts as success.
async fn try_like(
    context: &Context,
    mime: &MimeMessage,
    sender: &User,
    trimmed: &str,
    post_id: i64,
) -> Result<Option<EmailAction>, ProcessingError> {
    let like_text = context
        .get_config(Config::LikeEmailText)
        .await?
        .unwrap_or_default();
    let token = trimmed.trim();
    let is_like = token == "+1" || (!like_text.is_empty() && token.eq_ignore_ascii_case(&like_text));
    if !is_like || !mime.attachments.is_empty() {
        return Ok(None);
    }

    match context
        .forum
        .like_post(post_id, sender.id)
        .await
        .context("like failed")?
    {
        LikeOutcome::Recorded | LikeOutcome::AlreadyActed => {
            info!(context, "{} liked post {} by mail", sender.username, post_id);
            Ok(Some(EmailAction::Liked { post_id }))
        }
        LikeOutcome::NotAllowed => Err(ProcessingError::InvalidPostAction(format!(
            "cannot like post {post_id}"
        ))),
    }
}

async fn create_post(
    context: &Context,
    mime: &MimeMessage,
    post: NewPost,
) -> Result<CreatedPost, ProcessingError> {
    match context
        .forum
        .create_post(post)
        .await
        .context("post creation failed")?
    {
        CreateResult::Created(created) => Ok(created),
        CreateResult::Rejected(errors) => {
            warn!(
                context,
                "post for {} rejected: {}",
                mime.message_id,
                errors.join("; ")
            );
            Err(ProcessingError::InvalidPost(errors.join("; ")))
        }
    }
}

/// Resolves and invites the other human recipients of a private
/// conversation, capped by the per-run staging limit. Failures are
/// logged and skipped; the conversation itself already exists.
async fn invite_co_recipients(
    context: &Context,
    run: &mut RunState,
    mime: &MimeMessage,
    sender: &User,
    topic_id: i64,
) {
    let mut candidates: Vec<&String> = Vec::new();
    candidates.extend(&mime.to_addrs);
    candidates.extend(&mime.cc_addrs);
    candidates.extend(&mime.bcc_addrs);

    for addr in candidates {
        if addr_cmp(addr, &sender.email) {
            continue;
        }
        match destination::is_system_address(context, addr).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => {
                warn!(context, "could not check address {addr}: {err:#}");
                continue;
            }
        }
        let invitee = match users::find_or_stage_user(context, run, addr, None).await {
            Ok(Some(user)) => user,
            Ok(None) => continue,
            Err(err) => {
                warn!(context, "could not resolve co-recipient {addr}: {err:#}");
                continue;
            }
        };
        if context
            .forum
            .invite_to_conversation(topic_id, sender.id, invitee.id)
            .await
            .context("could not invite to conversation")
            .log_err(context)
            .is_some()
        {
            info!(
                context,
                "{} invited {} into conversation {topic_id}", sender.username, invitee.username
            );
        }
    }
}

fn topic_title(mime: &MimeMessage) -> String {
    let subject = mime.subject.trim();
    if subject.is_empty() {
        NO_SUBJECT.to_string()
    } else {
        subject.to_string()
    }
}

/// Post dates must not lie in the future: `min(message date, now)`.
fn clamped_created_at(mime: &MimeMessage) -> i64 {
    let now = time();
    if mime.date > 0 {
        min(mime.date, now)
    } else {
        now
    }
}
