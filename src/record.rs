//! # Processing records.
//!
//! One row per received message, keyed by the message identifier. The row
//! is created at the start of processing and mutated at every decision
//! point; it is never deleted by the pipeline. Redelivery of the same
//! message finds the existing row, which is what keeps the pipeline
//! idempotent.

use anyhow::Result;

use crate::context::Context;
use crate::mimeparser::MimeMessage;
use crate::tools::time;

/// One `incoming_emails` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingEmail {
    pub id: i64,
    pub message_id: String,
    pub subject: String,
    pub from_addr: String,
    pub user_id: Option<i64>,
    pub topic_id: Option<i64>,
    pub post_id: Option<i64>,
    pub post_number: Option<i64>,
    pub is_bounce: bool,
    pub is_auto_generated: bool,
    pub error: Option<String>,
}

impl IncomingEmail {
    /// Finds the record for a message identifier or creates it.
    ///
    /// The insert ignores conflicts on `message_id`, so two concurrent
    /// deliveries of the same message end up with the same row.
    pub async fn find_or_create(
        context: &Context,
        mime: &MimeMessage,
        raw: &[u8],
    ) -> Result<Self> {
        context
            .sql
            .execute(
                "INSERT INTO incoming_emails
                   (message_id, raw, subject, from_addr, to_addrs, cc_addrs, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(message_id) DO NOTHING",
                (
                    &mime.message_id,
                    raw,
                    &mime.subject,
                    &mime.from_addr,
                    mime.to_addrs.join(";"),
                    mime.cc_addrs.join(";"),
                    time(),
                ),
            )
            .await?;
        let record = Self::load(context, &mime.message_id)
            .await?
            .ok_or_else(|| anyhow::format_err!("record vanished after find_or_create"))?;
        Ok(record)
    }

    /// Loads a record by message identifier.
    pub async fn load(context: &Context, message_id: &str) -> Result<Option<Self>> {
        context
            .sql
            .query_row_optional(
                "SELECT id, message_id, subject, from_addr, user_id, topic_id,
                        post_id, post_number, is_bounce, is_auto_generated, error
                 FROM incoming_emails WHERE message_id=?",
                (message_id,),
                |row| {
                    Ok(IncomingEmail {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        subject: row.get(2)?,
                        from_addr: row.get(3)?,
                        user_id: row.get(4)?,
                        topic_id: row.get(5)?,
                        post_id: row.get(6)?,
                        post_number: row.get(7)?,
                        is_bounce: row.get(8)?,
                        is_auto_generated: row.get(9)?,
                        error: row.get(10)?,
                    })
                },
            )
            .await
    }

    /// Marks the record as a bounce.
    pub async fn set_bounced(&mut self, context: &Context) -> Result<()> {
        self.is_bounce = true;
        context
            .sql
            .execute(
                "UPDATE incoming_emails SET is_bounce=1 WHERE id=?",
                (self.id,),
            )
            .await?;
        Ok(())
    }

    /// Flags the record as auto-generated mail.
    pub async fn set_auto_generated(&mut self, context: &Context) -> Result<()> {
        self.is_auto_generated = true;
        context
            .sql
            .execute(
                "UPDATE incoming_emails SET is_auto_generated=1 WHERE id=?",
                (self.id,),
            )
            .await?;
        Ok(())
    }

    /// Stores the resolved sender.
    pub async fn set_user(&mut self, context: &Context, user_id: i64) -> Result<()> {
        self.user_id = Some(user_id);
        context
            .sql
            .execute(
                "UPDATE incoming_emails SET user_id=? WHERE id=?",
                (user_id, self.id),
            )
            .await?;
        Ok(())
    }

    /// Stores the created post and clears any stale error.
    pub async fn set_post(
        &mut self,
        context: &Context,
        topic_id: i64,
        post_id: i64,
        post_number: i64,
    ) -> Result<()> {
        self.topic_id = Some(topic_id);
        self.post_id = Some(post_id);
        self.post_number = Some(post_number);
        self.error = None;
        context
            .sql
            .execute(
                "UPDATE incoming_emails
                 SET topic_id=?, post_id=?, post_number=?, error=NULL
                 WHERE id=?",
                (topic_id, post_id, post_number, self.id),
            )
            .await?;
        Ok(())
    }

    /// Persists the error a run ended with.
    pub async fn set_error(&mut self, context: &Context, error: &str) -> Result<()> {
        self.error = Some(error.to_string());
        context
            .sql
            .execute(
                "UPDATE incoming_emails SET error=? WHERE id=?",
                (error, self.id),
            )
            .await?;
        Ok(())
    }
}

/// Looks up the post created for any of the given message identifiers.
///
/// This is what makes In-Reply-To/References thread continuation work: a
/// reply to a previously-processed message lands on the same topic no
/// matter which address it was sent to.
pub async fn find_post_by_message_ids(
    context: &Context,
    message_ids: &[String],
) -> Result<Option<(i64, i64)>> {
    for message_id in message_ids {
        let hit = context
            .sql
            .query_row_optional(
                "SELECT topic_id, post_id FROM incoming_emails
                 WHERE message_id=? AND topic_id IS NOT NULL AND post_id IS NOT NULL",
                (message_id,),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .await?;
        if hit.is_some() {
            return Ok(hit);
        }
    }
    Ok(None)
}
