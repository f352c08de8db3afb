//! # Forum-side collaborators.
//!
//! The pipeline never touches forum storage directly; everything it needs
//! from the surrounding application is behind these two traits. Production
//! wires them to the real services, tests wire them to recording fakes.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A forum account, possibly staged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    /// Placeholder account auto-created for an email sender.
    pub staged: bool,
    pub active: bool,
    /// Suspended or silenced; such senders cannot post by mail.
    pub suspended: bool,
    pub trust_level: i64,
}

/// A group with a mail-in inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub incoming_email: String,
}

/// A category accepting new topics by mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub incoming_email: String,
    /// Whether staged senders may open topics here.
    pub email_in_allow_strangers: bool,
}

/// One entry of the outbound delivery log.
///
/// Owned by the delivery-log subsystem; this pipeline finds entries by the
/// keys embedded in VERP and reply addresses and asks the collaborator to
/// flip the bounced flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailLogEntry {
    pub id: i64,
    /// User the original mail was delivered to.
    pub user_id: i64,
    /// Address the original mail was delivered to.
    pub to_address: String,
    pub topic_id: i64,
    pub post_id: i64,
    pub bounced: bool,
}

/// Life state of a reply target topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicState {
    Open,
    Closed,
    /// Deleted or in the trash; replies are impossible.
    Trashed,
}

/// What kind of container a new post goes into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostDestination {
    /// Reply within an existing topic.
    Topic(i64),
    /// New topic in a category.
    Category(i64),
    /// New private conversation with a group.
    Group(i64),
}

/// Request handed to the post-creation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPost {
    pub user_id: i64,
    pub raw: String,
    pub title: Option<String>,
    pub destination: PostDestination,
    /// Clamped by the pipeline to `min(message date, now)`.
    pub created_at: i64,
}

/// Result of a post-creation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateResult {
    Created(CreatedPost),
    /// Downstream validation failed; the messages are persisted on the
    /// processing record.
    Rejected(Vec<String>),
}

/// Identifiers of a successfully created post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedPost {
    pub topic_id: i64,
    pub post_id: i64,
    pub post_number: i64,
}

/// Result of recording a like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LikeOutcome {
    Recorded,
    /// The user had already liked the post. Success for our purposes.
    AlreadyActed,
    /// Liking is impossible (own post, deleted post).
    NotAllowed,
}

/// Handle to a stored upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    pub id: i64,
    /// URL to embed in post markup.
    pub url: String,
}

/// Everything the pipeline asks of the forum.
#[async_trait]
pub trait Forum: Send + Sync {
    /// Looks up an account by normalized email address.
    async fn user_by_email(&self, addr: &str) -> Result<Option<User>>;

    /// Creates a staged account. May fail on username collisions; the
    /// resolver retries once with a random suggestion.
    async fn create_staged_user(&self, addr: &str, username: &str) -> Result<User>;

    /// Screening policy: should mail from this address be dropped?
    async fn should_block(&self, addr: &str) -> Result<bool>;

    /// Finds a group by its mail-in inbox address.
    async fn group_by_email(&self, addr: &str) -> Result<Option<Group>>;

    /// Finds a category by its mail-in inbox address.
    async fn category_by_email(&self, addr: &str) -> Result<Option<Category>>;

    /// Delivery-log lookup by the key from a reply address.
    async fn email_log_by_reply_key(&self, key: &str) -> Result<Option<EmailLogEntry>>;

    /// Delivery-log lookup by the key from a VERP bounce address.
    async fn email_log_by_bounce_key(&self, key: &str) -> Result<Option<EmailLogEntry>>;

    /// Marks a delivery-log entry as bounced.
    async fn mark_email_log_bounced(&self, entry_id: i64) -> Result<()>;

    /// Returns the state of a topic, `None` if it never existed.
    async fn topic_state(&self, topic_id: i64) -> Result<Option<TopicState>>;

    /// Creates a post or topic, or reports validation errors.
    async fn create_post(&self, post: NewPost) -> Result<CreateResult>;

    /// Records a like by `user_id` on `post_id`.
    async fn like_post(&self, post_id: i64, user_id: i64) -> Result<LikeOutcome>;

    /// Executes an unsubscribe command for the user.
    async fn unsubscribe(&self, user_id: i64) -> Result<()>;

    /// Revokes mail delivery to an address whose bounce score crossed the
    /// threshold.
    async fn revoke_email(&self, addr: &str) -> Result<()>;

    /// Invites a user into a private conversation, posting an audit note
    /// that names inviter and invitee.
    async fn invite_to_conversation(
        &self,
        topic_id: i64,
        inviter_id: i64,
        invitee_id: i64,
    ) -> Result<()>;
}

/// Attachment storage.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Persists attachment bytes for `user_id` and returns a handle, or an
    /// error which the attachment handler swallows per file.
    async fn upload(
        &self,
        user_id: i64,
        filename: &str,
        data: &[u8],
        for_group_message: bool,
    ) -> Result<Upload>;
}
