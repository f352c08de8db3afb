//! # Processing error taxonomy.
//!
//! Every way a pipeline run can fail, as one closed enum. The queue worker
//! driving [`crate::receive::receive_email`] matches on this exhaustively;
//! there is deliberately no open-ended error hierarchy behind it.

/// Classified failure of a single pipeline run.
///
/// Apart from [`ProcessingError::Internal`], every variant corresponds to a
/// decision the pipeline made about the message itself and is persisted on
/// the processing record before being returned (see
/// [`ProcessingError::is_recorded`] for the two pre-record exceptions).
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    /// Raw input was blank, or so broken that no headers could be parsed.
    #[error("empty or unparseable message: {0}")]
    EmptyMessage(String),

    /// The subject matched the ignore pattern or the sender is screened.
    #[error("screened email: {0}")]
    ScreenedEmail(String),

    /// The message is a delivery failure notification.
    #[error("bounced email from {0}")]
    BouncedEmail(String),

    /// No account for the sender and staging is disabled or failed.
    #[error("no user found for {0}")]
    UserNotFound(String),

    /// Auto-generated mail is not accepted by site policy.
    #[error("auto-generated email")]
    AutoGeneratedEmail,

    /// The message replies to one of our own auto-generated notices.
    #[error("reply to an auto-generated notice")]
    AutoGeneratedEmailReply,

    /// The sender's account is deactivated.
    #[error("user {0} is inactive")]
    InactiveUser(String),

    /// The sender's account is suspended or silenced.
    #[error("user {0} is blocked")]
    BlockedUser(String),

    /// Neither a usable text body nor any attachment was found.
    #[error("no body detected")]
    NoBodyDetected,

    /// No destination address or thread reference resolved.
    #[error("bad destination address")]
    BadDestinationAddress,

    /// The category does not accept mail from staged users.
    #[error("strangers not allowed in category {0}")]
    StrangersNotAllowed(i64),

    /// The sender does not meet the category's trust requirement.
    #[error("insufficient trust level for category {0}")]
    InsufficientTrustLevel(i64),

    /// A reply key resolved, but it belongs to a different user.
    #[error("reply key does not belong to sender")]
    ReplyUserNotMatching,

    /// The referenced topic was deleted or trashed.
    #[error("topic {0} not found")]
    TopicNotFound(i64),

    /// The referenced topic is closed.
    #[error("topic {0} is closed")]
    TopicClosed(i64),

    /// Post/topic creation was rejected by downstream validation.
    #[error("invalid post: {0}")]
    InvalidPost(String),

    /// A non-post action (like, unsubscribe, invite) was rejected downstream.
    #[error("invalid post action: {0}")]
    InvalidPostAction(String),

    /// Database or collaborator I/O failure. Not a classification of the
    /// message; the caller's retry policy may treat it differently.
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ProcessingError {
    /// Stable token stored in the record's `error` column.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyMessage(_) => "empty_message",
            Self::ScreenedEmail(_) => "screened_email",
            Self::BouncedEmail(_) => "bounced_email",
            Self::UserNotFound(_) => "user_not_found",
            Self::AutoGeneratedEmail => "auto_generated_email",
            Self::AutoGeneratedEmailReply => "auto_generated_email_reply",
            Self::InactiveUser(_) => "inactive_user",
            Self::BlockedUser(_) => "blocked_user",
            Self::NoBodyDetected => "no_body_detected",
            Self::BadDestinationAddress => "bad_destination_address",
            Self::StrangersNotAllowed(_) => "strangers_not_allowed",
            Self::InsufficientTrustLevel(_) => "insufficient_trust_level",
            Self::ReplyUserNotMatching => "reply_user_not_matching",
            Self::TopicNotFound(_) => "topic_not_found",
            Self::TopicClosed(_) => "topic_closed",
            Self::InvalidPost(_) => "invalid_post",
            Self::InvalidPostAction(_) => "invalid_post_action",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether this failure happens before a processing record exists.
    ///
    /// Blank and screened mail must leave no trace.
    pub fn is_recorded(&self) -> bool {
        !matches!(self, Self::EmptyMessage(_) | Self::ScreenedEmail(_))
    }

    /// Text persisted on the record: the kind token plus the display message.
    pub(crate) fn record_text(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

/// Helper so `?` on rusqlite results works inside pipeline code.
impl From<rusqlite::Error> for ProcessingError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal(err.into())
    }
}

pub type Result<T, E = ProcessingError> = std::result::Result<T, E>;
