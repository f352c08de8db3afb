//! # Constants.

/// Weight added to a sender's bounce score for a transient (4.x.x) failure.
pub const SOFT_BOUNCE_SCORE: i64 = 1;

/// Weight added to a sender's bounce score for a permanent (5.x.x) failure.
pub const HARD_BOUNCE_SCORE: i64 = 2;

/// Tag embedded in the Message-Ids of our own auto-generated outbound
/// notices. An inbound mail whose In-Reply-To carries this tag is a reply
/// to machine-generated mail and must not become forum content.
pub const AUTO_GENERATED_ID_TAG: &str = "notice.";

/// Domain used for synthesized Message-Ids when a message arrives without
/// one. `.invalid` is reserved and can never collide with real mail.
pub const GENERATED_MSGID_DOMAIN: &str = "generated.invalid";

/// Subject used when a message arrives without one.
pub const NO_SUBJECT: &str = "(no subject)";

/// Marker line our outbound digests place above quoted prior discussion.
/// Everything from this line on is elided when the mail comes back in.
pub const PREVIOUS_DISCUSSION_MARKER: &str = "---- Previous discussion ----";

/// Hex length of reply and bounce keys embedded in addresses.
pub const EMAIL_KEY_LEN: usize = 32;

/// Upper bound on text length persisted from one body part.
pub const DESIRED_TEXT_LEN: usize = 40_000;

/// Appended when a body part is truncated to [`DESIRED_TEXT_LEN`].
pub const ELLIPSIS: &str = "[...]";
