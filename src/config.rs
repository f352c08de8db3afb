//! # Key-value configuration management.

use anyhow::Result;
use strum::{EnumProperty as _, IntoEnumIterator};
use strum_macros::{AsRefStr, Display, EnumIter, EnumProperty, EnumString};

use crate::context::Context;

/// The available configuration keys.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr, EnumIter, EnumProperty,
)]
#[strum(serialize_all = "snake_case")]
pub enum Config {
    /// Template for reply-by-email addresses; `%{reply_key}` marks the
    /// position of the 32-hex reply key.
    #[strum(props(default = "reply+%{reply_key}@example.com"))]
    ReplyByEmailAddress,

    /// Additional, pipe-separated reply address templates (old domains,
    /// alternate prefixes) that are still routed.
    AlternativeReplyByEmailAddresses,

    /// Prefer the HTML part over the plain-text part when both exist.
    #[strum(props(default = "0"))]
    IncomingEmailPreferHtml,

    /// Reject all auto-generated mail instead of merely flagging it.
    #[strum(props(default = "0"))]
    BlockAutoGeneratedEmails,

    /// Pipe-separated addresses whose mail is never treated as
    /// auto-generated.
    AutoGeneratedAllowlist,

    /// Accept a bare "unsubscribe" subject or body as a command.
    #[strum(props(default = "1"))]
    UnsubscribeViaEmail,

    /// Create staged accounts for unknown senders.
    #[strum(props(default = "1"))]
    EnableStagedUsers,

    /// Cap on staged-account creations per processed message.
    #[strum(props(default = "10"))]
    MaxStagedUsersPerEmail,

    /// Regex; matching subjects are dropped before any record is created.
    IgnoredEmailSubjects,

    /// Minimum trust level required to open a topic by mail.
    #[strum(props(default = "1"))]
    EmailInMinTrust,

    /// Localized name of the "like" reaction, accepted next to "+1".
    #[strum(props(default = "like"))]
    LikeEmailText,

    /// Windowed bounce score at which a sender's mail delivery is revoked.
    #[strum(props(default = "4"))]
    BounceScoreThreshold,

    /// Length of the bounce score window in days.
    #[strum(props(default = "30"))]
    BounceScoreWindowDays,
}

impl Config {
    /// Returns the built-in default for this key, if any.
    pub fn get_default(&self) -> Option<&'static str> {
        self.get_str("default")
    }
}

impl Context {
    /// Get a config key value. Returns the builtin default if unset.
    pub async fn get_config(&self, key: Config) -> Result<Option<String>> {
        let value = self.sql.get_raw_config(key.as_ref()).await?;
        if value.is_some() {
            return Ok(value);
        }
        Ok(key.get_default().map(|s| s.to_string()))
    }

    /// Set the given config key; `None` removes the stored value.
    pub async fn set_config(&self, key: Config, value: Option<&str>) -> Result<()> {
        self.sql.set_raw_config(key.as_ref(), value).await
    }

    /// Gets config value as a boolean; unset means the key's default.
    pub async fn get_config_bool(&self, key: Config) -> Result<bool> {
        Ok(self
            .get_config(key)
            .await?
            .map(|value| value == "1" || value == "true")
            .unwrap_or_default())
    }

    /// Gets config value as an i64; unset means the key's default.
    pub async fn get_config_int(&self, key: Config) -> Result<i64> {
        Ok(self
            .get_config(key)
            .await?
            .and_then(|s| s.parse().ok())
            .unwrap_or_default())
    }

    /// Returns all keys with their effective values, for diagnostics.
    pub async fn get_config_map(&self) -> Result<Vec<(Config, Option<String>)>> {
        let mut res = Vec::new();
        for key in Config::iter() {
            res.push((key, self.get_config(key).await?));
        }
        Ok(res)
    }
}
