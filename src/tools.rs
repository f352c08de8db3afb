//! # Small helpers.

use std::borrow::Cow;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use rand::{thread_rng, Rng};
use sha2::{Digest, Sha256};

use crate::constants::GENERATED_MSGID_DOMAIN;

/// Shortens a string to a specified length and adds "[...]" to the
/// end of the shortened string.
pub(crate) fn truncate(buf: &str, approx_chars: usize) -> Cow<str> {
    let count = buf.chars().count();
    if count > approx_chars + crate::constants::ELLIPSIS.len() {
        let end_pos = buf
            .char_indices()
            .nth(approx_chars)
            .map(|(n, _)| n)
            .unwrap_or_default();

        if let Some(index) = buf.get(..end_pos).and_then(|s| s.rfind([' ', '\n'])) {
            Cow::Owned(format!(
                "{}{}",
                &buf.get(..=index).unwrap_or_default(),
                crate::constants::ELLIPSIS
            ))
        } else {
            Cow::Owned(format!(
                "{}{}",
                &buf.get(..end_pos).unwrap_or_default(),
                crate::constants::ELLIPSIS
            ))
        }
    } else {
        Cow::Borrowed(buf)
    }
}

/// Current time in seconds since the UNIX epoch.
pub(crate) fn time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Returns a random alphanumeric id of 11 characters.
pub(crate) fn create_id() -> String {
    // ASCII alphanumeric alphabet, avoids any need for percent-encoding.
    let mut rng = thread_rng();
    (0..11)
        .map(|_| char::from(rng.sample(rand::distributions::Alphanumeric)))
        .collect()
}

/// Synthesizes a Message-Id for a message that arrived without one.
///
/// Derived from the raw bytes so redelivery of the same message maps to the
/// same processing record.
pub(crate) fn generated_msgid(raw: &[u8]) -> String {
    let digest = Sha256::digest(raw);
    format!(
        "{}@{}",
        hex::encode(&digest[..16]),
        GENERATED_MSGID_DOMAIN
    )
}

/// Lowercases and trims an address for lookups and comparisons.
pub(crate) fn addr_normalize(addr: &str) -> String {
    addr.trim().trim_matches(['<', '>']).to_lowercase()
}

/// Compares two addresses for equality after normalization.
pub(crate) fn addr_cmp(addr1: &str, addr2: &str) -> bool {
    addr_normalize(addr1) == addr_normalize(addr2)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl EmailAddress {
    /// Performs a dead-simple parse of an email address.
    pub fn new(input: &str) -> Result<EmailAddress> {
        if input.is_empty() {
            bail!("empty address");
        }
        if !input.contains('@') {
            bail!("missing '@' in {input:?}");
        }
        let mut parts = input.rsplitn(2, '@');
        let domain = match parts.next() {
            Some(domain) if !domain.is_empty() && !domain.starts_with('.') => domain,
            _ => bail!("bad domain in {input:?}"),
        };
        let local = match parts.next() {
            Some(local) if !local.is_empty() => local,
            _ => bail!("bad local part in {input:?}"),
        };
        Ok(EmailAddress {
            local: local.to_string(),
            domain: domain.to_string(),
        })
    }
}

/// Whether the address looks valid enough to resolve a user for it.
pub(crate) fn may_be_valid_addr(addr: &str) -> bool {
    EmailAddress::new(addr).is_ok()
}
