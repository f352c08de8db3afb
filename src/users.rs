//! # User resolution.
//!
//! Finds the forum account behind a sender address, staging a placeholder
//! account when allowed. Staging is capped per pipeline run so one mail
//! with a giant recipient list cannot mass-create accounts.

use anyhow::{Context as _, Result};

use crate::config::Config;
use crate::context::Context;
use crate::error::ProcessingError;
use crate::forum::User;
use crate::tools::{addr_normalize, create_id, may_be_valid_addr, EmailAddress};

/// Mutable state of one pipeline run.
#[derive(Debug, Default)]
pub struct RunState {
    /// Number of staged accounts created during this run.
    pub staged_created: i64,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Finds or stages the user for an address.
///
/// Returns `None` when there is no account and staging is disabled,
/// capped out, or failed.
pub async fn find_or_stage_user(
    context: &Context,
    run: &mut RunState,
    addr: &str,
    display_name: Option<&str>,
) -> Result<Option<User>> {
    let addr = addr_normalize(addr);
    if !may_be_valid_addr(&addr) {
        return Ok(None);
    }

    if let Some(user) = context
        .forum
        .user_by_email(&addr)
        .await
        .context("user lookup failed")?
    {
        return Ok(Some(user));
    }

    if !context.get_config_bool(Config::EnableStagedUsers).await? {
        return Ok(None);
    }
    let cap = context.get_config_int(Config::MaxStagedUsersPerEmail).await?;
    if run.staged_created >= cap {
        info!(context, "staged user cap {cap} reached, not staging {addr}");
        return Ok(None);
    }

    let username = suggest_username(display_name, &addr);
    let user = match context.forum.create_staged_user(&addr, &username).await {
        Ok(user) => user,
        Err(err) => {
            warn!(context, "staging {addr} as {username:?} failed: {err:#}");
            // One retry with a random suggestion; collisions on derived
            // names are common for popular local parts.
            let fallback = format!("user_{}", create_id().to_lowercase());
            match context.forum.create_staged_user(&addr, &fallback).await {
                Ok(user) => user,
                Err(err) => {
                    warn!(context, "staging {addr} as {fallback:?} failed: {err:#}");
                    return Ok(None);
                }
            }
        }
    };
    run.staged_created += 1;
    info!(context, "staged {} as {}", addr, user.username);
    Ok(Some(user))
}

/// Resolves the sender or fails the run, then checks account state.
pub async fn resolve_sender(
    context: &Context,
    run: &mut RunState,
    addr: &str,
    display_name: Option<&str>,
) -> Result<User, ProcessingError> {
    let user = find_or_stage_user(context, run, addr, display_name)
        .await?
        .ok_or_else(|| ProcessingError::UserNotFound(addr.to_string()))?;

    if !user.active && !user.staged {
        return Err(ProcessingError::InactiveUser(user.username));
    }
    if user.suspended {
        return Err(ProcessingError::BlockedUser(user.username));
    }
    Ok(user)
}

/// Derives a username from the display name, falling back to the email
/// local part. The result uses only `[a-z0-9._-]` and never starts or
/// ends with punctuation.
pub(crate) fn suggest_username(display_name: Option<&str>, addr: &str) -> String {
    if let Some(name) = display_name {
        let sanitized = sanitize_username(name);
        if sanitized.len() >= 2 {
            return sanitized;
        }
    }
    let local = EmailAddress::new(addr)
        .map(|a| a.local)
        .unwrap_or_default();
    let sanitized = sanitize_username(&local);
    if sanitized.len() >= 2 {
        sanitized
    } else {
        format!("user_{}", create_id().to_lowercase())
    }
}

fn sanitize_username(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_punct = true;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_punct = false;
        } else if !last_was_punct && matches!(c, '.' | '-' | '_' | ' ') {
            out.push(if c == ' ' { '_' } else { c });
            last_was_punct = true;
        }
    }
    while out.ends_with(['.', '-', '_']) {
        out.pop();
    }
    out.truncate(20);
    out
}
