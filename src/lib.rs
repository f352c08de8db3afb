//! # Mailroom
//!
//! Turns raw inbound email into forum actions: replies, topics, private
//! group messages, unsubscribe commands and like reactions. Everything
//! that should not become forum content (bounces, auto-generated mail,
//! screened senders) is classified, persisted and re-raised as one of a
//! closed set of processing errors.
//!
//! The entry point is [`receive::receive_email`] on a [`context::Context`];
//! the surrounding application provides the forum side through the traits
//! in [`forum`].

#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::correctness,
    missing_debug_implementations,
    clippy::all,
    clippy::wildcard_imports,
    clippy::needless_borrow,
    clippy::cast_lossless,
    clippy::explicit_iter_loop,
    clippy::cloned_instead_of_copied
)]

#[macro_use]
mod log;

pub mod attachments;
pub mod classify;
pub mod config;
pub mod constants;
pub mod context;
pub mod dehtml;
pub mod destination;
pub mod error;
pub mod events;
pub mod forum;
pub mod headerdef;
pub mod mimeparser;
pub mod receive;
pub mod record;
pub mod simplify;
pub mod sql;
mod tools;
pub mod users;

#[cfg(test)]
pub mod test_utils;

pub use self::error::ProcessingError;
pub use self::events::{Event, EventEmitter, EventType};
pub use self::receive::{receive_email, EmailAction, ReceivedEmail};
