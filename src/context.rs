//! Context module.
//!
//! A [`Context`] bundles everything one pipeline deployment shares:
//! the database, the event channel and the forum-side collaborators.
//! Processing runs for different messages may use the same context
//! concurrently.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{ensure, Context as _, Result};
use regex::Regex;

use crate::events::{Event, EventEmitter, Events};
use crate::forum::{Forum, Uploader};
use crate::sql::Sql;

/// The context for a pipeline deployment.
#[derive(Clone, Debug)]
pub struct Context {
    pub(crate) inner: Arc<InnerContext>,
}

impl Deref for Context {
    type Target = InnerContext;

    fn deref(&self) -> &InnerContext {
        &self.inner
    }
}

/// The underlying shared state.
pub struct InnerContext {
    /// Database of processing records and settings.
    pub sql: Sql,

    /// Event channel.
    pub(crate) events: Events,

    /// Forum-side collaborator (users, topics, posts, delivery log).
    pub forum: Arc<dyn Forum>,

    /// Attachment storage collaborator.
    pub uploader: Arc<dyn Uploader>,

    /// Config-derived patterns, compiled once per pattern string.
    regex_cache: Mutex<HashMap<String, Arc<Regex>>>,
}

impl std::fmt::Debug for InnerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerContext")
            .field("sql", &self.sql)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Creates a context over the given database file and opens it.
    pub async fn new(
        dbfile: PathBuf,
        forum: Arc<dyn Forum>,
        uploader: Arc<dyn Uploader>,
    ) -> Result<Context> {
        ensure!(
            !dbfile.as_os_str().is_empty(),
            "database file path must not be empty"
        );
        let context = Context {
            inner: Arc::new(InnerContext {
                sql: Sql::new(dbfile),
                events: Events::new(),
                forum,
                uploader,
                regex_cache: Mutex::new(HashMap::new()),
            }),
        };
        context
            .sql
            .open(&context)
            .await
            .context("failed to open database")?;
        Ok(context)
    }

    /// Emits a single event.
    pub fn emit_event(&self, event: Event) {
        self.events.emit(event);
    }

    /// Returns a receiver for the context's events.
    pub fn get_event_emitter(&self) -> EventEmitter {
        self.events.get_emitter()
    }

    /// Stops all ongoing work and closes the database.
    pub async fn stop_io(&self) {
        self.sql.close().await;
    }

    /// Returns the compiled form of a config-derived pattern.
    ///
    /// Patterns change rarely but are consulted for every message, so
    /// they are compiled once per pattern string for the lifetime of the
    /// context.
    pub(crate) fn compiled_regex(&self, pattern: &str) -> Result<Arc<Regex>> {
        let mut cache = self.regex_cache.lock().expect("poisoned regex cache");
        if let Some(re) = cache.get(pattern) {
            return Ok(re.clone());
        }
        let re = Arc::new(Regex::new(pattern).context("invalid configured pattern")?);
        cache.insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}
