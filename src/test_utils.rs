//! Utilities to help writing tests.
//!
//! All of the code in this module is only compiled for test binaries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use crate::context::Context;
use crate::forum::{
    Category, CreateResult, CreatedPost, EmailLogEntry, Forum, Group, LikeOutcome, NewPost,
    PostDestination, TopicState, Upload, Uploader, User,
};

/// A Context and fakes for the forum-side collaborators, wired together.
#[derive(Debug)]
pub struct TestContext {
    pub ctx: Context,
    pub forum: Arc<TestForum>,
    pub uploader: Arc<TestUploader>,
    /// Keeps the database directory alive.
    _dir: TempDir,
}

impl TestContext {
    /// Creates a new test context with an empty forum.
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let forum = Arc::new(TestForum::default());
        let uploader = Arc::new(TestUploader::default());
        let ctx = Context::new(
            dir.path().join("mailroom.db"),
            forum.clone(),
            uploader.clone(),
        )
        .await
        .expect("open context");
        Self {
            ctx,
            forum,
            uploader,
            _dir: dir,
        }
    }

    /// Drains the event queue and returns the last warning, panicking if
    /// none was emitted.
    pub fn pop_warning(&self) -> String {
        let emitter = self.ctx.get_event_emitter();
        let mut last = None;
        while let Some(event) = emitter.try_recv() {
            if let crate::EventType::Warning(msg) = event {
                last = Some(msg);
            }
        }
        last.expect("no warning was emitted")
    }
}

/// Builds a minimal raw mail.
pub fn raw_mail(from: &str, subject: &str, to: &str, body: &str) -> Vec<u8> {
    raw_mail_with_headers(from, subject, to, "", body)
}

/// Builds a raw mail with extra header lines.
pub fn raw_mail_with_headers(
    from: &str,
    subject: &str,
    to: &str,
    extra_headers: &str,
    body: &str,
) -> Vec<u8> {
    let mut mail = format!(
        "From: {from}\n\
         To: {to}\n\
         Subject: {subject}\n\
         Date: Sun, 22 Mar 2026 22:37:55 +0000\n\
         Message-ID: <{}@mail.example>\n",
        crate::tools::create_id().to_lowercase()
    );
    if !extra_headers.is_empty() {
        mail.push_str(extra_headers.trim_end());
        mail.push('\n');
    }
    mail.push('\n');
    mail.push_str(body);
    mail.into_bytes()
}

#[derive(Debug, Default)]
struct ForumState {
    users: Vec<User>,
    next_user_id: i64,
    groups: Vec<Group>,
    categories: Vec<Category>,
    reply_keys: HashMap<String, EmailLogEntry>,
    bounce_keys: HashMap<String, EmailLogEntry>,
    bounced_log_ids: Vec<i64>,
    topics: HashMap<i64, TopicState>,
    next_topic_id: i64,
    next_post_id: i64,
    posts_per_topic: HashMap<i64, i64>,
    posts: Vec<RecordedPost>,
    likes: Vec<(i64, i64)>,
    unsubscribed: Vec<i64>,
    revoked: Vec<String>,
    blocked: HashSet<String>,
    invites: Vec<(i64, i64, i64)>,
    reject_next_post: Option<Vec<String>>,
}

/// A post as the fake forum recorded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPost {
    pub topic_id: i64,
    pub post_id: i64,
    pub post_number: i64,
    pub user_id: i64,
    pub title: Option<String>,
    pub raw: String,
    pub destination: PostDestination,
    pub created_at: i64,
}

/// Recording in-memory implementation of [`Forum`].
#[derive(Debug, Default)]
pub struct TestForum {
    state: Mutex<ForumState>,
}

impl TestForum {
    fn lock(&self) -> std::sync::MutexGuard<'_, ForumState> {
        self.state.lock().expect("poisoned forum state")
    }

    pub fn add_user(&self, email: &str, username: &str, trust_level: i64) -> User {
        let mut state = self.lock();
        state.next_user_id += 1;
        let user = User {
            id: state.next_user_id,
            username: username.to_string(),
            email: email.to_lowercase(),
            staged: false,
            active: true,
            suspended: false,
            trust_level,
        };
        state.users.push(user.clone());
        user
    }

    pub fn deactivate(&self, username: &str) {
        let mut state = self.lock();
        if let Some(user) = state.users.iter_mut().find(|u| u.username == username) {
            user.active = false;
        }
    }

    pub fn suspend(&self, username: &str) {
        let mut state = self.lock();
        if let Some(user) = state.users.iter_mut().find(|u| u.username == username) {
            user.suspended = true;
        }
    }

    pub fn stage(&self, username: &str) {
        let mut state = self.lock();
        if let Some(user) = state.users.iter_mut().find(|u| u.username == username) {
            user.staged = true;
        }
    }

    pub fn add_group(&self, name: &str, incoming_email: &str) -> Group {
        let mut state = self.lock();
        let group = Group {
            id: state.groups.len() as i64 + 1,
            name: name.to_string(),
            incoming_email: incoming_email.to_lowercase(),
        };
        state.groups.push(group.clone());
        group
    }

    pub fn add_category(&self, name: &str, incoming_email: &str, allow_strangers: bool) -> Category {
        let mut state = self.lock();
        let category = Category {
            id: state.categories.len() as i64 + 100,
            name: name.to_string(),
            incoming_email: incoming_email.to_lowercase(),
            email_in_allow_strangers: allow_strangers,
        };
        state.categories.push(category.clone());
        category
    }

    pub fn add_topic(&self, topic_id: i64, topic_state: TopicState) {
        let mut state = self.lock();
        state.topics.insert(topic_id, topic_state);
        state.posts_per_topic.entry(topic_id).or_insert(1);
    }

    pub fn add_reply_key(&self, key: &str, user_id: i64, to_address: &str, topic_id: i64, post_id: i64) {
        let mut state = self.lock();
        let id = state.reply_keys.len() as i64 + 1_000;
        state.reply_keys.insert(
            key.to_string(),
            EmailLogEntry {
                id,
                user_id,
                to_address: to_address.to_lowercase(),
                topic_id,
                post_id,
                bounced: false,
            },
        );
    }

    pub fn add_bounce_key(&self, key: &str, user_id: i64, to_address: &str) {
        let mut state = self.lock();
        let id = state.bounce_keys.len() as i64 + 2_000;
        state.bounce_keys.insert(
            key.to_string(),
            EmailLogEntry {
                id,
                user_id,
                to_address: to_address.to_lowercase(),
                topic_id: 0,
                post_id: 0,
                bounced: false,
            },
        );
    }

    pub fn block_address(&self, addr: &str) {
        self.lock().blocked.insert(addr.to_lowercase());
    }

    pub fn reject_next_post(&self, errors: Vec<String>) {
        self.lock().reject_next_post = Some(errors);
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.lock().posts.clone()
    }

    pub fn likes(&self) -> Vec<(i64, i64)> {
        self.lock().likes.clone()
    }

    pub fn unsubscribed_users(&self) -> Vec<i64> {
        self.lock().unsubscribed.clone()
    }

    pub fn revoked_addresses(&self) -> Vec<String> {
        self.lock().revoked.clone()
    }

    pub fn invites(&self) -> Vec<(i64, i64, i64)> {
        self.lock().invites.clone()
    }

    pub fn bounced_log_ids(&self) -> Vec<i64> {
        self.lock().bounced_log_ids.clone()
    }

    pub fn users(&self) -> Vec<User> {
        self.lock().users.clone()
    }
}

#[async_trait]
impl Forum for TestForum {
    async fn user_by_email(&self, addr: &str) -> Result<Option<User>> {
        let state = self.lock();
        Ok(state.users.iter().find(|u| u.email == addr).cloned())
    }

    async fn create_staged_user(&self, addr: &str, username: &str) -> Result<User> {
        let mut state = self.lock();
        if state.users.iter().any(|u| u.username == username) {
            bail!("username {username:?} is taken");
        }
        state.next_user_id += 1;
        let user = User {
            id: state.next_user_id,
            username: username.to_string(),
            email: addr.to_lowercase(),
            staged: true,
            active: true,
            suspended: false,
            trust_level: 0,
        };
        state.users.push(user.clone());
        Ok(user)
    }

    async fn should_block(&self, addr: &str) -> Result<bool> {
        Ok(self.lock().blocked.contains(&addr.to_lowercase()))
    }

    async fn group_by_email(&self, addr: &str) -> Result<Option<Group>> {
        let state = self.lock();
        Ok(state
            .groups
            .iter()
            .find(|g| g.incoming_email == addr)
            .cloned())
    }

    async fn category_by_email(&self, addr: &str) -> Result<Option<Category>> {
        let state = self.lock();
        Ok(state
            .categories
            .iter()
            .find(|c| c.incoming_email == addr)
            .cloned())
    }

    async fn email_log_by_reply_key(&self, key: &str) -> Result<Option<EmailLogEntry>> {
        Ok(self.lock().reply_keys.get(key).cloned())
    }

    async fn email_log_by_bounce_key(&self, key: &str) -> Result<Option<EmailLogEntry>> {
        Ok(self.lock().bounce_keys.get(key).cloned())
    }

    async fn mark_email_log_bounced(&self, entry_id: i64) -> Result<()> {
        let mut state = self.lock();
        for entry in state.bounce_keys.values_mut() {
            if entry.id == entry_id {
                entry.bounced = true;
            }
        }
        state.bounced_log_ids.push(entry_id);
        Ok(())
    }

    async fn topic_state(&self, topic_id: i64) -> Result<Option<TopicState>> {
        Ok(self.lock().topics.get(&topic_id).copied())
    }

    async fn create_post(&self, post: NewPost) -> Result<CreateResult> {
        let mut state = self.lock();
        if let Some(errors) = state.reject_next_post.take() {
            return Ok(CreateResult::Rejected(errors));
        }

        let topic_id = match post.destination {
            PostDestination::Topic(topic_id) => topic_id,
            PostDestination::Category(_) | PostDestination::Group(_) => {
                state.next_topic_id += 1;
                let topic_id = 500 + state.next_topic_id;
                state.topics.insert(topic_id, TopicState::Open);
                topic_id
            }
        };
        let post_number = {
            let counter = state.posts_per_topic.entry(topic_id).or_insert(0);
            *counter += 1;
            *counter
        };
        state.next_post_id += 1;
        let post_id = 9_000 + state.next_post_id;
        let created = CreatedPost {
            topic_id,
            post_id,
            post_number,
        };
        state.posts.push(RecordedPost {
            topic_id,
            post_id,
            post_number,
            user_id: post.user_id,
            title: post.title,
            raw: post.raw,
            destination: post.destination,
            created_at: post.created_at,
        });
        Ok(CreateResult::Created(created))
    }

    async fn like_post(&self, post_id: i64, user_id: i64) -> Result<LikeOutcome> {
        let mut state = self.lock();
        if state.likes.contains(&(post_id, user_id)) {
            return Ok(LikeOutcome::AlreadyActed);
        }
        state.likes.push((post_id, user_id));
        Ok(LikeOutcome::Recorded)
    }

    async fn unsubscribe(&self, user_id: i64) -> Result<()> {
        self.lock().unsubscribed.push(user_id);
        Ok(())
    }

    async fn revoke_email(&self, addr: &str) -> Result<()> {
        self.lock().revoked.push(addr.to_string());
        Ok(())
    }

    async fn invite_to_conversation(
        &self,
        topic_id: i64,
        inviter_id: i64,
        invitee_id: i64,
    ) -> Result<()> {
        self.lock().invites.push((topic_id, inviter_id, invitee_id));
        Ok(())
    }
}

/// Recording in-memory implementation of [`Uploader`].
#[derive(Debug, Default)]
pub struct TestUploader {
    uploads: Mutex<Vec<(String, usize, bool)>>,
    fail_next: AtomicBool,
}

impl TestUploader {
    /// Makes the next upload call fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> Vec<(String, usize, bool)> {
        self.uploads.lock().expect("poisoned uploads").clone()
    }
}

#[async_trait]
impl Uploader for TestUploader {
    async fn upload(
        &self,
        _user_id: i64,
        filename: &str,
        data: &[u8],
        for_group_message: bool,
    ) -> Result<Upload> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            bail!("upload backend unavailable");
        }
        let mut uploads = self.uploads.lock().expect("poisoned uploads");
        uploads.push((filename.to_string(), data.len(), for_group_message));
        Ok(Upload {
            id: uploads.len() as i64,
            url: format!("/uploads/{}/{filename}", uploads.len()),
        })
    }
}
