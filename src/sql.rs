//! # SQLite wrapper.
//!
//! Owns the pipeline's three tables: `config` (runtime settings),
//! `incoming_emails` (one row per processed message) and `kv` (expiring
//! key-value entries used for bounce-score accounting).

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use async_channel::{Receiver, Sender};
use rusqlite::{Connection, OpenFlags};
use tokio::sync::RwLock;

use crate::context::Context;

/// Number of pooled connections.
const POOL_SIZE: usize = 3;

/// A wrapper around the underlying Sqlite3 object.
#[derive(Debug)]
pub struct Sql {
    /// Database file path.
    pub(crate) dbfile: PathBuf,

    /// None if the database is not opened.
    pool: RwLock<Option<Pool>>,
}

/// Connection pool: connections are parked in a bounded channel and
/// handed out awaiting-fair; the guard returns them on drop.
#[derive(Debug, Clone)]
struct Pool {
    sender: Sender<Connection>,
    receiver: Receiver<Connection>,
}

/// Pooled connection, deref's to [`rusqlite::Connection`].
struct PooledConnection {
    sender: Sender<Connection>,
    conn: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // The channel is bounded to the pool size, this cannot be full.
            let _ = self.sender.try_send(conn);
        }
    }
}

impl Sql {
    /// Creates new SQL database.
    pub fn new(dbfile: PathBuf) -> Sql {
        Self {
            dbfile,
            pool: RwLock::new(None),
        }
    }

    /// Returns true if the database is open.
    pub async fn is_open(&self) -> bool {
        self.pool.read().await.is_some()
    }

    /// Closes all underlying Sqlite connections.
    pub(crate) async fn close(&self) {
        let _ = self.pool.write().await.take();
        // Drop closes the channel and with it the parked connections.
    }

    /// Opens the database and runs the migrations.
    pub async fn open(&self, context: &Context) -> Result<()> {
        let mut lock = self.pool.write().await;
        if lock.is_some() {
            bail!("database is already open");
        }

        let (sender, receiver) = async_channel::bounded(POOL_SIZE);
        for _ in 0..POOL_SIZE {
            let conn = new_connection(&self.dbfile)?;
            sender
                .try_send(conn)
                .map_err(|_| anyhow::anyhow!("failed to fill connection pool"))?;
        }
        *lock = Some(Pool { sender, receiver });
        drop(lock);

        crate::sql::migrations::run(context, self)
            .await
            .context("failed to run migrations")?;

        Ok(())
    }

    async fn conn(&self) -> Result<PooledConnection> {
        let lock = self.pool.read().await;
        let pool = lock.as_ref().context("no database connection")?.clone();
        drop(lock);

        let conn = pool.receiver.recv().await?;
        Ok(PooledConnection {
            sender: pool.sender,
            conn: Some(conn),
        })
    }

    /// Allows to call a function `g` on the database connection.
    pub async fn call<G, H>(&self, g: G) -> Result<H>
    where
        G: FnOnce(&mut Connection) -> Result<H> + Send,
        H: Send,
    {
        let mut conn = self.conn().await?;
        g(&mut conn)
    }

    /// Execute `statement`, returning the number of affected rows.
    pub async fn execute(
        &self,
        statement: &str,
        params: impl rusqlite::Params + Send,
    ) -> Result<usize> {
        let conn = self.conn().await?;
        let count = conn.execute(statement, params)?;
        Ok(count)
    }

    /// Executes statement and returns the rowid of the last inserted row.
    pub async fn insert(
        &self,
        statement: &str,
        params: impl rusqlite::Params + Send,
    ) -> Result<i64> {
        let conn = self.conn().await?;
        conn.execute(statement, params)?;
        Ok(conn.last_insert_rowid())
    }

    /// Executes a query which is expected to return one row.
    pub async fn query_row<T, F>(
        &self,
        statement: &str,
        params: impl rusqlite::Params + Send,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&rusqlite::Row) -> rusqlite::Result<T> + Send,
        T: Send,
    {
        let conn = self.conn().await?;
        let res = conn.query_row(statement, params, f)?;
        Ok(res)
    }

    /// Executes a query which is expected to return zero or one row.
    pub async fn query_row_optional<T, F>(
        &self,
        statement: &str,
        params: impl rusqlite::Params + Send,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(&rusqlite::Row) -> rusqlite::Result<T> + Send,
        T: Send,
    {
        use rusqlite::OptionalExtension;

        let conn = self.conn().await?;
        let res = conn.query_row(statement, params, f).optional()?;
        Ok(res)
    }

    /// Executes a query which is expected to return zero or one value.
    pub async fn query_get_value<T>(
        &self,
        statement: &str,
        params: impl rusqlite::Params + Send,
    ) -> Result<Option<T>>
    where
        T: rusqlite::types::FromSql + Send,
    {
        self.query_row_optional(statement, params, |row| row.get(0))
            .await
    }

    /// Returns true if a query returns at least one row.
    pub async fn exists(
        &self,
        statement: &str,
        params: impl rusqlite::Params + Send,
    ) -> Result<bool> {
        let count: i64 = self
            .query_row(statement, params, |row| row.get(0))
            .await?;
        Ok(count > 0)
    }

    /// Runs `f` inside a transaction; committed when `f` returns `Ok`.
    pub async fn transaction<G, H>(&self, callback: G) -> Result<H>
    where
        G: FnOnce(&mut rusqlite::Transaction<'_>) -> Result<H> + Send,
        H: Send,
    {
        let mut conn = self.conn().await?;
        let mut transaction = conn.transaction()?;
        let ret = callback(&mut transaction);

        match ret {
            Ok(ret) => {
                transaction.commit()?;
                Ok(ret)
            }
            Err(err) => {
                transaction.rollback()?;
                Err(err)
            }
        }
    }

    /// Returns true if the given table exists.
    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        self.exists(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
            (name,),
        )
        .await
    }

    /// Reads a value from the `config` table.
    pub async fn get_raw_config(&self, key: &str) -> Result<Option<String>> {
        self.query_get_value("SELECT value FROM config WHERE keyname=?", (key,))
            .await
    }

    /// Writes or deletes a value in the `config` table.
    pub async fn set_raw_config(&self, key: &str, value: Option<&str>) -> Result<()> {
        if let Some(value) = value {
            self.execute(
                "INSERT OR REPLACE INTO config (keyname, value) VALUES (?, ?)",
                (key, value),
            )
            .await?;
        } else {
            self.execute("DELETE FROM config WHERE keyname=?", (key,))
                .await?;
        }
        Ok(())
    }

    /// Reads an i64 from the `config` table.
    pub async fn get_raw_config_int(&self, key: &str) -> Result<Option<i64>> {
        Ok(self
            .get_raw_config(key)
            .await?
            .and_then(|s| s.parse().ok()))
    }
}

fn new_connection(dbfile: &Path) -> Result<Connection> {
    let mut flags = OpenFlags::SQLITE_OPEN_NO_MUTEX;
    flags.insert(OpenFlags::SQLITE_OPEN_READ_WRITE);
    flags.insert(OpenFlags::SQLITE_OPEN_CREATE);

    let conn = Connection::open_with_flags(dbfile, flags)?;
    conn.busy_timeout(std::time::Duration::from_secs(10))?;
    // journal_mode returns a row, it cannot go through execute_batch.
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    conn.execute_batch(
        "PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(conn)
}

pub(crate) mod migrations {
    use super::*;

    const VERSION_CFG: &str = "dbversion";

    pub async fn run(context: &Context, sql: &Sql) -> Result<()> {
        if !sql.table_exists("config").await? {
            info!(context, "First time init: creating tables");
            sql.transaction(|transaction| {
                transaction.execute_batch(
                    "CREATE TABLE config (
                       id INTEGER PRIMARY KEY,
                       keyname TEXT UNIQUE,
                       value TEXT NOT NULL
                     );
                     CREATE INDEX config_index1 ON config (keyname);",
                )?;
                transaction.execute(
                    "INSERT INTO config (keyname, value) VALUES (?, ?)",
                    (VERSION_CFG, "0"),
                )?;
                Ok(())
            })
            .await?;
        }

        let dbversion = sql
            .get_raw_config_int(VERSION_CFG)
            .await?
            .unwrap_or_default();

        if dbversion < 1 {
            info!(context, "[migration] v1");
            sql.execute_migration(
                "CREATE TABLE incoming_emails (
                   id INTEGER PRIMARY KEY AUTOINCREMENT,
                   message_id TEXT NOT NULL UNIQUE,
                   raw BLOB NOT NULL DEFAULT x'',
                   subject TEXT NOT NULL DEFAULT '',
                   from_addr TEXT NOT NULL DEFAULT '',
                   to_addrs TEXT NOT NULL DEFAULT '',
                   cc_addrs TEXT NOT NULL DEFAULT '',
                   user_id INTEGER,
                   topic_id INTEGER,
                   post_id INTEGER,
                   post_number INTEGER,
                   is_bounce INTEGER NOT NULL DEFAULT 0,
                   is_auto_generated INTEGER NOT NULL DEFAULT 0,
                   error TEXT,
                   created_at INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE INDEX incoming_emails_index1 ON incoming_emails (message_id);
                 CREATE INDEX incoming_emails_index2 ON incoming_emails (from_addr);",
                1,
            )
            .await?;
        }
        if dbversion < 2 {
            info!(context, "[migration] v2");
            sql.execute_migration(
                "CREATE TABLE kv (
                   key TEXT PRIMARY KEY,
                   value TEXT NOT NULL DEFAULT '',
                   expires INTEGER NOT NULL DEFAULT 0
                 );",
                2,
            )
            .await?;
        }

        Ok(())
    }

    impl Sql {
        pub(crate) async fn execute_migration(
            &self,
            statement: &str,
            version: i64,
        ) -> Result<()> {
            self.transaction(move |transaction| {
                transaction.execute_batch(statement)?;
                transaction.execute(
                    "UPDATE config SET value=? WHERE keyname=?",
                    (version.to_string(), VERSION_CFG),
                )?;
                Ok(())
            })
            .await
            .with_context(|| format!("execute_migration failed for version {version}"))
        }
    }
}
