//! Storage engine facade
//!
//! [`Store`] owns the SQLite connection and ties together identifier
//! resolution, the flag engine, delivery, the external store and update
//! propagation. Calls are synchronous and blocking; concurrency comes from
//! independent callers on their own transactions, serialized by SQLite's
//! single-writer model plus the configured busy timeout.

mod fetch;
mod flagops;
pub(crate) mod headers;
mod mailboxes;
mod messages;
pub(crate) mod resolve;
mod search;
mod users;

pub use resolve::SetKind;
pub use search::{SearchCriteria, SortField, SortKey};

pub(crate) use mailboxes::mailbox_id_by_name;
pub(crate) use messages::{allocate_uids, StagedBody};
pub(crate) use users::user_id_by_name;

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::config::StoreConfig;
use crate::dialect::Dialect;
use crate::error::{Result, SqlCtx};
use crate::extstore::{ExtKey, ExternalStore};
use crate::schema;
use crate::stmt::StmtCache;
use crate::updates::{Update, UpdateSink};

/// Randomness source for UID-validity generation. Injected so tests can
/// supply deterministic sequences.
pub trait UidValiditySource: Send + Sync {
    fn next(&self) -> u32;
}

/// Default source backed by the thread-local RNG.
pub struct RandomUidValidity;

impl UidValiditySource for RandomUidValidity {
    fn next(&self) -> u32 {
        rand::random()
    }
}

/// The mailbox storage engine.
pub struct Store {
    pub(crate) conn: Mutex<Connection>,
    pub(crate) dialect: Dialect,
    pub(crate) stmts: StmtCache,
    pub(crate) config: StoreConfig,
    pub(crate) ext: Option<Arc<dyn ExternalStore>>,
    pub(crate) uid_validity: Box<dyn UidValiditySource>,
    pub(crate) sink: Option<UpdateSink>,
}

impl Store {
    /// Open (and migrate) a database file.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).ctx("open")?;
        Self::init(conn, config)
    }

    /// In-memory database, mainly for tests.
    pub fn open_in_memory(config: StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().ctx("open")?;
        Self::init(conn, config)
    }

    fn init(mut conn: Connection, config: StoreConfig) -> Result<Self> {
        let journal_mode = match config.journal_mode.to_ascii_uppercase().as_str() {
            m @ ("DELETE" | "TRUNCATE" | "PERSIST" | "MEMORY" | "WAL" | "OFF") => m.to_string(),
            other => {
                log::warn!("unknown journal mode {:?}, falling back to WAL", other);
                "WAL".to_string()
            }
        };
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = {};\n\
             PRAGMA synchronous = NORMAL;\n\
             PRAGMA busy_timeout = {};\n\
             PRAGMA cache_size = -{};\n\
             PRAGMA foreign_keys = ON;",
            journal_mode, config.busy_timeout_ms, config.cache_size_kib,
        ))
        .ctx("configure")?;

        schema::check_version(&conn)?;
        schema::migrations().to_latest(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            dialect: Dialect::Sqlite,
            stmts: StmtCache::new(),
            config,
            ext: None,
            uid_validity: Box::new(RandomUidValidity),
            sink: None,
        })
    }

    /// Store message bodies in `ext` instead of inline BLOB columns.
    pub fn with_external_store(mut self, ext: Arc<dyn ExternalStore>) -> Self {
        self.ext = Some(ext);
        self
    }

    /// Publish change events into `sink` after each commit.
    pub fn with_update_sink(mut self, sink: UpdateSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the UID-validity randomness source.
    pub fn with_uid_validity_source(mut self, source: Box<dyn UidValiditySource>) -> Self {
        self.uid_validity = source;
        self
    }

    /// Send buffered events. Called strictly after commit.
    pub(crate) fn publish(&self, updates: Vec<Update>) {
        if updates.is_empty() {
            return;
        }
        if let Some(sink) = &self.sink {
            sink.publish(updates);
        }
    }

    /// Remove external objects whose refcount reached zero. Called strictly
    /// after the decrementing transaction committed, since physical
    /// deletion cannot be rolled back.
    pub(crate) fn remove_objects(&self, keys: &[ExtKey]) {
        if keys.is_empty() {
            return;
        }
        match &self.ext {
            Some(ext) => {
                if let Err(e) = ext.delete(keys) {
                    log::warn!("failed to remove {} external object(s): {}", keys.len(), e);
                }
            }
            None => log::warn!(
                "{} unreferenced external key(s) but no external store configured",
                keys.len()
            ),
        }
    }
}

/// Decrement the refcounts of every external key referenced by message rows
/// matched by `msg_where` (a predicate over alias `m`, using numbered
/// placeholders so `params` can bind into both embedded copies). Key rows
/// that reach zero are deleted; the orphaned keys are returned so the caller
/// can remove the physical objects after commit.
///
/// Panics if any refcount goes negative: counts are only ever mutated in
/// the same transaction as the referencing rows, so a negative value means
/// the storage is inconsistent.
pub(crate) fn deref_ext_keys(
    tx: &Connection,
    msg_where: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<ExtKey>> {
    let sql = format!(
        "UPDATE ext_keys SET refs = refs - \
             (SELECT COUNT(*) FROM messages m WHERE {w} AND m.ext_key = ext_keys.key) \
         WHERE key IN \
             (SELECT m.ext_key FROM messages m WHERE {w} AND m.ext_key IS NOT NULL)",
        w = msg_where
    );
    tx.execute(&sql, params).ctx("deref_ext_keys")?;

    let mut stmt = tx
        .prepare_cached("SELECT key, refs FROM ext_keys WHERE refs <= 0")
        .ctx("deref_ext_keys")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .ctx("deref_ext_keys")?;

    let mut orphaned = Vec::new();
    for row in rows {
        let (key, refs) = row.ctx("deref_ext_keys")?;
        if refs < 0 {
            panic!(
                "external key {} has refcount {}, storage is inconsistent",
                key, refs
            );
        }
        orphaned.push(ExtKey::from(key));
    }

    if !orphaned.is_empty() {
        tx.execute("DELETE FROM ext_keys WHERE refs <= 0", [])
            .ctx("deref_ext_keys")?;
    }
    Ok(orphaned)
}
