//! Versioned schema creation and upgrade
//!
//! Migrations are forward-only and tracked through the user_version
//! pragma. A database written by a newer release refuses to open.

use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};

use crate::error::{Error, Result, SqlCtx};

/// Highest schema version this build understands.
pub(crate) const SCHEMA_VERSION: u32 = 1;

pub(crate) fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: initial schema
        M::up(
            r#"
            CREATE TABLE users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE COLLATE NOCASE,
                msg_size_limit INTEGER
            );

            CREATE TABLE mailboxes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                subscribed INTEGER NOT NULL DEFAULT 1,
                marked INTEGER NOT NULL DEFAULT 0,
                uid_next INTEGER NOT NULL DEFAULT 1,
                uid_validity INTEGER NOT NULL,
                msg_size_limit INTEGER,
                special_use TEXT,
                UNIQUE (user_id, name)
            );

            -- uid is assigned from mailboxes.uid_next and never reused.
            -- mark is transaction-scoped scratch for batch selection; it is
            -- always 0 outside a transaction.
            CREATE TABLE messages (
                mailbox_id INTEGER NOT NULL REFERENCES mailboxes(id) ON DELETE CASCADE,
                uid INTEGER NOT NULL,
                internal_date INTEGER NOT NULL,
                header_len INTEGER NOT NULL,
                header BLOB,
                body_len INTEGER NOT NULL,
                ext_key TEXT,
                body BLOB,
                body_structure BLOB,
                cached_headers BLOB,
                mark INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (mailbox_id, uid)
            );

            CREATE INDEX idx_messages_mark ON messages(mailbox_id, mark);
            CREATE INDEX idx_messages_ext_key ON messages(ext_key)
                WHERE ext_key IS NOT NULL;

            CREATE TABLE flags (
                mailbox_id INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                flag TEXT NOT NULL,
                PRIMARY KEY (mailbox_id, uid, flag),
                FOREIGN KEY (mailbox_id, uid) REFERENCES messages(mailbox_id, uid)
                    ON DELETE CASCADE ON UPDATE CASCADE
            );

            CREATE INDEX idx_flags_by_flag ON flags(mailbox_id, flag);

            CREATE TABLE ext_keys (
                key TEXT PRIMARY KEY,
                refs INTEGER NOT NULL
            );
            "#,
        ),
    ])
}

/// Fail fast when the database was created by a newer release. Must run
/// before `migrations().to_latest`, which only knows how to go forward.
pub(crate) fn check_version(conn: &Connection) -> Result<()> {
    let found: u32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .ctx("schema_version")?;
    if found > SCHEMA_VERSION {
        return Err(Error::SchemaTooNew {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    Ok(())
}
