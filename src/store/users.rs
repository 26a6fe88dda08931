//! User account operations

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use crate::error::{is_constraint, Error, Result, SqlCtx};
use crate::models::{User, INBOX_NAME};

use super::{deref_ext_keys, Store};

/// Resolve a username (case-insensitively) to its row id.
pub(crate) fn user_id_by_name(conn: &Connection, username: &str) -> Result<i64> {
    conn.query_row(
        "SELECT id FROM users WHERE username = ?1",
        [username],
        |row| row.get(0),
    )
    .optional()
    .ctx("lookup_user")?
    .ok_or_else(|| Error::UserNotFound(username.to_string()))
}

impl Store {
    /// Create a user account together with its INBOX.
    pub fn create_user(&self, username: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .ctx("create_user")?;

        match tx.execute("INSERT INTO users (username) VALUES (?1)", [username]) {
            Err(e) if is_constraint(&e) => {
                return Err(Error::UserAlreadyExists(username.to_string()))
            }
            other => {
                other.ctx("create_user")?;
            }
        }
        let user_id = tx.last_insert_rowid();
        self.insert_mailbox_row(&tx, user_id, INBOX_NAME, None)?;

        tx.commit().ctx("create_user")?;
        log::info!("created user {}", username);
        Ok(())
    }

    /// Look up a user. Usernames compare case-insensitively.
    pub fn get_user(&self, username: &str) -> Result<User> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, msg_size_limit FROM users WHERE username = ?1",
            [username],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    msg_size_limit: row.get(2)?,
                })
            },
        )
        .optional()
        .ctx("get_user")?
        .ok_or_else(|| Error::UserNotFound(username.to_string()))
    }

    pub fn user_exists(&self, username: &str) -> Result<bool> {
        match self.get_user(username) {
            Ok(_) => Ok(true),
            Err(Error::UserNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// All usernames, in their original casing.
    pub fn list_users(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached("SELECT username FROM users ORDER BY username")
            .ctx("list_users")?;
        let users = stmt
            .query_map([], |row| row.get(0))
            .ctx("list_users")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .ctx("list_users")?;
        Ok(users)
    }

    /// Delete a user, all their mailboxes and messages, and dereference
    /// every external body those messages pointed at.
    pub fn delete_user(&self, username: &str) -> Result<()> {
        let orphaned = {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .ctx("delete_user")?;

            let user_id = user_id_by_name(&tx, username)?;
            let orphaned = deref_ext_keys(
                &tx,
                "m.mailbox_id IN (SELECT id FROM mailboxes WHERE user_id = ?1)",
                &[&user_id],
            )?;
            tx.execute("DELETE FROM users WHERE id = ?1", [user_id])
                .ctx("delete_user")?;

            tx.commit().ctx("delete_user")?;
            orphaned
        };

        self.remove_objects(&orphaned);
        log::info!("deleted user {}", username);
        Ok(())
    }

    /// Set or clear the per-user message size limit.
    pub fn set_user_msg_size_limit(&self, username: &str, limit: Option<u32>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE users SET msg_size_limit = ?2 WHERE username = ?1",
                rusqlite::params![username, limit],
            )
            .ctx("set_user_msg_size_limit")?;
        if changed == 0 {
            return Err(Error::UserNotFound(username.to_string()));
        }
        Ok(())
    }
}
