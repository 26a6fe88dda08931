//! Mailbox operations

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};

use crate::error::{is_constraint, Error, Result, SqlCtx};
use crate::models::{
    Mailbox, MailboxStatus, SpecialUse, INBOX_NAME, MAILBOX_PATH_SEP, RECENT_FLAG, SEEN_FLAG,
};

use super::{deref_ext_keys, users::user_id_by_name, Store};

/// Resolve a mailbox name to its row id.
pub(crate) fn mailbox_id_by_name(conn: &Connection, user_id: i64, name: &str) -> Result<i64> {
    conn.query_row(
        "SELECT id FROM mailboxes WHERE user_id = ?1 AND name = ?2",
        rusqlite::params![user_id, name],
        |row| row.get(0),
    )
    .optional()
    .ctx("lookup_mailbox")?
    .ok_or_else(|| Error::MailboxNotFound(name.to_string()))
}

fn mailbox_from_row(row: &Row) -> rusqlite::Result<Mailbox> {
    let special: Option<String> = row.get(8)?;
    Ok(Mailbox {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        subscribed: row.get(3)?,
        marked: row.get(4)?,
        uid_next: row.get::<_, i64>(5)? as u32,
        uid_validity: row.get::<_, i64>(6)? as u32,
        msg_size_limit: row.get(7)?,
        special_use: special.as_deref().and_then(SpecialUse::from_attr),
    })
}

const MAILBOX_COLS: &str =
    "id, user_id, name, subscribed, marked, uid_next, uid_validity, msg_size_limit, special_use";

impl Store {
    /// Insert one mailbox row with a fresh UID-validity value.
    pub(crate) fn insert_mailbox_row(
        &self,
        conn: &Connection,
        user_id: i64,
        name: &str,
        special_use: Option<SpecialUse>,
    ) -> Result<i64> {
        let validity = self.uid_validity.next();
        let res = conn.execute(
            "INSERT INTO mailboxes (user_id, name, uid_validity, special_use) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                user_id,
                name,
                validity as i64,
                special_use.map(|s| s.as_str())
            ],
        );
        match res {
            Err(e) if is_constraint(&e) => Err(Error::MailboxAlreadyExists(name.to_string())),
            other => {
                other.ctx("insert_mailbox")?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    /// Auto-create every missing ancestor of `name`.
    pub(crate) fn ensure_parents(&self, conn: &Connection, user_id: i64, name: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO mailboxes (user_id, name, uid_validity) VALUES (?1, ?2, ?3) {}",
            self.dialect.upsert_ignore("user_id, name")
        );
        let mut stmt = conn.prepare_cached(&sql).ctx("ensure_parents")?;

        let mut prefix = String::new();
        let mut parts = name.split(MAILBOX_PATH_SEP).peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                break; // the leaf itself is handled by the caller
            }
            if !prefix.is_empty() {
                prefix.push(MAILBOX_PATH_SEP);
            }
            prefix.push_str(part);
            stmt.execute(rusqlite::params![
                user_id,
                &prefix,
                self.uid_validity.next() as i64
            ])
            .ctx("ensure_parents")?;
        }
        Ok(())
    }

    /// Create a mailbox, auto-creating missing parents.
    pub fn create_mailbox(&self, username: &str, name: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .ctx("create_mailbox")?;

        let user_id = user_id_by_name(&tx, username)?;
        self.ensure_parents(&tx, user_id, name)?;
        self.insert_mailbox_row(&tx, user_id, name, None)?;

        tx.commit().ctx("create_mailbox")?;
        log::debug!("created mailbox {} for {}", name, username);
        Ok(())
    }

    pub fn get_mailbox(&self, username: &str, name: &str) -> Result<Mailbox> {
        let conn = self.conn.lock().unwrap();
        let user_id = user_id_by_name(&conn, username)?;
        conn.query_row(
            &format!(
                "SELECT {} FROM mailboxes WHERE user_id = ?1 AND name = ?2",
                MAILBOX_COLS
            ),
            rusqlite::params![user_id, name],
            mailbox_from_row,
        )
        .optional()
        .ctx("get_mailbox")?
        .ok_or_else(|| Error::MailboxNotFound(name.to_string()))
    }

    /// All mailboxes of a user, ordered by name.
    pub fn list_mailboxes(&self, username: &str) -> Result<Vec<Mailbox>> {
        let conn = self.conn.lock().unwrap();
        let user_id = user_id_by_name(&conn, username)?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM mailboxes WHERE user_id = ?1 ORDER BY name",
                MAILBOX_COLS
            ))
            .ctx("list_mailboxes")?;
        let boxes = stmt
            .query_map([user_id], mailbox_from_row)
            .ctx("list_mailboxes")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .ctx("list_mailboxes")?;
        Ok(boxes)
    }

    /// Delete a mailbox and its messages. INBOX is protected.
    pub fn delete_mailbox(&self, username: &str, name: &str) -> Result<()> {
        if name.eq_ignore_ascii_case(INBOX_NAME) {
            return Err(Error::InboxProtected);
        }
        let orphaned = {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .ctx("delete_mailbox")?;

            let user_id = user_id_by_name(&tx, username)?;
            let mailbox_id = mailbox_id_by_name(&tx, user_id, name)?;
            let orphaned = deref_ext_keys(&tx, "m.mailbox_id = ?1", &[&mailbox_id])?;
            tx.execute("DELETE FROM mailboxes WHERE id = ?1", [mailbox_id])
                .ctx("delete_mailbox")?;

            tx.commit().ctx("delete_mailbox")?;
            orphaned
        };
        self.remove_objects(&orphaned);
        Ok(())
    }

    /// Rename a mailbox; children follow. Renaming INBOX moves its
    /// messages into the new mailbox and leaves a fresh, empty INBOX
    /// behind (UIDs and uid-next carry over so they are never reused).
    pub fn rename_mailbox(&self, username: &str, old: &str, new: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .ctx("rename_mailbox")?;

        let user_id = user_id_by_name(&tx, username)?;
        let old_id = mailbox_id_by_name(&tx, user_id, old)?;

        let taken: Option<i64> = tx
            .query_row(
                "SELECT id FROM mailboxes WHERE user_id = ?1 AND name = ?2",
                rusqlite::params![user_id, new],
                |row| row.get(0),
            )
            .optional()
            .ctx("rename_mailbox")?;
        if taken.is_some() {
            return Err(Error::MailboxAlreadyExists(new.to_string()));
        }

        self.ensure_parents(&tx, user_id, new)?;

        if old.eq_ignore_ascii_case(INBOX_NAME) {
            let new_id = self.insert_mailbox_row(&tx, user_id, new, None)?;
            tx.execute(
                "UPDATE mailboxes SET uid_next = \
                     (SELECT uid_next FROM mailboxes WHERE id = ?1) \
                 WHERE id = ?2",
                rusqlite::params![old_id, new_id],
            )
            .ctx("rename_mailbox")?;
            // Flag rows follow via ON UPDATE CASCADE.
            tx.execute(
                "UPDATE messages SET mailbox_id = ?1 WHERE mailbox_id = ?2",
                rusqlite::params![new_id, old_id],
            )
            .ctx("rename_mailbox")?;
        } else {
            tx.execute(
                "UPDATE mailboxes SET name = ?1 || substr(name, length(?2) + 1) \
                 WHERE user_id = ?3 AND \
                     (name = ?2 OR substr(name, 1, length(?2) + 1) = ?2 || ?4)",
                rusqlite::params![new, old, user_id, MAILBOX_PATH_SEP.to_string()],
            )
            .ctx("rename_mailbox")?;
        }

        tx.commit().ctx("rename_mailbox")?;
        Ok(())
    }

    pub fn set_subscribed(&self, username: &str, name: &str, subscribed: bool) -> Result<()> {
        self.update_mailbox_field(username, name, "subscribed", &subscribed)
    }

    /// Reset the new-arrivals marker, typically when a session selects the
    /// mailbox.
    pub fn clear_marked(&self, username: &str, name: &str) -> Result<()> {
        self.update_mailbox_field(username, name, "marked", &false)
    }

    /// Set or clear the per-mailbox message size limit.
    pub fn set_mailbox_msg_size_limit(
        &self,
        username: &str,
        name: &str,
        limit: Option<u32>,
    ) -> Result<()> {
        self.update_mailbox_field(username, name, "msg_size_limit", &limit)
    }

    /// Tag a mailbox with a special-use role (or clear it).
    pub fn set_special_use(
        &self,
        username: &str,
        name: &str,
        special_use: Option<SpecialUse>,
    ) -> Result<()> {
        self.update_mailbox_field(username, name, "special_use", &special_use.map(|s| s.as_str()))
    }

    /// Name of the mailbox carrying a special-use role, for resolution
    /// inside a caller-owned transaction.
    pub(crate) fn special_use_name(
        &self,
        conn: &Connection,
        user_id: i64,
        role: SpecialUse,
    ) -> Result<Option<String>> {
        conn.query_row(
            "SELECT name FROM mailboxes WHERE user_id = ?1 AND special_use = ?2",
            rusqlite::params![user_id, role.as_str()],
            |row| row.get(0),
        )
        .optional()
        .ctx("special_use_mailbox")
    }

    /// Find the mailbox carrying a special-use role, if any.
    pub fn special_use_mailbox(
        &self,
        username: &str,
        special_use: SpecialUse,
    ) -> Result<Option<Mailbox>> {
        let conn = self.conn.lock().unwrap();
        let user_id = user_id_by_name(&conn, username)?;
        conn.query_row(
            &format!(
                "SELECT {} FROM mailboxes WHERE user_id = ?1 AND special_use = ?2",
                MAILBOX_COLS
            ),
            rusqlite::params![user_id, special_use.as_str()],
            mailbox_from_row,
        )
        .optional()
        .ctx("special_use_mailbox")
    }

    /// STATUS counters. Recomputed per call; never cache the counts.
    pub fn mailbox_status(&self, username: &str, name: &str) -> Result<MailboxStatus> {
        let conn = self.conn.lock().unwrap();
        let user_id = user_id_by_name(&conn, username)?;
        let mailbox_id = mailbox_id_by_name(&conn, user_id, name)?;

        let (uid_next, uid_validity): (i64, i64) = conn
            .query_row(
                "SELECT uid_next, uid_validity FROM mailboxes WHERE id = ?1",
                [mailbox_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ctx("mailbox_status")?;
        let messages: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE mailbox_id = ?1",
                [mailbox_id],
                |row| row.get(0),
            )
            .ctx("mailbox_status")?;
        let recent: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM flags WHERE mailbox_id = ?1 AND flag = ?2",
                rusqlite::params![mailbox_id, RECENT_FLAG],
                |row| row.get(0),
            )
            .ctx("mailbox_status")?;
        let unseen: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages m WHERE m.mailbox_id = ?1 AND NOT EXISTS \
                     (SELECT 1 FROM flags f WHERE f.mailbox_id = m.mailbox_id \
                      AND f.uid = m.uid AND f.flag = ?2)",
                rusqlite::params![mailbox_id, SEEN_FLAG],
                |row| row.get(0),
            )
            .ctx("mailbox_status")?;

        Ok(MailboxStatus {
            messages: messages as u32,
            recent: recent as u32,
            unseen: unseen as u32,
            uid_next: uid_next as u32,
            uid_validity: uid_validity as u32,
        })
    }

    fn update_mailbox_field(
        &self,
        username: &str,
        name: &str,
        field: &str,
        value: &dyn rusqlite::ToSql,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let user_id = user_id_by_name(&conn, username)?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE mailboxes SET {} = ?3 WHERE user_id = ?1 AND name = ?2",
                    field
                ),
                rusqlite::params![user_id, name, value],
            )
            .ctx("update_mailbox")?;
        if changed == 0 {
            return Err(Error::MailboxNotFound(name.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn store() -> Store {
        let store = Store::open_in_memory(StoreConfig::default()).unwrap();
        store.create_user("alice").unwrap();
        store
    }

    #[test]
    fn test_create_auto_creates_parents() {
        let store = store();
        store.create_mailbox("alice", "Lists/rust/announce").unwrap();

        let names: Vec<String> = store
            .list_mailboxes("alice")
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(
            names,
            vec!["INBOX", "Lists", "Lists/rust", "Lists/rust/announce"]
        );
    }

    #[test]
    fn test_duplicate_mailbox_fails() {
        let store = store();
        store.create_mailbox("alice", "Work").unwrap();
        assert!(matches!(
            store.create_mailbox("alice", "Work"),
            Err(Error::MailboxAlreadyExists(_))
        ));
    }

    #[test]
    fn test_inbox_cannot_be_deleted() {
        let store = store();
        assert!(matches!(
            store.delete_mailbox("alice", "INBOX"),
            Err(Error::InboxProtected)
        ));
        assert!(matches!(
            store.delete_mailbox("alice", "inbox"),
            Err(Error::InboxProtected)
        ));
    }

    #[test]
    fn test_rename_moves_children() {
        let store = store();
        store.create_mailbox("alice", "Work/projects").unwrap();
        store.rename_mailbox("alice", "Work", "Job").unwrap();

        let names: Vec<String> = store
            .list_mailboxes("alice")
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert!(names.contains(&"Job".to_string()));
        assert!(names.contains(&"Job/projects".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("Work")));
    }

    #[test]
    fn test_rename_to_taken_name_fails() {
        let store = store();
        store.create_mailbox("alice", "A").unwrap();
        store.create_mailbox("alice", "B").unwrap();
        assert!(matches!(
            store.rename_mailbox("alice", "A", "B"),
            Err(Error::MailboxAlreadyExists(_))
        ));
    }

    #[test]
    fn test_rename_inbox_leaves_fresh_inbox() {
        let store = store();
        store.rename_mailbox("alice", "INBOX", "Old").unwrap();

        let names: Vec<String> = store
            .list_mailboxes("alice")
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert!(names.contains(&"INBOX".to_string()));
        assert!(names.contains(&"Old".to_string()));
    }

    #[test]
    fn test_special_use_round_trip() {
        let store = store();
        store.create_mailbox("alice", "Spam").unwrap();
        store
            .set_special_use("alice", "Spam", Some(SpecialUse::Junk))
            .unwrap();

        let found = store
            .special_use_mailbox("alice", SpecialUse::Junk)
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "Spam");
        assert!(store
            .special_use_mailbox("alice", SpecialUse::Trash)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_uid_validity_differs_between_incarnations() {
        let store = store();
        store.create_mailbox("alice", "Tmp").unwrap();
        let v1 = store.get_mailbox("alice", "Tmp").unwrap().uid_validity;
        store.delete_mailbox("alice", "Tmp").unwrap();
        store.create_mailbox("alice", "Tmp").unwrap();
        let v2 = store.get_mailbox("alice", "Tmp").unwrap().uid_validity;
        // Random 32-bit values; equality would be a 1 in 2^32 fluke.
        assert_ne!(v1, v2);
    }

    #[test]
    fn test_marked_set_by_arrival_cleared_on_select() {
        use crate::models::AppendMeta;

        let store = store();
        assert!(!store.get_mailbox("alice", "INBOX").unwrap().marked);
        store
            .append(
                "alice",
                "INBOX",
                b"Subject: x\r\n\r\nbody",
                AppendMeta::default(),
            )
            .unwrap();
        assert!(store.get_mailbox("alice", "INBOX").unwrap().marked);

        store.clear_marked("alice", "INBOX").unwrap();
        assert!(!store.get_mailbox("alice", "INBOX").unwrap().marked);
    }

    #[test]
    fn test_status_of_empty_mailbox() {
        let store = store();
        let status = store.mailbox_status("alice", "INBOX").unwrap();
        assert_eq!(status.messages, 0);
        assert_eq!(status.recent, 0);
        assert_eq!(status.unseen, 0);
        assert_eq!(status.uid_next, 1);
    }
}
