//! Message ingestion, copy/move and expunge

use std::io::Write;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};

use crate::error::{Error, Result, SqlCtx};
use crate::extstore::ExtKey;
use crate::models::{AppendMeta, DELETED_FLAG, RECENT_FLAG};
use crate::seqset::NumSet;
use crate::updates::Update;

use super::headers::{parse_message, ParsedMessage};
use super::mailboxes::mailbox_id_by_name;
use super::resolve::{clear_marks, mark_set, marked_seqnums, SetKind};
use super::users::user_id_by_name;
use super::{deref_ext_keys, Store};

/// A message body prepared for insertion. External-store IO happens at
/// staging time, outside any database transaction; the staged object is
/// discarded if the insert never commits.
pub(crate) struct StagedBody {
    pub parsed: ParsedMessage,
    pub header: Vec<u8>,
    /// Inline body bytes; `None` when the body went to the external store.
    pub body: Option<Vec<u8>>,
    pub ext_key: Option<ExtKey>,
    pub body_len: usize,
}

/// Allocate `n` consecutive UIDs in one mailbox and return the first.
/// The row update doubles as the lock that serializes allocators, and
/// flags the mailbox as having new arrivals.
pub(crate) fn allocate_uids(tx: &Connection, mailbox_id: i64, n: u32) -> Result<u32> {
    let uid: i64 = tx
        .query_row(
            "UPDATE mailboxes SET uid_next = uid_next + ?1, marked = 1 \
             WHERE id = ?2 RETURNING uid_next - ?1",
            rusqlite::params![n, mailbox_id],
            |row| row.get(0),
        )
        .ctx("allocate_uids")?;
    Ok(uid as u32)
}

/// Mark phase for expunge: rows flagged `\Deleted`, optionally restricted
/// to a UID set.
fn mark_deleted(tx: &Connection, mailbox_id: i64, only: Option<&NumSet>) -> Result<()> {
    match only {
        None => {
            tx.execute(
                "UPDATE messages SET mark = 1 WHERE mailbox_id = ?1 AND uid IN \
                     (SELECT uid FROM flags WHERE mailbox_id = ?1 AND flag = ?2)",
                rusqlite::params![mailbox_id, DELETED_FLAG],
            )
            .ctx("mark_deleted")?;
        }
        Some(set) => {
            let mut stmt = tx
                .prepare_cached(
                    "UPDATE messages SET mark = 1 \
                     WHERE mailbox_id = ?1 AND uid BETWEEN ?2 AND ?3 AND uid IN \
                         (SELECT uid FROM flags WHERE mailbox_id = ?1 AND flag = ?4)",
                )
                .ctx("mark_deleted")?;
            for &(lo, hi) in set.ranges() {
                stmt.execute(rusqlite::params![mailbox_id, lo, hi, DELETED_FLAG])
                    .ctx("mark_deleted")?;
            }
        }
    }
    Ok(())
}

/// Act phase shared by expunge, delete and move: collect ranks of marked
/// rows, dereference their external keys and delete them. Returns the
/// `(seqnum, uid)` pairs in descending seqnum order plus the orphaned keys.
pub(crate) fn delete_marked(
    tx: &Connection,
    mailbox_id: i64,
) -> Result<(Vec<(u32, u32)>, Vec<ExtKey>)> {
    let removed = marked_seqnums(tx, mailbox_id)?;
    if removed.is_empty() {
        return Ok((removed, Vec::new()));
    }
    let orphaned = deref_ext_keys(tx, "m.mailbox_id = ?1 AND m.mark = 1", &[&mailbox_id])?;
    tx.execute(
        "DELETE FROM messages WHERE mailbox_id = ?1 AND mark = 1",
        [mailbox_id],
    )
    .ctx("delete_marked")?;
    Ok((removed, orphaned))
}

/// Copy every marked row of `src_id` into `dest_id`, flags included (minus
/// `\Recent`, which the copies acquire fresh), and bump the refcount of
/// every external key the marked rows reference. Marks on `src_id` are left
/// in place for the caller.
fn copy_marked(tx: &Connection, src_id: i64, dest_id: i64, count: u32) -> Result<u32> {
    let first = allocate_uids(tx, dest_id, count)?;

    tx.execute(
        "INSERT INTO messages (mailbox_id, uid, internal_date, header_len, header, \
                               body_len, ext_key, body, body_structure, cached_headers, mark) \
         SELECT ?1, ?2 - 1 + ROW_NUMBER() OVER (ORDER BY uid), internal_date, header_len, \
                header, body_len, ext_key, body, body_structure, cached_headers, 0 \
         FROM messages WHERE mailbox_id = ?3 AND mark = 1",
        rusqlite::params![dest_id, first, src_id],
    )
    .ctx("copy_messages")?;

    tx.execute(
        "INSERT INTO flags (mailbox_id, uid, flag) \
         SELECT ?1, r.new_uid, f.flag \
         FROM (SELECT uid, ?2 - 1 + ROW_NUMBER() OVER (ORDER BY uid) AS new_uid \
               FROM messages WHERE mailbox_id = ?3 AND mark = 1) r \
         JOIN flags f ON f.mailbox_id = ?3 AND f.uid = r.uid \
         WHERE f.flag != ?4",
        rusqlite::params![dest_id, first, src_id, RECENT_FLAG],
    )
    .ctx("copy_messages")?;
    tx.execute(
        "INSERT INTO flags (mailbox_id, uid, flag) \
         SELECT ?1, uid, ?2 FROM messages WHERE mailbox_id = ?1 AND uid >= ?3",
        rusqlite::params![dest_id, RECENT_FLAG, first],
    )
    .ctx("copy_messages")?;

    tx.execute(
        "UPDATE ext_keys SET refs = refs + \
             (SELECT COUNT(*) FROM messages \
              WHERE mailbox_id = ?1 AND mark = 1 AND ext_key = ext_keys.key) \
         WHERE key IN (SELECT ext_key FROM messages \
                       WHERE mailbox_id = ?1 AND mark = 1 AND ext_key IS NOT NULL)",
        [src_id],
    )
    .ctx("copy_messages")?;

    Ok(first)
}

impl Store {
    /// Parse a message and, when an external store is configured, write its
    /// body out. No database state is touched.
    pub(crate) fn stage_body(&self, raw: &[u8]) -> Result<StagedBody> {
        let parsed = parse_message(raw)?;
        let header = raw[..parsed.header_len].to_vec();
        let body = &raw[parsed.header_len..];

        let (inline, ext_key) = match &self.ext {
            Some(ext) => {
                let key = ExtKey::generate();
                let mut w = ext.create(&key)?;
                w.write_all(body)?;
                (None, Some(key))
            }
            None => (Some(body.to_vec()), None),
        };

        Ok(StagedBody {
            parsed,
            header,
            body: inline,
            ext_key,
            body_len: body.len(),
        })
    }

    /// Remove the staged external object after a failed insert.
    pub(crate) fn discard_staged(&self, staged: &StagedBody) {
        if let (Some(key), Some(ext)) = (&staged.ext_key, &self.ext) {
            if let Err(e) = ext.delete(std::slice::from_ref(key)) {
                log::warn!("failed to discard staged body {}: {}", key, e);
            }
        }
    }

    /// Register the refcount row for a staged external key. One row per
    /// key; `refs` is the number of message rows inserted against it in
    /// this transaction.
    pub(crate) fn insert_ext_key(
        &self,
        tx: &Connection,
        key: &ExtKey,
        refs: u32,
    ) -> Result<()> {
        tx.execute(
            "INSERT INTO ext_keys (key, refs) VALUES (?1, ?2)",
            rusqlite::params![key.as_str(), refs],
        )
        .ctx("insert_ext_key")?;
        Ok(())
    }

    /// Insert one staged message into a mailbox at `uid`. The caller owns
    /// the matching ext_keys row; `\Recent` is added here and stripped
    /// from `flags`.
    pub(crate) fn insert_message_row(
        &self,
        tx: &Connection,
        mailbox_id: i64,
        uid: u32,
        staged: &StagedBody,
        internal_date: DateTime<Utc>,
        flags: &[&str],
    ) -> Result<()> {
        let structure = serde_json::to_string(&staged.parsed.structure)
            .map_err(|e| Error::BadMessage(e.to_string()))?;
        let cached = serde_json::to_string(&staged.parsed.cached)
            .map_err(|e| Error::BadMessage(e.to_string()))?;

        tx.execute(
            "INSERT INTO messages (mailbox_id, uid, internal_date, header_len, header, \
                                   body_len, ext_key, body, body_structure, cached_headers) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                mailbox_id,
                uid,
                internal_date.timestamp(),
                staged.parsed.header_len as i64,
                staged.header,
                staged.body_len as i64,
                staged.ext_key.as_ref().map(|k| k.as_str()),
                staged.body,
                structure,
                cached,
            ],
        )
        .ctx("insert_message")?;

        // Duplicates in the client list must not fail the insert.
        let flag_sql = format!(
            "INSERT INTO flags (mailbox_id, uid, flag) VALUES (?1, ?2, ?3) {}",
            self.dialect.upsert_ignore("mailbox_id, uid, flag")
        );
        let mut stmt = tx.prepare_cached(&flag_sql).ctx("insert_message")?;
        stmt.execute(rusqlite::params![mailbox_id, uid, RECENT_FLAG])
            .ctx("insert_message")?;
        for flag in flags {
            if flag.eq_ignore_ascii_case(RECENT_FLAG) {
                continue;
            }
            stmt.execute(rusqlite::params![mailbox_id, uid, flag])
                .ctx("insert_message")?;
        }
        Ok(())
    }

    /// The strictest applicable size limit: mailbox, then user, then the
    /// global configuration default.
    pub(crate) fn effective_size_limit(
        &self,
        conn: &Connection,
        user_id: i64,
        mailbox_id: i64,
    ) -> Result<Option<u32>> {
        let mailbox_limit: Option<u32> = conn
            .query_row(
                "SELECT msg_size_limit FROM mailboxes WHERE id = ?1",
                [mailbox_id],
                |row| row.get(0),
            )
            .ctx("size_limit")?;
        if mailbox_limit.is_some() {
            return Ok(mailbox_limit);
        }
        let user_limit: Option<u32> = conn
            .query_row(
                "SELECT msg_size_limit FROM users WHERE id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .ctx("size_limit")?;
        Ok(user_limit.or(self.config.max_msg_size))
    }

    /// Append a message to a mailbox. Returns the assigned UID.
    pub fn append(
        &self,
        username: &str,
        mailbox: &str,
        raw: &[u8],
        meta: AppendMeta,
    ) -> Result<u32> {
        let size = raw.len() as u64;
        {
            let conn = self.conn.lock().unwrap();
            let user_id = user_id_by_name(&conn, username)?;
            let mailbox_id = mailbox_id_by_name(&conn, user_id, mailbox)?;
            if let Some(limit) = self.effective_size_limit(&conn, user_id, mailbox_id)? {
                if size > limit as u64 {
                    return Err(Error::SizeLimitExceeded {
                        size,
                        limit: limit as u64,
                    });
                }
            }
        }

        let staged = self.stage_body(raw)?;
        let internal_date = meta.internal_date.unwrap_or_else(Utc::now);
        let flags: Vec<&str> = meta.flags.iter().map(|f| f.as_str()).collect();

        let result = (|| -> Result<u32> {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .ctx("append")?;

            let user_id = user_id_by_name(&tx, username)?;
            let mailbox_id = mailbox_id_by_name(&tx, user_id, mailbox)?;
            let uid = allocate_uids(&tx, mailbox_id, 1)?;
            self.insert_message_row(&tx, mailbox_id, uid, &staged, internal_date, &flags)?;
            if let Some(key) = &staged.ext_key {
                self.insert_ext_key(&tx, key, 1)?;
            }

            tx.commit().ctx("append")?;
            Ok(uid)
        })();

        match result {
            Ok(uid) => {
                self.publish(vec![Update::Mailbox {
                    user: username.to_string(),
                    mailbox: mailbox.to_string(),
                }]);
                Ok(uid)
            }
            Err(e) => {
                self.discard_staged(&staged);
                Err(e)
            }
        }
    }

    /// Copy the addressed messages into `dest`. Copies keep their flags,
    /// gain `\Recent`, and share externally stored bodies with the
    /// originals. Returns the number of messages copied.
    pub fn copy_messages(
        &self,
        username: &str,
        src: &str,
        set: &NumSet,
        kind: SetKind,
        dest: &str,
    ) -> Result<u32> {
        let copied = {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .ctx("copy_messages")?;

            let user_id = user_id_by_name(&tx, username)?;
            let src_id = mailbox_id_by_name(&tx, user_id, src)?;
            let dest_id = mailbox_id_by_name(&tx, user_id, dest)?;

            let count = mark_set(&tx, src_id, set, kind)? as u32;
            if count > 0 {
                copy_marked(&tx, src_id, dest_id, count)?;
            }
            clear_marks(&tx, src_id)?;

            tx.commit().ctx("copy_messages")?;
            count
        };

        if copied > 0 {
            self.publish(vec![Update::Mailbox {
                user: username.to_string(),
                mailbox: dest.to_string(),
            }]);
        }
        Ok(copied)
    }

    /// Move the addressed messages into `dest`: copy plus removal of the
    /// originals in one transaction. Returns the number moved.
    pub fn move_messages(
        &self,
        username: &str,
        src: &str,
        set: &NumSet,
        kind: SetKind,
        dest: &str,
    ) -> Result<u32> {
        let (removed, orphaned, moved) = {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .ctx("move_messages")?;

            let user_id = user_id_by_name(&tx, username)?;
            let src_id = mailbox_id_by_name(&tx, user_id, src)?;
            let dest_id = mailbox_id_by_name(&tx, user_id, dest)?;

            let count = mark_set(&tx, src_id, set, kind)? as u32;
            if count > 0 {
                copy_marked(&tx, src_id, dest_id, count)?;
            }
            let (removed, orphaned) = delete_marked(&tx, src_id)?;

            tx.commit().ctx("move_messages")?;
            (removed, orphaned, count)
        };

        let mut updates = Vec::with_capacity(removed.len() + 1);
        for &(seqnum, uid) in &removed {
            updates.push(Update::Expunge {
                user: username.to_string(),
                mailbox: src.to_string(),
                uid,
                seqnum,
            });
        }
        if moved > 0 {
            updates.push(Update::Mailbox {
                user: username.to_string(),
                mailbox: dest.to_string(),
            });
        }
        self.publish(updates);
        self.remove_objects(&orphaned);
        Ok(moved)
    }

    /// Remove every message flagged `\Deleted`, optionally restricted to a
    /// UID set. Returns the expunged UIDs in ascending order.
    pub fn expunge(
        &self,
        username: &str,
        mailbox: &str,
        only: Option<&NumSet>,
    ) -> Result<Vec<u32>> {
        let (removed, orphaned) = {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .ctx("expunge")?;

            let user_id = user_id_by_name(&tx, username)?;
            let mailbox_id = mailbox_id_by_name(&tx, user_id, mailbox)?;
            mark_deleted(&tx, mailbox_id, only)?;
            let result = delete_marked(&tx, mailbox_id)?;

            tx.commit().ctx("expunge")?;
            result
        };

        self.publish(
            removed
                .iter()
                .map(|&(seqnum, uid)| Update::Expunge {
                    user: username.to_string(),
                    mailbox: mailbox.to_string(),
                    uid,
                    seqnum,
                })
                .collect(),
        );
        self.remove_objects(&orphaned);

        let mut uids: Vec<u32> = removed.into_iter().map(|(_, uid)| uid).collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Unconditionally remove the addressed messages, `\Deleted` or not.
    /// Returns the number removed.
    pub fn delete_messages(
        &self,
        username: &str,
        mailbox: &str,
        set: &NumSet,
        kind: SetKind,
    ) -> Result<u32> {
        let (removed, orphaned) = {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .ctx("delete_messages")?;

            let user_id = user_id_by_name(&tx, username)?;
            let mailbox_id = mailbox_id_by_name(&tx, user_id, mailbox)?;
            mark_set(&tx, mailbox_id, set, kind)?;
            let result = delete_marked(&tx, mailbox_id)?;

            tx.commit().ctx("delete_messages")?;
            result
        };

        self.publish(
            removed
                .iter()
                .map(|&(seqnum, uid)| Update::Expunge {
                    user: username.to_string(),
                    mailbox: mailbox.to_string(),
                    uid,
                    seqnum,
                })
                .collect(),
        );
        self.remove_objects(&orphaned);
        Ok(removed.len() as u32)
    }
}
