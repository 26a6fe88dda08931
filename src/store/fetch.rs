//! Message fetch
//!
//! The statement is shaped by the requested item set: unrequested columns
//! never leave the database. Sequence numbers come from the rank view
//! joined against the message rows, so they reflect the mailbox exactly at
//! query time.

use std::collections::BTreeMap;
use std::io::Read;

use chrono::DateTime;
use rusqlite::OptionalExtension;

use crate::error::{Error, Result, SqlCtx};
use crate::extstore::ExtKey;
use crate::models::{FetchItems, FetchedMessage};
use crate::seqset::NumSet;
use crate::stmt::StmtShape;

use super::mailboxes::mailbox_id_by_name;
use super::resolve::SetKind;
use super::users::user_id_by_name;
use super::Store;

fn build_fetch(dialect: crate::dialect::Dialect, items: FetchItems, by_uid: bool) -> String {
    let mut cols = vec!["m.uid".to_string(), "r.seq".to_string()];
    if items.flags {
        cols.push(format!(
            "(SELECT {} FROM flags f \
              WHERE f.mailbox_id = m.mailbox_id AND f.uid = m.uid)",
            dialect.concat_aggregate("f.flag")
        ));
    }
    if items.internal_date {
        cols.push("m.internal_date".to_string());
    }
    if items.size {
        cols.push("m.header_len + m.body_len".to_string());
    }
    if items.envelope {
        cols.push("m.cached_headers".to_string());
    }
    if items.header {
        cols.push("m.header".to_string());
    }
    if items.body {
        cols.push("m.body".to_string());
        cols.push("m.ext_key".to_string());
    }

    let key = if by_uid { "m.uid" } else { "r.seq" };
    dialect.rewrite(&format!(
        "SELECT {} FROM messages m \
         JOIN (SELECT uid, ROW_NUMBER() OVER (ORDER BY uid) AS seq \
               FROM messages WHERE mailbox_id = ?) r ON r.uid = m.uid \
         WHERE m.mailbox_id = ? AND {} BETWEEN ? AND ? \
         ORDER BY m.uid",
        cols.join(", "),
        key,
    ))
}

impl Store {
    /// Fetch the addressed messages. Results are ordered by UID; messages
    /// addressed by more than one range appear once.
    pub fn fetch(
        &self,
        username: &str,
        mailbox: &str,
        set: &NumSet,
        kind: SetKind,
        items: FetchItems,
    ) -> Result<Vec<FetchedMessage>> {
        let by_uid = kind == SetKind::Uid;
        let sql = self
            .stmts
            .get_or_build(StmtShape::Fetch { items, by_uid }, || {
                build_fetch(self.dialect, items, by_uid)
            });

        // (message, pending external key) keyed by uid
        let mut found: BTreeMap<u32, (FetchedMessage, Option<ExtKey>)> = BTreeMap::new();
        {
            let conn = self.conn.lock().unwrap();
            let user_id = user_id_by_name(&conn, username)?;
            let mailbox_id = mailbox_id_by_name(&conn, user_id, mailbox)?;

            let mut stmt = conn.prepare_cached(&sql).ctx("fetch")?;
            for &(lo, hi) in set.ranges() {
                let mut rows = stmt
                    .query(rusqlite::params![mailbox_id, mailbox_id, lo, hi])
                    .ctx("fetch")?;
                while let Some(row) = rows.next().ctx("fetch")? {
                    let mut msg = FetchedMessage {
                        uid: row.get::<_, i64>(0).ctx("fetch")? as u32,
                        seqnum: row.get::<_, i64>(1).ctx("fetch")? as u32,
                        ..Default::default()
                    };
                    let mut col = 2;
                    let mut next = || {
                        let i = col;
                        col += 1;
                        i
                    };
                    if items.flags {
                        let fl: Option<String> = row.get(next()).ctx("fetch")?;
                        msg.flags = fl
                            .map(|s| s.split_whitespace().map(str::to_string).collect())
                            .unwrap_or_default();
                    }
                    if items.internal_date {
                        let ts: i64 = row.get(next()).ctx("fetch")?;
                        msg.internal_date = DateTime::from_timestamp(ts, 0);
                    }
                    if items.size {
                        msg.size = Some(row.get::<_, i64>(next()).ctx("fetch")? as u32);
                    }
                    if items.envelope {
                        let json: Option<String> = row.get(next()).ctx("fetch")?;
                        msg.envelope = match json {
                            Some(json) => Some(
                                serde_json::from_str(&json)
                                    .map_err(|e| Error::BadMessage(e.to_string()))?,
                            ),
                            None => None,
                        };
                    }
                    if items.header {
                        msg.header = row.get(next()).ctx("fetch")?;
                    }
                    let ext_key = if items.body {
                        msg.body = row.get(next()).ctx("fetch")?;
                        row.get::<_, Option<String>>(next())
                            .ctx("fetch")?
                            .map(ExtKey::from)
                    } else {
                        None
                    };
                    found.insert(msg.uid, (msg, ext_key));
                }
            }
        }

        // External bodies are read after the connection lock is released.
        let mut out = Vec::with_capacity(found.len());
        for (_, (mut msg, ext_key)) in found {
            if let Some(key) = ext_key {
                msg.body = Some(self.read_object(&key)?);
            }
            out.push(msg);
        }
        Ok(out)
    }

    /// Read one externally stored body in full.
    pub(crate) fn read_object(&self, key: &ExtKey) -> Result<Vec<u8>> {
        let ext = self.ext.as_ref().ok_or_else(|| {
            Error::BadMessage(format!(
                "message references external object {} but no external store is configured",
                key
            ))
        })?;
        let mut body = Vec::new();
        ext.open(key)?.read_to_end(&mut body)?;
        Ok(body)
    }

    /// Highest UID currently present, if the mailbox is not empty. Callers
    /// use it to resolve `*` against the live mailbox.
    pub fn max_uid(&self, username: &str, mailbox: &str) -> Result<Option<u32>> {
        let conn = self.conn.lock().unwrap();
        let user_id = user_id_by_name(&conn, username)?;
        let mailbox_id = mailbox_id_by_name(&conn, user_id, mailbox)?;
        let uid: Option<i64> = conn
            .query_row(
                "SELECT MAX(uid) FROM messages WHERE mailbox_id = ?1",
                [mailbox_id],
                |row| row.get(0),
            )
            .optional()
            .ctx("max_uid")?
            .flatten();
        Ok(uid.map(|u| u as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::extstore::FsStore;
    use crate::models::AppendMeta;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    const MSG: &[u8] = b"From: Alice <a@example.org>\r\n\
Subject: fetch me\r\n\
\r\n\
the payload\r\n";

    fn store() -> Store {
        let store = Store::open_in_memory(StoreConfig::default()).unwrap();
        store.create_user("alice").unwrap();
        store
    }

    #[test]
    fn test_fetch_full_round_trip() {
        let store = store();
        let date = Utc.with_ymd_and_hms(2025, 4, 1, 12, 0, 0).unwrap();
        store
            .append(
                "alice",
                "INBOX",
                MSG,
                AppendMeta {
                    flags: vec![],
                    internal_date: Some(date),
                },
            )
            .unwrap();

        let fetched = store
            .fetch(
                "alice",
                "INBOX",
                &NumSet::all(),
                SetKind::Uid,
                FetchItems::all(),
            )
            .unwrap();
        assert_eq!(fetched.len(), 1);
        let msg = &fetched[0];
        assert_eq!((msg.uid, msg.seqnum), (1, 1));
        assert_eq!(msg.internal_date, Some(date));
        assert_eq!(msg.size, Some(MSG.len() as u32));
        assert_eq!(
            msg.envelope.as_ref().unwrap().subject.as_deref(),
            Some("fetch me")
        );

        let mut wire = msg.header.clone().unwrap();
        wire.extend_from_slice(msg.body.as_ref().unwrap());
        assert_eq!(wire, MSG);
    }

    #[test]
    fn test_metadata_fetch_skips_payload() {
        let store = store();
        store
            .append("alice", "INBOX", MSG, AppendMeta::default())
            .unwrap();

        let fetched = store
            .fetch(
                "alice",
                "INBOX",
                &NumSet::all(),
                SetKind::Uid,
                FetchItems::metadata(),
            )
            .unwrap();
        assert!(fetched[0].header.is_none());
        assert!(fetched[0].body.is_none());
        assert!(fetched[0].size.is_some());
    }

    #[test]
    fn test_fetch_body_from_external_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::default();
        let ext = Arc::new(FsStore::new(dir.path(), config.compression.codec().into()).unwrap());
        let store = Store::open_in_memory(config)
            .unwrap()
            .with_external_store(ext);
        store.create_user("alice").unwrap();
        store
            .append("alice", "INBOX", MSG, AppendMeta::default())
            .unwrap();

        let fetched = store
            .fetch(
                "alice",
                "INBOX",
                &NumSet::all(),
                SetKind::Uid,
                FetchItems::all(),
            )
            .unwrap();
        assert_eq!(
            fetched[0].body.as_deref(),
            Some(&b"the payload\r\n"[..])
        );
    }

    #[test]
    fn test_fetch_by_seqnum_after_removal() {
        let store = store();
        for _ in 0..3 {
            store
                .append("alice", "INBOX", MSG, AppendMeta::default())
                .unwrap();
        }
        store
            .delete_messages("alice", "INBOX", &NumSet::single(2), SetKind::Uid)
            .unwrap();

        let fetched = store
            .fetch(
                "alice",
                "INBOX",
                &NumSet::single(2),
                SetKind::Seq,
                FetchItems::metadata(),
            )
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!((fetched[0].uid, fetched[0].seqnum), (3, 2));
    }

    #[test]
    fn test_overlapping_ranges_dedupe() {
        let store = store();
        for _ in 0..2 {
            store
                .append("alice", "INBOX", MSG, AppendMeta::default())
                .unwrap();
        }
        let fetched = store
            .fetch(
                "alice",
                "INBOX",
                &NumSet::parse("1:2,2").unwrap(),
                SetKind::Uid,
                FetchItems::metadata(),
            )
            .unwrap();
        assert_eq!(fetched.len(), 2);
    }

    #[test]
    fn test_max_uid() {
        let store = store();
        assert_eq!(store.max_uid("alice", "INBOX").unwrap(), None);
        store
            .append("alice", "INBOX", MSG, AppendMeta::default())
            .unwrap();
        assert_eq!(store.max_uid("alice", "INBOX").unwrap(), Some(1));
    }
}
