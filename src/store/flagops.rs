//! Flag mutation engine
//!
//! Flag lists vary per call, so the statements are built per shape (flag
//! count plus addressing mode) through the statement cache. Every mutation
//! runs range-by-range inside one transaction, then reads back the full
//! resulting flag set of each touched message for the change events;
//! subscribers get states, not deltas.

use std::collections::BTreeMap;

use rusqlite::types::Value;
use rusqlite::TransactionBehavior;

use crate::error::{Result, SqlCtx};
use crate::models::RECENT_FLAG;
use crate::seqset::NumSet;
use crate::stmt::StmtShape;
use crate::updates::Update;

use super::mailboxes::mailbox_id_by_name;
use super::resolve::SetKind;
use super::users::user_id_by_name;
use super::Store;

#[derive(Clone, Copy, PartialEq, Eq)]
enum FlagOp {
    Add,
    Remove,
    Set,
}

/// Addressing predicate over the `?`-placeholder tail of a flag statement.
/// UID mode binds `(mailbox_id, lo, hi)`; seq mode binds
/// `(mailbox_id, mailbox_id, lo, hi)` because the rank subquery needs the
/// mailbox again.
fn target_clause(by_uid: bool, uid_col: &str) -> String {
    if by_uid {
        format!("mailbox_id = ? AND {} BETWEEN ? AND ?", uid_col)
    } else {
        format!(
            "mailbox_id = ? AND {} IN \
                 (SELECT uid FROM (SELECT uid, ROW_NUMBER() OVER (ORDER BY uid) AS seq \
                  FROM messages WHERE mailbox_id = ?) WHERE seq BETWEEN ? AND ?)",
            uid_col
        )
    }
}

fn build_add(dialect: crate::dialect::Dialect, flags: usize, by_uid: bool) -> String {
    let values = vec!["(?)"; flags].join(", ");
    dialect.rewrite(&format!(
        "INSERT INTO flags (mailbox_id, uid, flag) \
         SELECT m.mailbox_id, m.uid, f.column1 \
         FROM (VALUES {}) AS f CROSS JOIN messages AS m \
         WHERE m.{} {}",
        values,
        target_clause(by_uid, "uid"),
        dialect.upsert_ignore("mailbox_id, uid, flag"),
    ))
}

fn build_remove(dialect: crate::dialect::Dialect, flags: usize, by_uid: bool) -> String {
    let list = vec!["?"; flags].join(", ");
    dialect.rewrite(&format!(
        "DELETE FROM flags WHERE flag IN ({}) AND {}",
        list,
        target_clause(by_uid, "uid"),
    ))
}

fn build_clear(dialect: crate::dialect::Dialect, by_uid: bool) -> String {
    // The transient flag survives a SET; everything else goes.
    dialect.rewrite(&format!(
        "DELETE FROM flags WHERE flag != ? AND {}",
        target_clause(by_uid, "uid"),
    ))
}

fn build_flag_sets(dialect: crate::dialect::Dialect, by_uid: bool) -> String {
    let key = if by_uid { "uid" } else { "seq" };
    dialect.rewrite(&format!(
        "SELECT uid, seq, fl FROM \
             (SELECT m.uid AS uid, ROW_NUMBER() OVER (ORDER BY m.uid) AS seq, \
                     (SELECT {} FROM flags f \
                      WHERE f.mailbox_id = m.mailbox_id AND f.uid = m.uid) AS fl \
              FROM messages m WHERE m.mailbox_id = ?) \
         WHERE {} BETWEEN ? AND ?",
        dialect.concat_aggregate("f.flag"),
        key,
    ))
}

impl Store {
    /// Add flags to every message addressed by `set`. Already-present flags
    /// are no-ops, so the call is idempotent.
    pub fn add_flags(
        &self,
        username: &str,
        mailbox: &str,
        set: &NumSet,
        kind: SetKind,
        flags: &[&str],
    ) -> Result<()> {
        self.flag_op(username, mailbox, set, kind, flags, FlagOp::Add)
    }

    /// Remove flags from every message addressed by `set`.
    pub fn remove_flags(
        &self,
        username: &str,
        mailbox: &str,
        set: &NumSet,
        kind: SetKind,
        flags: &[&str],
    ) -> Result<()> {
        self.flag_op(username, mailbox, set, kind, flags, FlagOp::Remove)
    }

    /// Replace the flag set of every message addressed by `set`. The
    /// transient `\Recent` flag is preserved regardless of the new list.
    pub fn set_flags(
        &self,
        username: &str,
        mailbox: &str,
        set: &NumSet,
        kind: SetKind,
        flags: &[&str],
    ) -> Result<()> {
        self.flag_op(username, mailbox, set, kind, flags, FlagOp::Set)
    }

    fn flag_op(
        &self,
        username: &str,
        mailbox: &str,
        set: &NumSet,
        kind: SetKind,
        flags: &[&str],
        op: FlagOp,
    ) -> Result<()> {
        // \Recent is engine-managed and never taken from a client list.
        // Duplicates are dropped wherever they appear, not just adjacent.
        let mut deduped: Vec<&str> = Vec::with_capacity(flags.len());
        for f in flags.iter().copied() {
            if f.eq_ignore_ascii_case(RECENT_FLAG) || deduped.contains(&f) {
                continue;
            }
            deduped.push(f);
        }
        let flags = deduped;
        if flags.is_empty() && op != FlagOp::Set {
            return Ok(());
        }

        let by_uid = kind == SetKind::Uid;
        let mutate_sql = match op {
            FlagOp::Add => Some(self.stmts.get_or_build(
                StmtShape::AddFlags {
                    flags: flags.len(),
                    by_uid,
                },
                || build_add(self.dialect, flags.len(), by_uid),
            )),
            FlagOp::Remove => Some(self.stmts.get_or_build(
                StmtShape::RemoveFlags {
                    flags: flags.len(),
                    by_uid,
                },
                || build_remove(self.dialect, flags.len(), by_uid),
            )),
            FlagOp::Set if flags.is_empty() => None,
            FlagOp::Set => Some(self.stmts.get_or_build(
                StmtShape::AddFlags {
                    flags: flags.len(),
                    by_uid,
                },
                || build_add(self.dialect, flags.len(), by_uid),
            )),
        };
        let clear_sql = (op == FlagOp::Set).then(|| {
            self.stmts
                .get_or_build(StmtShape::ClearFlags { by_uid }, || {
                    build_clear(self.dialect, by_uid)
                })
        });
        let sets_sql = self
            .stmts
            .get_or_build(StmtShape::FlagSets { by_uid }, || {
                build_flag_sets(self.dialect, by_uid)
            });

        let mut touched: BTreeMap<u32, (u32, Vec<String>)> = BTreeMap::new();
        {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .ctx("flag_op")?;

            let user_id = user_id_by_name(&tx, username)?;
            let mailbox_id = mailbox_id_by_name(&tx, user_id, mailbox)?;

            for &(lo, hi) in set.ranges() {
                let target: Vec<Value> = if by_uid {
                    vec![mailbox_id.into(), (lo as i64).into(), (hi as i64).into()]
                } else {
                    vec![
                        mailbox_id.into(),
                        mailbox_id.into(),
                        (lo as i64).into(),
                        (hi as i64).into(),
                    ]
                };

                if let Some(sql) = &clear_sql {
                    let mut params: Vec<Value> = vec![Value::from(RECENT_FLAG.to_string())];
                    params.extend(target.iter().cloned());
                    tx.prepare_cached(sql)
                        .ctx("flag_op")?
                        .execute(rusqlite::params_from_iter(params))
                        .ctx("flag_op")?;
                }
                if let Some(sql) = &mutate_sql {
                    let mut params: Vec<Value> =
                        flags.iter().map(|f| Value::from(f.to_string())).collect();
                    params.extend(target.iter().cloned());
                    tx.prepare_cached(sql)
                        .ctx("flag_op")?
                        .execute(rusqlite::params_from_iter(params))
                        .ctx("flag_op")?;
                }

                let mut stmt = tx.prepare_cached(&sets_sql).ctx("flag_op")?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![mailbox_id, lo, hi],
                        |row| {
                            Ok((
                                row.get::<_, i64>(0)? as u32,
                                row.get::<_, i64>(1)? as u32,
                                row.get::<_, Option<String>>(2)?,
                            ))
                        },
                    )
                    .ctx("flag_op")?;
                for row in rows {
                    let (uid, seqnum, fl) = row.ctx("flag_op")?;
                    let list = fl
                        .map(|s| s.split_whitespace().map(str::to_string).collect())
                        .unwrap_or_default();
                    touched.insert(uid, (seqnum, list));
                }
            }

            tx.commit().ctx("flag_op")?;
        }

        self.publish(
            touched
                .into_iter()
                .map(|(uid, (seqnum, flags))| Update::Message {
                    user: username.to_string(),
                    mailbox: mailbox.to_string(),
                    uid,
                    seqnum,
                    flags,
                })
                .collect(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::models::{AppendMeta, FetchItems, DELETED_FLAG, SEEN_FLAG};
    use crate::updates::update_channel;

    const MSG: &[u8] = b"From: a@example.org\r\n\r\nbody\r\n";

    fn store() -> Store {
        let store = Store::open_in_memory(StoreConfig::default()).unwrap();
        store.create_user("alice").unwrap();
        for _ in 0..3 {
            store
                .append("alice", "INBOX", MSG, AppendMeta::default())
                .unwrap();
        }
        store
    }

    fn flags_of(store: &Store, uid: u32) -> Vec<String> {
        let fetched = store
            .fetch(
                "alice",
                "INBOX",
                &NumSet::single(uid),
                SetKind::Uid,
                FetchItems::metadata(),
            )
            .unwrap();
        let mut flags = fetched[0].flags.clone();
        flags.sort();
        flags
    }

    #[test]
    fn test_add_is_idempotent() {
        let store = store();
        for _ in 0..2 {
            store
                .add_flags(
                    "alice",
                    "INBOX",
                    &NumSet::single(1),
                    SetKind::Uid,
                    &[SEEN_FLAG, "custom"],
                )
                .unwrap();
        }
        assert_eq!(flags_of(&store, 1), vec!["\\Recent", "\\Seen", "custom"]);
    }

    #[test]
    fn test_non_adjacent_duplicates_collapse() {
        let store = store();
        store
            .add_flags(
                "alice",
                "INBOX",
                &NumSet::single(1),
                SetKind::Uid,
                &[SEEN_FLAG, "custom", SEEN_FLAG],
            )
            .unwrap();
        assert_eq!(flags_of(&store, 1), vec!["\\Recent", "\\Seen", "custom"]);
    }

    #[test]
    fn test_remove_flags() {
        let store = store();
        store
            .add_flags(
                "alice",
                "INBOX",
                &NumSet::all(),
                SetKind::Uid,
                &[SEEN_FLAG, DELETED_FLAG],
            )
            .unwrap();
        store
            .remove_flags(
                "alice",
                "INBOX",
                &NumSet::single(2),
                SetKind::Uid,
                &[DELETED_FLAG],
            )
            .unwrap();

        assert_eq!(flags_of(&store, 1), vec!["\\Deleted", "\\Recent", "\\Seen"]);
        assert_eq!(flags_of(&store, 2), vec!["\\Recent", "\\Seen"]);
    }

    #[test]
    fn test_set_replaces_but_keeps_recent() {
        let store = store();
        store
            .add_flags(
                "alice",
                "INBOX",
                &NumSet::single(1),
                SetKind::Uid,
                &[SEEN_FLAG, "old"],
            )
            .unwrap();
        store
            .set_flags(
                "alice",
                "INBOX",
                &NumSet::single(1),
                SetKind::Uid,
                &["new", RECENT_FLAG],
            )
            .unwrap();
        assert_eq!(flags_of(&store, 1), vec!["\\Recent", "new"]);
    }

    #[test]
    fn test_set_with_empty_list_clears() {
        let store = store();
        store
            .add_flags("alice", "INBOX", &NumSet::single(1), SetKind::Uid, &[SEEN_FLAG])
            .unwrap();
        store
            .set_flags("alice", "INBOX", &NumSet::single(1), SetKind::Uid, &[])
            .unwrap();
        assert_eq!(flags_of(&store, 1), vec!["\\Recent"]);
    }

    #[test]
    fn test_seq_addressing() {
        let store = store();
        // Remove uid 1 so seqnum 1 maps to uid 2
        store
            .delete_messages("alice", "INBOX", &NumSet::single(1), SetKind::Uid)
            .unwrap();
        store
            .add_flags(
                "alice",
                "INBOX",
                &NumSet::single(1),
                SetKind::Seq,
                &[SEEN_FLAG],
            )
            .unwrap();
        assert_eq!(flags_of(&store, 2), vec!["\\Recent", "\\Seen"]);
        assert_eq!(flags_of(&store, 3), vec!["\\Recent"]);
    }

    #[test]
    fn test_events_carry_full_flag_sets() {
        let (sink, rx) = update_channel(32);
        let store = Store::open_in_memory(StoreConfig::default())
            .unwrap()
            .with_update_sink(sink);
        store.create_user("alice").unwrap();
        store
            .append("alice", "INBOX", MSG, AppendMeta::default())
            .unwrap();
        rx.recv().unwrap(); // append notification

        store
            .add_flags("alice", "INBOX", &NumSet::single(1), SetKind::Uid, &[SEEN_FLAG])
            .unwrap();
        match rx.recv().unwrap() {
            Update::Message {
                uid, seqnum, flags, ..
            } => {
                assert_eq!((uid, seqnum), (1, 1));
                let mut flags = flags;
                flags.sort();
                assert_eq!(flags, vec!["\\Recent", "\\Seen"]);
            }
            other => panic!("expected Message update, got {:?}", other),
        }
    }

    #[test]
    fn test_multi_range_touches_each_message_once() {
        let (sink, rx) = update_channel(32);
        let store = Store::open_in_memory(StoreConfig::default())
            .unwrap()
            .with_update_sink(sink);
        store.create_user("alice").unwrap();
        for _ in 0..3 {
            store
                .append("alice", "INBOX", MSG, AppendMeta::default())
                .unwrap();
            rx.recv().unwrap();
        }

        // Overlapping ranges: uid 2 is addressed twice but gets one event
        store
            .add_flags(
                "alice",
                "INBOX",
                &NumSet::parse("1:2,2:3").unwrap(),
                SetKind::Uid,
                &[SEEN_FLAG],
            )
            .unwrap();
        let mut uids = Vec::new();
        while let Ok(update) = rx.try_recv() {
            match update {
                Update::Message { uid, .. } => uids.push(uid),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(uids, vec![1, 2, 3]);
    }
}
