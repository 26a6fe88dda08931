//! Identifier and sequence-number resolution
//!
//! UID ranges feed straight into `BETWEEN` predicates. Sequence numbers
//! are a derived rank (1-based, ordered by UID) recomputed per request
//! through a window-function view; they are never stored or cached.
//!
//! Destructive multi-range operations use a two-phase mark-then-act
//! protocol: every sub-range first sets the transient `mark` column, then
//! one bulk statement acts on all marked rows. Because nothing is removed
//! during the marking phase, the rank view stays stable across sub-ranges,
//! which is exactly what removing rows range-by-range would break. Marks
//! never outlive their transaction.

use rusqlite::Connection;

use crate::error::{Result, SqlCtx};
use crate::seqset::NumSet;

/// How a client-supplied number set addresses messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetKind {
    /// Persistent per-mailbox identifiers.
    Uid,
    /// Transient 1-based ranks.
    Seq,
}

/// Rank view over one mailbox; `?1` is the mailbox id.
pub(crate) const RANK_VIEW: &str =
    "SELECT uid, mark, ROW_NUMBER() OVER (ORDER BY uid) AS seq \
     FROM messages WHERE mailbox_id = ?1";

/// Phase 1: mark every row addressed by `set`. Returns the number of rows
/// now marked.
pub(crate) fn mark_set(
    conn: &Connection,
    mailbox_id: i64,
    set: &NumSet,
    kind: SetKind,
) -> Result<usize> {
    let sql = match kind {
        SetKind::Uid => {
            "UPDATE messages SET mark = 1 \
             WHERE mailbox_id = ?1 AND uid BETWEEN ?2 AND ?3"
                .to_string()
        }
        SetKind::Seq => format!(
            "UPDATE messages SET mark = 1 \
             WHERE mailbox_id = ?1 AND uid IN \
                 (SELECT uid FROM ({}) WHERE seq BETWEEN ?2 AND ?3)",
            RANK_VIEW
        ),
    };
    let mut stmt = conn.prepare_cached(&sql).ctx("mark_set")?;
    for &(lo, hi) in set.ranges() {
        stmt.execute(rusqlite::params![mailbox_id, lo, hi])
            .ctx("mark_set")?;
    }

    let marked: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM messages WHERE mailbox_id = ?1 AND mark = 1",
            [mailbox_id],
            |row| row.get(0),
        )
        .ctx("mark_set")?;
    Ok(marked as usize)
}

/// Reset marks after a non-destructive use of the protocol.
pub(crate) fn clear_marks(conn: &Connection, mailbox_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE messages SET mark = 0 WHERE mailbox_id = ?1 AND mark = 1",
        [mailbox_id],
    )
    .ctx("clear_marks")?;
    Ok(())
}

/// UIDs of marked rows in ascending order.
pub(crate) fn marked_uids(conn: &Connection, mailbox_id: i64) -> Result<Vec<u32>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT uid FROM messages WHERE mailbox_id = ?1 AND mark = 1 ORDER BY uid",
        )
        .ctx("marked_uids")?;
    let uids = stmt
        .query_map([mailbox_id], |row| row.get::<_, i64>(0))
        .ctx("marked_uids")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .ctx("marked_uids")?;
    Ok(uids.into_iter().map(|u| u as u32).collect())
}

/// `(seqnum, uid)` of marked rows in descending seqnum order, ranked
/// against the mailbox as it stands right now. Used to emit expunge
/// events whose earlier entries do not shift later ones.
pub(crate) fn marked_seqnums(conn: &Connection, mailbox_id: i64) -> Result<Vec<(u32, u32)>> {
    let sql = format!(
        "SELECT seq, uid FROM ({}) WHERE mark = 1 ORDER BY seq DESC",
        RANK_VIEW
    );
    let mut stmt = conn.prepare_cached(&sql).ctx("marked_seqnums")?;
    let rows = stmt
        .query_map([mailbox_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })
        .ctx("marked_seqnums")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .ctx("marked_seqnums")?;
    Ok(rows
        .into_iter()
        .map(|(seq, uid)| (seq as u32, uid as u32))
        .collect())
}
