//! Search and server-side sort
//!
//! Search runs in two stages: a SQL prefilter over everything the schema
//! can answer directly (flags, dates, sizes, identifier ranges), then an
//! in-process pass over the surviving candidates for the criteria that
//! need header or body bytes. Sort reuses the same prefilter and orders
//! the candidates in memory from the cached header columns, capped by
//! configuration.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Connection;

use crate::error::{Error, Result, SqlCtx};
use crate::extstore::ExtKey;
use crate::models::CachedHeaders;
use crate::seqset::NumSet;

use super::headers::contains_ci;
use super::mailboxes::mailbox_id_by_name;
use super::resolve::RANK_VIEW;
use super::users::user_id_by_name;
use super::Store;

/// Search criteria. All populated fields must match (AND semantics);
/// listed flags and text needles are likewise all required.
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    /// Restrict to these UIDs.
    pub uid: Option<NumSet>,
    /// Restrict to these sequence numbers, ranked at query time.
    pub seq: Option<NumSet>,
    pub with_flags: Vec<String>,
    pub without_flags: Vec<String>,
    /// Arrival on or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Arrival strictly before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Date header on or after this instant.
    pub sent_since: Option<DateTime<Utc>>,
    /// Date header strictly before this instant.
    pub sent_before: Option<DateTime<Utc>>,
    /// Wire size strictly greater than this.
    pub larger: Option<u32>,
    /// Wire size strictly smaller than this.
    pub smaller: Option<u32>,
    /// `(field, needle)`: the named header contains the needle. An empty
    /// needle matches mere presence of the field.
    pub header: Vec<(String, String)>,
    /// Needle occurs in the header or the body.
    pub text: Vec<String>,
    /// Needle occurs in the body.
    pub body: Vec<String>,
}

impl SearchCriteria {
    fn needs_envelope(&self) -> bool {
        self.sent_since.is_some() || self.sent_before.is_some()
    }

    fn needs_payload(&self) -> bool {
        !self.header.is_empty() || !self.text.is_empty() || !self.body.is_empty()
    }
}

/// One ordering criterion for [`Store::sort`]; earlier keys dominate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub reverse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    /// Arrival timestamp.
    Arrival,
    /// Date header, falling back to arrival when absent.
    Date,
    From,
    To,
    Cc,
    Subject,
    Size,
}

/// Per-candidate metadata loaded for the in-memory phases.
struct Candidate {
    uid: u32,
    internal_date: i64,
    size: u32,
    envelope: CachedHeaders,
}

fn push_set_clause(
    clauses: &mut Vec<String>,
    params: &mut Vec<Value>,
    col: &str,
    set: &NumSet,
) {
    let mut parts = Vec::with_capacity(set.ranges().len());
    for &(lo, hi) in set.ranges() {
        parts.push(format!("{} BETWEEN ? AND ?", col));
        params.push((lo as i64).into());
        params.push((hi as i64).into());
    }
    clauses.push(format!("({})", parts.join(" OR ")));
}

/// SQL prefilter: every criterion the schema answers without touching
/// payload bytes. Returns matching UIDs in ascending order.
fn prefilter(
    conn: &Connection,
    mailbox_id: i64,
    criteria: &SearchCriteria,
) -> Result<Vec<u32>> {
    let mut params: Vec<Value> = Vec::new();
    let from = if criteria.seq.is_some() {
        params.push(mailbox_id.into());
        format!(
            "messages m JOIN ({}) r ON r.uid = m.uid",
            RANK_VIEW.replace("?1", "?")
        )
    } else {
        "messages m".to_string()
    };
    let mut clauses = vec!["m.mailbox_id = ?".to_string()];
    params.push(mailbox_id.into());

    if let Some(set) = &criteria.uid {
        push_set_clause(&mut clauses, &mut params, "m.uid", set);
    }
    if let Some(set) = &criteria.seq {
        push_set_clause(&mut clauses, &mut params, "r.seq", set);
    }
    for flag in &criteria.with_flags {
        clauses.push(
            "EXISTS (SELECT 1 FROM flags f WHERE f.mailbox_id = m.mailbox_id \
                 AND f.uid = m.uid AND f.flag = ?)"
                .to_string(),
        );
        params.push(flag.clone().into());
    }
    for flag in &criteria.without_flags {
        clauses.push(
            "NOT EXISTS (SELECT 1 FROM flags f WHERE f.mailbox_id = m.mailbox_id \
                 AND f.uid = m.uid AND f.flag = ?)"
                .to_string(),
        );
        params.push(flag.clone().into());
    }
    if let Some(since) = criteria.since {
        clauses.push("m.internal_date >= ?".to_string());
        params.push(since.timestamp().into());
    }
    if let Some(before) = criteria.before {
        clauses.push("m.internal_date < ?".to_string());
        params.push(before.timestamp().into());
    }
    if let Some(larger) = criteria.larger {
        clauses.push("m.header_len + m.body_len > ?".to_string());
        params.push((larger as i64).into());
    }
    if let Some(smaller) = criteria.smaller {
        clauses.push("m.header_len + m.body_len < ?".to_string());
        params.push((smaller as i64).into());
    }

    let sql = format!(
        "SELECT DISTINCT m.uid FROM {} WHERE {} ORDER BY m.uid",
        from,
        clauses.join(" AND "),
    );
    let mut stmt = conn.prepare(&sql).ctx("search")?;
    let uids = stmt
        .query_map(rusqlite::params_from_iter(params), |row| {
            row.get::<_, i64>(0)
        })
        .ctx("search")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .ctx("search")?;
    Ok(uids.into_iter().map(|u| u as u32).collect())
}

fn load_candidate(conn: &Connection, mailbox_id: i64, uid: u32) -> Result<Candidate> {
    let (internal_date, size, json): (i64, i64, Option<String>) = conn
        .query_row(
            "SELECT internal_date, header_len + body_len, cached_headers \
             FROM messages WHERE mailbox_id = ?1 AND uid = ?2",
            rusqlite::params![mailbox_id, uid],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .ctx("search")?;
    let envelope = match json {
        Some(json) => {
            serde_json::from_str(&json).map_err(|e| Error::BadMessage(e.to_string()))?
        }
        None => CachedHeaders::default(),
    };
    Ok(Candidate {
        uid,
        internal_date,
        size: size as u32,
        envelope,
    })
}

fn matches_envelope(criteria: &SearchCriteria, envelope: &CachedHeaders) -> bool {
    if let Some(since) = criteria.sent_since {
        match envelope.date {
            Some(date) if date >= since => {}
            _ => return false,
        }
    }
    if let Some(before) = criteria.sent_before {
        match envelope.date {
            Some(date) if date < before => {}
            _ => return false,
        }
    }
    true
}

fn matches_payload(criteria: &SearchCriteria, header: &[u8], body: &[u8]) -> Result<bool> {
    if !criteria.header.is_empty() {
        let (headers, _) =
            mailparse::parse_headers(header).map_err(|e| Error::BadMessage(e.to_string()))?;
        for (field, needle) in &criteria.header {
            let matched = headers.iter().any(|h| {
                h.get_key_ref().eq_ignore_ascii_case(field)
                    && contains_ci(h.get_value().as_bytes(), needle)
            });
            if !matched {
                return Ok(false);
            }
        }
    }
    for needle in &criteria.text {
        if !contains_ci(header, needle) && !contains_ci(body, needle) {
            return Ok(false);
        }
    }
    for needle in &criteria.body {
        if !contains_ci(body, needle) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Case-insensitive key with the usual reply/forward prefixes stripped,
/// used for SUBJECT ordering.
fn subject_key(subject: &Option<String>) -> String {
    let mut s = subject.as_deref().unwrap_or("").trim();
    loop {
        let lower = s.to_ascii_lowercase();
        let stripped = lower
            .strip_prefix("re:")
            .or_else(|| lower.strip_prefix("fwd:"))
            .or_else(|| lower.strip_prefix("fw:"));
        match stripped {
            Some(rest) => s = &s[s.len() - rest.len()..],
            None => break,
        }
        s = s.trim_start();
    }
    s.to_ascii_lowercase()
}

fn addr_key(value: &Option<String>) -> String {
    value.as_deref().unwrap_or("").trim().to_ascii_lowercase()
}

fn compare(a: &Candidate, b: &Candidate, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let ord = match key.field {
            SortField::Arrival => a.internal_date.cmp(&b.internal_date),
            SortField::Date => {
                let da = a
                    .envelope
                    .date
                    .map(|d| d.timestamp())
                    .unwrap_or(a.internal_date);
                let db = b
                    .envelope
                    .date
                    .map(|d| d.timestamp())
                    .unwrap_or(b.internal_date);
                da.cmp(&db)
            }
            SortField::From => addr_key(&a.envelope.from).cmp(&addr_key(&b.envelope.from)),
            SortField::To => addr_key(&a.envelope.to).cmp(&addr_key(&b.envelope.to)),
            SortField::Cc => addr_key(&a.envelope.cc).cmp(&addr_key(&b.envelope.cc)),
            SortField::Subject => {
                subject_key(&a.envelope.subject).cmp(&subject_key(&b.envelope.subject))
            }
            SortField::Size => a.size.cmp(&b.size),
        };
        let ord = if key.reverse { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.uid.cmp(&b.uid)
}

impl Store {
    /// Search a mailbox. Returns matching UIDs in ascending order.
    pub fn search(
        &self,
        username: &str,
        mailbox: &str,
        criteria: &SearchCriteria,
    ) -> Result<Vec<u32>> {
        let (candidates, payload_refs) = {
            let conn = self.conn.lock().unwrap();
            let user_id = user_id_by_name(&conn, username)?;
            let mailbox_id = mailbox_id_by_name(&conn, user_id, mailbox)?;
            let mut uids = prefilter(&conn, mailbox_id, criteria)?;

            if criteria.needs_envelope() {
                let mut kept = Vec::with_capacity(uids.len());
                for uid in uids {
                    let candidate = load_candidate(&conn, mailbox_id, uid)?;
                    if matches_envelope(criteria, &candidate.envelope) {
                        kept.push(uid);
                    }
                }
                uids = kept;
            }

            let payload_refs = if criteria.needs_payload() {
                let mut refs = Vec::with_capacity(uids.len());
                let mut stmt = conn
                    .prepare_cached(
                        "SELECT header, body, ext_key FROM messages \
                         WHERE mailbox_id = ?1 AND uid = ?2",
                    )
                    .ctx("search")?;
                for &uid in &uids {
                    let (header, body, ext_key): (Vec<u8>, Option<Vec<u8>>, Option<String>) =
                        stmt.query_row(rusqlite::params![mailbox_id, uid], |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                        })
                        .ctx("search")?;
                    refs.push((uid, header, body, ext_key.map(ExtKey::from)));
                }
                Some(refs)
            } else {
                None
            };
            (uids, payload_refs)
        };

        // Payload matching runs outside the connection lock; external
        // bodies may need IO.
        match payload_refs {
            None => Ok(candidates),
            Some(refs) => {
                let mut out = Vec::with_capacity(refs.len());
                for (uid, header, body, ext_key) in refs {
                    let body = match (body, ext_key) {
                        (Some(body), _) => body,
                        (None, Some(key)) => self.read_object(&key)?,
                        (None, None) => Vec::new(),
                    };
                    if matches_payload(criteria, &header, &body)? {
                        out.push(uid);
                    }
                }
                Ok(out)
            }
        }
    }

    /// Like [`Store::search`] but returns sequence numbers, ranked against
    /// the mailbox at the time of this call.
    pub fn search_seqnums(
        &self,
        username: &str,
        mailbox: &str,
        criteria: &SearchCriteria,
    ) -> Result<Vec<u32>> {
        let uids = self.search(username, mailbox, criteria)?;
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap();
        let user_id = user_id_by_name(&conn, username)?;
        let mailbox_id = mailbox_id_by_name(&conn, user_id, mailbox)?;
        let mut stmt = conn
            .prepare_cached(&format!("SELECT uid, seq FROM ({})", RANK_VIEW))
            .ctx("search")?;
        let ranks: HashMap<u32, u32> = stmt
            .query_map([mailbox_id], |row| {
                Ok((row.get::<_, i64>(0)? as u32, row.get::<_, i64>(1)? as u32))
            })
            .ctx("search")?
            .collect::<std::result::Result<_, _>>()
            .ctx("search")?;

        // Rows expunged between the two phases simply drop out.
        Ok(uids.iter().filter_map(|uid| ranks.get(uid).copied()).collect())
    }

    /// Search and order the results server-side. Returns UIDs in the
    /// requested order. The number of candidates sorted in memory is
    /// capped by `sort_cap`; overflow is truncated with a warning.
    pub fn sort(
        &self,
        username: &str,
        mailbox: &str,
        keys: &[SortKey],
        criteria: &SearchCriteria,
    ) -> Result<Vec<u32>> {
        let mut uids = self.search(username, mailbox, criteria)?;
        if uids.len() > self.config.sort_cap {
            log::warn!(
                "sort in {} matched {} messages, truncating to {}",
                mailbox,
                uids.len(),
                self.config.sort_cap
            );
            uids.truncate(self.config.sort_cap);
        }

        let mut candidates = Vec::with_capacity(uids.len());
        {
            let conn = self.conn.lock().unwrap();
            let user_id = user_id_by_name(&conn, username)?;
            let mailbox_id = mailbox_id_by_name(&conn, user_id, mailbox)?;
            for uid in uids {
                candidates.push(load_candidate(&conn, mailbox_id, uid)?);
            }
        }

        candidates.sort_by(|a, b| compare(a, b, keys));
        Ok(candidates.into_iter().map(|c| c.uid).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::models::{AppendMeta, DELETED_FLAG, SEEN_FLAG};
    use crate::store::SetKind;
    use chrono::TimeZone;

    fn msg(from: &str, subject: &str, body: &str) -> Vec<u8> {
        format!(
            "From: {}\r\nSubject: {}\r\nDate: Tue, 1 Apr 2025 12:00:00 +0000\r\n\r\n{}",
            from, subject, body
        )
        .into_bytes()
    }

    fn store() -> Store {
        let store = Store::open_in_memory(StoreConfig::default()).unwrap();
        store.create_user("alice").unwrap();
        store
    }

    fn append(store: &Store, raw: &[u8], date: DateTime<Utc>) -> u32 {
        store
            .append(
                "alice",
                "INBOX",
                raw,
                AppendMeta {
                    flags: vec![],
                    internal_date: Some(date),
                },
            )
            .unwrap()
    }

    #[test]
    fn test_search_by_flags() {
        let store = store();
        let d = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        for i in 0..3 {
            append(&store, &msg("a@x", &format!("m{}", i), "body"), d);
        }
        store
            .add_flags(
                "alice",
                "INBOX",
                &NumSet::parse("1:2").unwrap(),
                SetKind::Uid,
                &[SEEN_FLAG],
            )
            .unwrap();

        let criteria = SearchCriteria {
            with_flags: vec![SEEN_FLAG.to_string()],
            without_flags: vec![DELETED_FLAG.to_string()],
            ..Default::default()
        };
        assert_eq!(store.search("alice", "INBOX", &criteria).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_search_by_internal_date_and_size() {
        let store = store();
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        append(&store, &msg("a@x", "old", "tiny"), old);
        append(&store, &msg("a@x", "new", &"x".repeat(500)), new);

        let since = SearchCriteria {
            since: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        assert_eq!(store.search("alice", "INBOX", &since).unwrap(), vec![2]);

        let small = SearchCriteria {
            smaller: Some(100),
            ..Default::default()
        };
        assert_eq!(store.search("alice", "INBOX", &small).unwrap(), vec![1]);
    }

    #[test]
    fn test_search_body_text() {
        let store = store();
        let d = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        append(&store, &msg("a@x", "groceries", "buy MILK and eggs"), d);
        append(&store, &msg("a@x", "meeting", "agenda attached"), d);

        let criteria = SearchCriteria {
            body: vec!["milk".to_string()],
            ..Default::default()
        };
        assert_eq!(store.search("alice", "INBOX", &criteria).unwrap(), vec![1]);

        // TEXT also matches the header section
        let criteria = SearchCriteria {
            text: vec!["meeting".to_string()],
            ..Default::default()
        };
        assert_eq!(store.search("alice", "INBOX", &criteria).unwrap(), vec![2]);
    }

    #[test]
    fn test_search_by_header_field() {
        let store = store();
        let d = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        append(&store, &msg("carol@example.org", "a", "x"), d);
        append(&store, &msg("dave@example.org", "b", "x"), d);

        let criteria = SearchCriteria {
            header: vec![("From".to_string(), "carol".to_string())],
            ..Default::default()
        };
        assert_eq!(store.search("alice", "INBOX", &criteria).unwrap(), vec![1]);
    }

    #[test]
    fn test_search_seqnums_rank_at_query_time() {
        let store = store();
        let d = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        for i in 0..3 {
            append(&store, &msg("a@x", &format!("m{}", i), "needle"), d);
        }
        store
            .delete_messages("alice", "INBOX", &NumSet::single(1), SetKind::Uid)
            .unwrap();

        let criteria = SearchCriteria {
            body: vec!["needle".to_string()],
            ..Default::default()
        };
        // uids 2 and 3 are now ranks 1 and 2
        assert_eq!(
            store.search_seqnums("alice", "INBOX", &criteria).unwrap(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_sort_by_subject_strips_reply_prefix() {
        let store = store();
        let d = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        append(&store, &msg("a@x", "zebra", "x"), d);
        append(&store, &msg("a@x", "Re: apple", "x"), d);
        append(&store, &msg("a@x", "banana", "x"), d);

        let sorted = store
            .sort(
                "alice",
                "INBOX",
                &[SortKey {
                    field: SortField::Subject,
                    reverse: false,
                }],
                &SearchCriteria::default(),
            )
            .unwrap();
        assert_eq!(sorted, vec![2, 3, 1]);
    }

    #[test]
    fn test_sort_reverse_arrival_with_uid_tiebreak() {
        let store = store();
        let d1 = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        let d2 = Utc.with_ymd_and_hms(2025, 4, 2, 0, 0, 0).unwrap();
        append(&store, &msg("a@x", "a", "x"), d2);
        append(&store, &msg("a@x", "b", "x"), d1);
        append(&store, &msg("a@x", "c", "x"), d1);

        let sorted = store
            .sort(
                "alice",
                "INBOX",
                &[SortKey {
                    field: SortField::Arrival,
                    reverse: true,
                }],
                &SearchCriteria::default(),
            )
            .unwrap();
        assert_eq!(sorted, vec![1, 2, 3]);
    }

    #[test]
    fn test_sort_cap_truncates() {
        let config = StoreConfig {
            sort_cap: 2,
            ..Default::default()
        };
        let store = Store::open_in_memory(config).unwrap();
        store.create_user("alice").unwrap();
        let d = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        for i in 0..4 {
            append(&store, &msg("a@x", &format!("m{}", i), "x"), d);
        }

        let sorted = store
            .sort(
                "alice",
                "INBOX",
                &[SortKey {
                    field: SortField::Size,
                    reverse: false,
                }],
                &SearchCriteria::default(),
            )
            .unwrap();
        assert_eq!(sorted.len(), 2);
    }

    #[test]
    fn test_empty_criteria_match_everything_once() {
        let store = store();
        let d = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        for i in 0..2 {
            append(&store, &msg("a@x", &format!("m{}", i), "x"), d);
        }
        store
            .add_flags("alice", "INBOX", &NumSet::all(), SetKind::Uid, &[SEEN_FLAG])
            .unwrap();
        assert_eq!(
            store
                .search("alice", "INBOX", &SearchCriteria::default())
                .unwrap(),
            vec![1, 2]
        );
    }
}
