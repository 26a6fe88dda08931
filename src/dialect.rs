//! SQL dialect shim
//!
//! All queries in this crate are written in one portable dialect (`?`
//! placeholders, SQLite-flavored DDL) and rewritten here for the target
//! engine. Dialect conditionals never appear in business logic; if a new
//! engine needs a different spelling of something, it gets a method here.

/// Target SQL engine for query-text generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Rewrite `?` placeholders into the engine's native style. Question
    /// marks inside single-quoted literals are left alone.
    pub fn rewrite(&self, sql: &str) -> String {
        match self {
            Dialect::Sqlite => sql.to_string(),
            Dialect::Postgres => {
                let mut out = String::with_capacity(sql.len() + 8);
                let mut n = 0u32;
                let mut in_literal = false;
                for ch in sql.chars() {
                    match ch {
                        '\'' => {
                            in_literal = !in_literal;
                            out.push(ch);
                        }
                        '?' if !in_literal => {
                            n += 1;
                            out.push('$');
                            out.push_str(&n.to_string());
                        }
                        _ => out.push(ch),
                    }
                }
                out
            }
        }
    }

    /// Conflict clause turning a duplicate insert into a no-op.
    pub fn upsert_ignore(&self, conflict_cols: &str) -> String {
        // Identical on both engines today, but callers must not assume that.
        format!("ON CONFLICT ({}) DO NOTHING", conflict_cols)
    }

    /// Aggregate string concatenation with a single-space separator.
    pub fn concat_aggregate(&self, col: &str) -> String {
        match self {
            Dialect::Sqlite => format!("group_concat({}, ' ')", col),
            Dialect::Postgres => format!("string_agg({}, ' ')", col),
        }
    }

    /// Autoincrementing integer primary-key column definition.
    pub fn autoinc_pk(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Postgres => "BIGSERIAL PRIMARY KEY",
        }
    }

    /// Binary blob column type.
    pub fn blob_type(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "BLOB",
            Dialect::Postgres => "BYTEA",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_rewrite_is_identity() {
        let sql = "SELECT uid FROM messages WHERE mailbox_id = ? AND uid BETWEEN ? AND ?";
        assert_eq!(Dialect::Sqlite.rewrite(sql), sql);
    }

    #[test]
    fn test_postgres_numbers_placeholders() {
        let sql = "SELECT uid FROM messages WHERE mailbox_id = ? AND uid BETWEEN ? AND ?";
        assert_eq!(
            Dialect::Postgres.rewrite(sql),
            "SELECT uid FROM messages WHERE mailbox_id = $1 AND uid BETWEEN $2 AND $3"
        );
    }

    #[test]
    fn test_postgres_skips_literals() {
        let sql = "DELETE FROM flags WHERE flag != '?' AND uid = ?";
        assert_eq!(
            Dialect::Postgres.rewrite(sql),
            "DELETE FROM flags WHERE flag != '?' AND uid = $1"
        );
    }

    #[test]
    fn test_concat_aggregate() {
        assert_eq!(
            Dialect::Sqlite.concat_aggregate("f.flag"),
            "group_concat(f.flag, ' ')"
        );
        assert_eq!(
            Dialect::Postgres.concat_aggregate("f.flag"),
            "string_agg(f.flag, ' ')"
        );
    }

    #[test]
    fn test_upsert_ignore() {
        assert_eq!(
            Dialect::Sqlite.upsert_ignore("mailbox_id, uid, flag"),
            "ON CONFLICT (mailbox_id, uid, flag) DO NOTHING"
        );
    }
}
