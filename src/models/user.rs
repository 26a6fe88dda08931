//! User account model

/// A user account. Usernames are case-insensitive; the row id is the
/// stable handle used across delivery and mailbox operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    /// Username in its original casing as created.
    pub username: String,
    /// Per-user message size limit; overrides the global default and is
    /// overridden by per-mailbox limits.
    pub msg_size_limit: Option<u32>,
}
