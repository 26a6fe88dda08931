//! Mailbox model and special-use roles

use serde::{Deserialize, Serialize};

/// Separator for hierarchical mailbox names.
pub const MAILBOX_PATH_SEP: char = '/';

/// Every user owns exactly one INBOX; it is created with the account and
/// cannot be deleted.
pub const INBOX_NAME: &str = "INBOX";

/// Semantic role of a mailbox, usable for automatic routing at delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialUse {
    Archive,
    Drafts,
    Junk,
    Sent,
    Trash,
}

impl SpecialUse {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialUse::Archive => "\\Archive",
            SpecialUse::Drafts => "\\Drafts",
            SpecialUse::Junk => "\\Junk",
            SpecialUse::Sent => "\\Sent",
            SpecialUse::Trash => "\\Trash",
        }
    }

    pub fn from_attr(s: &str) -> Option<Self> {
        match s {
            "\\Archive" => Some(SpecialUse::Archive),
            "\\Drafts" => Some(SpecialUse::Drafts),
            "\\Junk" => Some(SpecialUse::Junk),
            "\\Sent" => Some(SpecialUse::Sent),
            "\\Trash" => Some(SpecialUse::Trash),
            _ => None,
        }
    }

    /// Mailbox name created when a delivery targets this role and no
    /// mailbox carries it yet.
    pub fn default_mailbox_name(&self) -> &'static str {
        match self {
            SpecialUse::Archive => "Archive",
            SpecialUse::Drafts => "Drafts",
            SpecialUse::Junk => "Junk",
            SpecialUse::Sent => "Sent",
            SpecialUse::Trash => "Trash",
        }
    }
}

/// A mailbox row. `uid_next` only ever increases, and `uid_validity`
/// changes whenever the identifier space is reset (delete + recreate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub id: i64,
    pub user_id: i64,
    /// Case-sensitive hierarchical name, e.g. `Lists/rust`.
    pub name: String,
    pub subscribed: bool,
    /// New messages arrived since the mailbox was last selected
    /// (`Store::clear_marked`). Surfaced as the `\Marked` listing attribute.
    pub marked: bool,
    pub uid_next: u32,
    pub uid_validity: u32,
    pub msg_size_limit: Option<u32>,
    pub special_use: Option<SpecialUse>,
}

/// STATUS-style counters for a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MailboxStatus {
    pub messages: u32,
    pub recent: u32,
    pub unseen: u32,
    pub uid_next: u32,
    pub uid_validity: u32,
}
