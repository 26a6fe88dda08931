//! Message metadata models and fetch-item selection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved flag marking "delivered and not yet seen by any session".
/// Set by the engine at delivery/append time; stripped from every
/// client-supplied flag list.
pub const RECENT_FLAG: &str = "\\Recent";

/// Standard flag marking a message for expunge.
pub const DELETED_FLAG: &str = "\\Deleted";

/// Standard flag marking a message as read.
pub const SEEN_FLAG: &str = "\\Seen";

/// Envelope fields extracted once at delivery time and stored redundantly
/// so fetch and sort never re-parse the message. Values are the raw header
/// text, not address lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedHeaders {
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
}

/// Cached top-level MIME structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyStructure {
    /// Top-level content type, e.g. `multipart/mixed`.
    pub content_type: String,
    /// Number of direct subparts (0 for non-multipart messages).
    pub parts: u32,
    pub encoding: Option<String>,
}

impl Default for BodyStructure {
    fn default() -> Self {
        Self {
            content_type: "text/plain".to_string(),
            parts: 0,
            encoding: None,
        }
    }
}

/// Which pieces of a message a fetch call wants. Doubles as part of the
/// statement-shape key, so the SQL for a given item set is built once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FetchItems {
    pub flags: bool,
    pub envelope: bool,
    pub internal_date: bool,
    pub size: bool,
    /// Raw header bytes.
    pub header: bool,
    /// Raw body bytes (everything after the header separator). The full
    /// wire form of a message is `header` followed by `body`.
    pub body: bool,
}

impl FetchItems {
    /// Everything, including the payload.
    pub fn all() -> Self {
        Self {
            flags: true,
            envelope: true,
            internal_date: true,
            size: true,
            header: true,
            body: true,
        }
    }

    /// Everything that does not touch the payload.
    pub fn metadata() -> Self {
        Self {
            flags: true,
            envelope: true,
            internal_date: true,
            size: true,
            header: false,
            body: false,
        }
    }
}

/// One fetched message. Fields not requested in [`FetchItems`] are `None`
/// (flags default to empty). `seqnum` is the 1-based rank at the time of
/// the fetch and must not be cached across calls.
#[derive(Debug, Clone, Default)]
pub struct FetchedMessage {
    pub uid: u32,
    pub seqnum: u32,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub size: Option<u32>,
    pub envelope: Option<CachedHeaders>,
    pub header: Option<Vec<u8>>,
    pub body: Option<Vec<u8>>,
}

/// Caller-supplied metadata for an appended or delivered message.
#[derive(Debug, Clone, Default)]
pub struct AppendMeta {
    /// Initial flags. `\Recent` in this list is ignored.
    pub flags: Vec<String>,
    /// Arrival timestamp; defaults to now.
    pub internal_date: Option<DateTime<Utc>>,
}
