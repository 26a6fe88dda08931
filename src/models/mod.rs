//! Domain models for mailbox storage entities

mod mailbox;
mod message;
mod user;

pub use mailbox::{Mailbox, MailboxStatus, SpecialUse, INBOX_NAME, MAILBOX_PATH_SEP};
pub use message::{
    AppendMeta, BodyStructure, CachedHeaders, FetchItems, FetchedMessage, DELETED_FLAG,
    RECENT_FLAG, SEEN_FLAG,
};
pub use user::User;
