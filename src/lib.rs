//! maildb - Mailbox storage engine mapping the IMAP data model onto SQLite
//!
//! This crate provides the storage half of an IMAP/LMTP server:
//! - Domain models (User, Mailbox, message metadata, flags)
//! - UID and sequence-number resolution with stable batch semantics
//! - Flag mutation with shape-cached dynamic statements
//! - Atomic multi-recipient delivery
//! - Reference-counted external body storage with streaming compression
//! - Search and sort over cached header metadata
//! - Post-commit change-event propagation
//!
//! It has no wire-protocol dependencies and is designed to sit behind an
//! IMAP server or LMTP endpoint supplied by the embedding application.

pub mod codec;
pub mod config;
pub mod delivery;
pub mod dialect;
pub mod error;
pub mod extstore;
pub mod models;
pub mod seqset;
pub mod stmt;
pub mod store;
pub mod updates;

mod schema;

pub use codec::{Codec, NullCodec, ZstdCodec};
pub use config::{CompressionAlgo, CompressionConfig, StoreConfig};
pub use delivery::Delivery;
pub use error::{Error, Result};
pub use extstore::{ExtKey, ExternalStore, FsStore};
pub use models::{
    AppendMeta, BodyStructure, CachedHeaders, FetchItems, FetchedMessage, Mailbox, MailboxStatus,
    SpecialUse, User, DELETED_FLAG, INBOX_NAME, MAILBOX_PATH_SEP, RECENT_FLAG, SEEN_FLAG,
};
pub use seqset::NumSet;
pub use store::{
    RandomUidValidity, SearchCriteria, SetKind, SortField, SortKey, Store, UidValiditySource,
};
pub use updates::{update_channel, Update, UpdateSink};
