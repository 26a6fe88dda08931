//! External message-body store
//!
//! Bodies can live outside the relational schema in a key-value object
//! store; the database keeps only an opaque key plus a reference count
//! (see the ext_keys table). The store itself has no locking contract;
//! all sharing exclusivity comes from the refcount protocol, which only
//! mutates counts inside the transaction that creates or removes the
//! referencing message row.

mod fs;

use std::fmt;
use std::io::{Read, Write};

use rand::RngCore;

use crate::error::Result;

pub use fs::FsStore;

/// Opaque content-location token for one stored body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtKey(String);

impl ExtKey {
    /// Generate a fresh random key. 128 bits is enough to never collide
    /// within one store.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let mut s = String::with_capacity(32);
        for b in bytes {
            s.push_str(&format!("{:02x}", b));
        }
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ExtKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ExtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key-value object store for message bodies, implemented by a
/// collaborator (filesystem, blob service).
pub trait ExternalStore: Send + Sync {
    /// Open a writable object for `key`. The object becomes visible to
    /// `open` once the writer is dropped.
    fn create(&self, key: &ExtKey) -> Result<Box<dyn Write + Send>>;

    /// Open a stored object for reading.
    fn open(&self, key: &ExtKey) -> Result<Box<dyn Read + Send>>;

    /// Best-effort batch delete: every key is attempted, and the first
    /// failure (if any) is returned afterwards.
    fn delete(&self, keys: &[ExtKey]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_unique_hex() {
        let a = ExtKey::generate();
        let b = ExtKey::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
