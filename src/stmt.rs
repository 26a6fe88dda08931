//! Shape-keyed statement cache
//!
//! Flag lists and fetch-item sets vary per call, so their SQL cannot be a
//! fixed set of prepared statements. Instead the text is built once per
//! distinct *shape* and memoized here; execution then goes through the
//! driver's prepared-statement cache so re-preparation is avoided as well.
//!
//! The map sits behind a read-mostly lock: many concurrent readers, a rare
//! writer on cache miss.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::models::FetchItems;

/// Canonical descriptor of a dynamically shaped statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StmtShape {
    /// Flag insertion for `flags` distinct flag values.
    AddFlags { flags: usize, by_uid: bool },
    /// Flag removal for `flags` distinct flag values.
    RemoveFlags { flags: usize, by_uid: bool },
    /// Removal of all non-transient flags in a range.
    ClearFlags { by_uid: bool },
    /// Post-mutation read of resulting flag sets.
    FlagSets { by_uid: bool },
    /// Message fetch with a per-call item selection.
    Fetch { items: FetchItems, by_uid: bool },
}

/// Cache of built SQL text keyed by statement shape.
#[derive(Default)]
pub struct StmtCache {
    built: RwLock<HashMap<StmtShape, Arc<str>>>,
}

impl StmtCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached SQL for `shape`, building it on first use.
    pub fn get_or_build(&self, shape: StmtShape, build: impl FnOnce() -> String) -> Arc<str> {
        if let Some(sql) = self.built.read().unwrap().get(&shape) {
            return Arc::clone(sql);
        }
        let sql: Arc<str> = build().into();
        Arc::clone(
            self.built
                .write()
                .unwrap()
                .entry(shape)
                .or_insert_with(|| Arc::clone(&sql)),
        )
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.built.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_builds_once_per_shape() {
        let cache = StmtCache::new();
        let calls = AtomicUsize::new(0);

        let shape = StmtShape::AddFlags {
            flags: 2,
            by_uid: true,
        };
        for _ in 0..3 {
            let sql = cache.get_or_build(shape, || {
                calls.fetch_add(1, Ordering::SeqCst);
                "INSERT ...".to_string()
            });
            assert_eq!(&*sql, "INSERT ...");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_shapes_get_distinct_entries() {
        let cache = StmtCache::new();
        cache.get_or_build(
            StmtShape::AddFlags {
                flags: 1,
                by_uid: true,
            },
            || "a".into(),
        );
        cache.get_or_build(
            StmtShape::AddFlags {
                flags: 1,
                by_uid: false,
            },
            || "b".into(),
        );
        cache.get_or_build(
            StmtShape::AddFlags {
                flags: 2,
                by_uid: true,
            },
            || "c".into(),
        );
        assert_eq!(cache.len(), 3);
    }
}
