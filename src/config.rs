//! Engine configuration
//!
//! Tuning knobs for the SQLite engine, size limits and compression. The
//! embedding application deserializes this from its own config format;
//! everything has a sensible default.

use serde::Deserialize;

use crate::codec::{Codec, NullCodec, ZstdCodec};

/// Storage engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Global default for the maximum accepted message size in bytes.
    /// Overridden by per-user and per-mailbox limits.
    pub max_msg_size: Option<u32>,

    /// SQLite journal mode ("WAL" unless you know better).
    pub journal_mode: String,

    /// How long a statement waits on a locked database before failing
    /// with the retryable serialization error.
    pub busy_timeout_ms: u32,

    /// Page cache size in KiB.
    pub cache_size_kib: u32,

    /// Upper bound on the number of messages sorted in memory per request.
    pub sort_cap: usize,

    /// Compression applied to externally stored message bodies.
    pub compression: CompressionConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_msg_size: None,
            journal_mode: "WAL".to_string(),
            busy_timeout_ms: 5000,
            cache_size_kib: 64000,
            sort_cap: 50_000,
            compression: CompressionConfig::default(),
        }
    }
}

/// Compression algorithm selection and parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub algo: CompressionAlgo,
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        // zstd's own default level
        Self {
            algo: CompressionAlgo::Zstd,
            level: 3,
        }
    }
}

impl CompressionConfig {
    /// Build the codec this configuration describes. "No compression" is
    /// the null codec, not a special case for callers.
    pub fn codec(&self) -> Box<dyn Codec> {
        match self.algo {
            CompressionAlgo::None => Box::new(NullCodec),
            CompressionAlgo::Zstd => Box::new(ZstdCodec::new(self.level)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgo {
    None,
    Zstd,
}
