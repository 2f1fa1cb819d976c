//! Engine configuration.
//!
//! Two halves: `StorageConfig` is persisted with the repository (`info`
//! and `info_extended`) and fixed at init time; `RuntimeConfig` is
//! per-invocation tuning. Both are plain structs passed through the
//! constructors. Nothing here is global, so tests can run differently
//! configured repositories side by side in one process.

use crate::compression::CompressionMethod;

/// Default chunk size cap: 64 KiB.
pub const DEFAULT_CHUNK_MAX_SIZE: u32 = 64 * 1024;
/// Default bundle payload cap: 2 MiB.
pub const DEFAULT_BUNDLE_MAX_PAYLOAD_SIZE: u32 = 2 * 1024 * 1024;
/// Literal runs below this many bytes are inlined rather than stored as
/// chunks.
pub const DEFAULT_SMALL_LITERAL_THRESHOLD: u32 = 128;
/// Default bundle-reader cache budget: 40 MiB.
pub const DEFAULT_CACHE_SIZE: usize = 40 * 1024 * 1024;

/// Persisted storage parameters.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub chunk_max_size:          u32,
    pub bundle_max_payload_size: u32,
    pub compression:             CompressionMethod,
    pub small_literal_threshold: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_max_size:          DEFAULT_CHUNK_MAX_SIZE,
            bundle_max_payload_size: DEFAULT_BUNDLE_MAX_PAYLOAD_SIZE,
            compression:             CompressionMethod::default(),
            small_literal_threshold: DEFAULT_SMALL_LITERAL_THRESHOLD,
        }
    }
}

/// Per-invocation tuning.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Compression worker pool width.
    pub threads:     usize,
    /// Bundle-reader cache budget in bytes.
    pub cache_bytes: usize,
    /// Compression method forced on the command line, overriding the
    /// repository default for this session.
    pub compression: Option<CompressionMethod>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            threads:     num_cpus::get(),
            cache_bytes: DEFAULT_CACHE_SIZE,
            compression: None,
        }
    }
}
