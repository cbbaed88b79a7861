use serde::{Deserialize, Serialize};

/// Configuration for a [`LazyStore`](crate::LazyStore).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LazyStoreConfig {
    /// Byte budget of the cache of chunks read from the source store.
    /// Memory-only chunks do not count towards it.
    pub source_cache_size_limit: usize,
}

impl Default for LazyStoreConfig {
    fn default() -> Self {
        Self {
            source_cache_size_limit: 100 * 1024 * 1024,
        }
    }
}

impl LazyStoreConfig {
    /// A configuration with the given cache budget in bytes.
    pub fn with_limit(source_cache_size_limit: usize) -> Self {
        Self {
            source_cache_size_limit,
        }
    }
}
