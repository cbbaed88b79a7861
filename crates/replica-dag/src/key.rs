//! Key layout used when a DAG store is mapped onto a key-value store.

use replica_types::Hash;

/// Key holding a chunk's data.
pub fn chunk_data_key(hash: &Hash) -> String {
    format!("c/{hash}/d")
}

/// Key holding a chunk's refs. Only written when the chunk has refs.
pub fn chunk_meta_key(hash: &Hash) -> String {
    format!("c/{hash}/m")
}

/// Key holding a chunk's ref count.
pub fn chunk_ref_count_key(hash: &Hash) -> String {
    format!("c/{hash}/r")
}

/// Key holding the hash a head points to.
pub fn head_key(name: &str) -> String {
    format!("h/{name}")
}
