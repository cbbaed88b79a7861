use async_trait::async_trait;
use serde_json::Value;

use crate::error::KvResult;

/// Transactional key-value store.
///
/// All implementations must satisfy these invariants:
/// - Any number of [`KvRead`]s may be open at once, but a [`KvWrite`]
///   excludes every other transaction for its whole lifetime.
/// - A read observes either all or none of a committed write.
/// - Transactions release their lock when dropped.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Open a read transaction.
    async fn read(&self) -> KvResult<Box<dyn KvRead>>;

    /// Open a write transaction. Waits until no other transaction is open.
    async fn write(&self) -> KvResult<Box<dyn KvWrite>>;

    /// Close the store. Subsequent transactions fail with `Closed`.
    async fn close(&self) -> KvResult<()>;
}

/// Read side of a KV transaction.
#[async_trait]
pub trait KvRead: Send + Sync {
    /// Check whether a key exists.
    async fn has(&self, key: &str) -> KvResult<bool>;

    /// Read the value stored under `key`.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    async fn get(&self, key: &str) -> KvResult<Option<Value>>;
}

/// Write side of a KV transaction.
///
/// Reads through a write observe the write's own pending changes.
#[async_trait]
pub trait KvWrite: KvRead {
    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Value) -> KvResult<()>;

    /// Remove `key`. Removing a missing key is a no-op.
    async fn del(&self, key: &str) -> KvResult<()>;

    /// Apply all pending changes atomically.
    async fn commit(&self) -> KvResult<()>;
}
