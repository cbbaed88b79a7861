use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use crate::error::{KvError, KvResult};
use crate::traits::{KvRead, KvStore, KvWrite};

type Map = HashMap<String, Value>;

/// In-memory, HashMap-based key-value store.
///
/// Intended for tests and as a stand-in durable store. Transactions hold an
/// owned guard on a `tokio::sync::RwLock`, so reads run concurrently and a
/// write waits for exclusive access.
pub struct MemKvStore {
    map: Arc<RwLock<Map>>,
    closed: AtomicBool,
}

impl MemKvStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            map: Arc::new(RwLock::new(HashMap::new())),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of keys currently stored.
    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    /// Returns `true` if the store holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }

    /// Sorted list of all keys in the store.
    pub async fn keys(&self) -> Vec<String> {
        let map = self.map.read().await;
        let mut keys: Vec<String> = map.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn check_open(&self) -> KvResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KvError::Closed);
        }
        Ok(())
    }
}

impl Default for MemKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemKvStore")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl KvStore for MemKvStore {
    async fn read(&self) -> KvResult<Box<dyn KvRead>> {
        self.check_open()?;
        let guard = Arc::clone(&self.map).read_owned().await;
        Ok(Box::new(MemRead { guard }))
    }

    async fn write(&self) -> KvResult<Box<dyn KvWrite>> {
        self.check_open()?;
        let guard = Arc::clone(&self.map).write_owned().await;
        Ok(Box::new(MemWrite {
            state: Mutex::new(WriteState {
                guard,
                pending: HashMap::new(),
                committed: false,
            }),
        }))
    }

    async fn close(&self) -> KvResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MemRead {
    guard: OwnedRwLockReadGuard<Map>,
}

#[async_trait]
impl KvRead for MemRead {
    async fn has(&self, key: &str) -> KvResult<bool> {
        Ok(self.guard.contains_key(key))
    }

    async fn get(&self, key: &str) -> KvResult<Option<Value>> {
        Ok(self.guard.get(key).cloned())
    }
}

struct WriteState {
    guard: OwnedRwLockWriteGuard<Map>,
    /// `None` marks a pending delete.
    pending: HashMap<String, Option<Value>>,
    committed: bool,
}

struct MemWrite {
    state: Mutex<WriteState>,
}

impl MemWrite {
    fn state(&self) -> std::sync::MutexGuard<'_, WriteState> {
        self.state.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl KvRead for MemWrite {
    async fn has(&self, key: &str) -> KvResult<bool> {
        let state = self.state();
        Ok(match state.pending.get(key) {
            Some(pending) => pending.is_some(),
            None => state.guard.contains_key(key),
        })
    }

    async fn get(&self, key: &str) -> KvResult<Option<Value>> {
        let state = self.state();
        Ok(match state.pending.get(key) {
            Some(pending) => pending.clone(),
            None => state.guard.get(key).cloned(),
        })
    }
}

#[async_trait]
impl KvWrite for MemWrite {
    async fn put(&self, key: &str, value: Value) -> KvResult<()> {
        let mut state = self.state();
        if state.committed {
            return Err(KvError::AlreadyCommitted);
        }
        state.pending.insert(key.to_owned(), Some(value));
        Ok(())
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        let mut state = self.state();
        if state.committed {
            return Err(KvError::AlreadyCommitted);
        }
        state.pending.insert(key.to_owned(), None);
        Ok(())
    }

    async fn commit(&self) -> KvResult<()> {
        let mut state = self.state();
        if state.committed {
            return Err(KvError::AlreadyCommitted);
        }
        let pending = std::mem::take(&mut state.pending);
        let changes = pending.len();
        for (key, value) in pending {
            match value {
                Some(value) => {
                    state.guard.insert(key, value);
                }
                None => {
                    state.guard.remove(&key);
                }
            }
        }
        state.committed = true;
        debug!(changes, "committed kv write");
        Ok(())
    }
}
