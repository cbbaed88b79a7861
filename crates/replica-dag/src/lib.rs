//! Content-addressed chunk DAG for the Replica sync engine.
//!
//! A DAG store holds immutable [`Chunk`]s and a handful of named heads.
//! Chunks unreachable from every head are garbage collected when a write
//! commits, using incrementally maintained ref counts.
//!
//! # Key Types
//!
//! - [`Store`] / [`Read`] / [`Write`]: transactional DAG store interface
//! - [`StoreImpl`]: durable store mapped onto a `replica_kv::KvStore`
//! - [`LazyStore`]: in-memory store that lazily reads and caches chunks
//!   from a source store
//! - [`compute_ref_count_updates`]: the ref-count delta computation shared
//!   by both stores
//! - [`Visitor`] / [`walk`]: reachability traversal

pub mod chunk;
mod chunks_cache;
pub mod config;
pub mod error;
pub mod gc;
pub mod key;
pub mod lazy_store;
pub mod store;
pub mod store_impl;
pub mod util;
pub mod visitor;

pub use chunk::{create_chunk, Chunk};
pub use chunks_cache::{default_chunk_sizer, ChunkSizer};
pub use config::LazyStoreConfig;
pub use error::{DagError, DagResult};
pub use gc::{compute_ref_count_updates, HeadChange, RefCountUpdatesDelegate};
pub use lazy_store::{LazyRead, LazyStore, LazyWrite};
pub use store::{Read, Store, Write};
pub use store_impl::StoreImpl;
pub use visitor::{walk, Visitor};
