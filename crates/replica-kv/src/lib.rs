//! Transactional key-value storage for Replica.
//!
//! The DAG store does not talk to a database directly. It maps chunks, ref
//! counts and heads onto string keys of a generic transactional KV store,
//! so backends only have to implement three small traits.
//!
//! # Storage Backends
//!
//! All backends implement the [`KvStore`] trait:
//!
//! - [`MemKvStore`]: `HashMap`-based store for tests and the in-memory perdag
//!
//! # Design Rules
//!
//! 1. Any number of concurrent reads, at most one write at a time.
//! 2. A read never observes a partially applied write (serializable isolation).
//! 3. Writes buffer their changes; dropping a write without `commit` rolls back.
//! 4. Values are JSON; the store never interprets them.
//! 5. All backend errors are propagated, never silently ignored.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{KvError, KvResult};
pub use memory::MemKvStore;
pub use traits::{KvRead, KvStore, KvWrite};
