//! Foundation types for the Replica sync engine.
//!
//! Every other Replica crate depends on `replica-types`. It provides the
//! identity token used to address chunks and the helpers for measuring the
//! JSON values stored in them.
//!
//! # Key Types
//!
//! - [`Hash`]: opaque, totally ordered chunk identity (UUID-shaped, legacy, or temp)
//! - [`ChunkHasher`]: injectable hash function used when creating chunks
//! - [`TempHashes`]: monotonic source of temp hashes for unflushed nodes
//! - [`size_of_value`]: estimated encoded byte size of a JSON value

pub mod error;
pub mod hash;
pub mod json;

pub use error::TypeError;
pub use hash::{content_hasher, fake_hasher, random_hasher, ChunkHasher, Hash, TempHashes};
pub use json::{size_of_value, Value};
