//! Copy-on-write B-tree persisted as chunks of a Replica DAG.
//!
//! Keys are strings ordered by their UTF-8 bytes; values are JSON. Node
//! sizes are bounded in bytes rather than by fan-out. Editing never touches
//! a stored node: edited nodes get temp hashes and are written bottom-up on
//! flush.
//!
//! # Key Types
//!
//! - [`NodeSource`]: read operations `get`, `scan`, `entries`, `diff`
//! - [`BTreeRead`]: read-only view of a root inside a DAG read
//! - [`BTreeWrite`]: editable tree inside a DAG write
//! - [`InternalDiffOperation`]: one add, del, or change between two roots
//! - [`BTreeConfig`]: node size bounds

pub mod config;
pub mod error;
pub mod node;
pub mod read;
pub mod splice;
pub mod write;

pub use config::BTreeConfig;
pub use error::{BTreeError, BTreeResult};
pub use node::{Entry, Node};
pub use read::{
    all_entries_as_diff, BTreeRead, DiffKind, InternalDiff, InternalDiffOperation, NodeSource,
};
pub use splice::{compute_splices, Splice};
pub use write::BTreeWrite;
