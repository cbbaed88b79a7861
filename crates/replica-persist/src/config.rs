use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`refresh`](crate::refresh).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshConfig {
    /// Byte budget of chunks copied from the durable store into the memory
    /// store in one refresh. Chunks beyond it are read lazily later.
    pub gather_size_limit: usize,
    /// Pause between recording the refresh in the durable store and
    /// rebasing in the memory store.
    pub delay: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            gather_size_limit: 5 * 1024 * 1024,
            delay: Duration::from_millis(300),
        }
    }
}

impl RefreshConfig {
    /// The default budget without the pause.
    pub fn immediate() -> Self {
        Self {
            delay: Duration::ZERO,
            ..Self::default()
        }
    }
}
