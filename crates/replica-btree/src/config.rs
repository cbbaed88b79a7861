use serde::{Deserialize, Serialize};

use crate::error::{BTreeError, BTreeResult};

/// Byte-size bounds for B-tree nodes.
///
/// A node grows until its size exceeds `max_size`, at which point it is
/// re-partitioned into nodes of at least `min_size` bytes where possible.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BTreeConfig {
    /// Lower bound a node is grown to when it is re-partitioned.
    pub min_size: usize,
    /// Upper bound that triggers a split.
    pub max_size: usize,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            min_size: 8 * 1024,
            max_size: 16 * 1024,
        }
    }
}

impl BTreeConfig {
    /// Tiny nodes, so that a handful of entries already builds a deep tree.
    pub fn small() -> Self {
        Self {
            min_size: 128,
            max_size: 256,
        }
    }

    /// Check that the bounds leave room for at least one partition.
    pub fn validate(&self) -> BTreeResult<()> {
        if self.min_size == 0 {
            return Err(BTreeError::InvalidConfig("min_size must be positive".into()));
        }
        if self.min_size >= self.max_size {
            return Err(BTreeError::InvalidConfig(format!(
                "min_size {} must be less than max_size {}",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        BTreeConfig::default().validate().unwrap();
        BTreeConfig::small().validate().unwrap();
    }

    #[test]
    fn rejects_degenerate_bounds() {
        let zero = BTreeConfig { min_size: 0, max_size: 10 };
        let inverted = BTreeConfig { min_size: 10, max_size: 10 };
        assert!(matches!(zero.validate(), Err(BTreeError::InvalidConfig(_))));
        assert!(matches!(inverted.validate(), Err(BTreeError::InvalidConfig(_))));
    }

    #[test]
    fn serde_uses_camel_case() {
        let json = serde_json::to_value(BTreeConfig::small()).unwrap();
        assert_eq!(json, serde_json::json!({"minSize": 128, "maxSize": 256}));
    }
}
