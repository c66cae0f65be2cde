//! Per-hive tuning knobs. Loaded from JSON when a settings file is present,
//! otherwise defaults apply. The subtree depth bound lives here on purpose:
//! the traversal refuses to recurse past it, and callers that host unusually
//! deep namespaces are expected to raise it explicitly.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bucket count of the descriptor dedup hash (conv key modulo this).
    #[serde(default = "StoreConfig::default_hash_buckets")]
    pub security_hash_buckets: usize,
    /// Hard bound on subtree-walk depth; exceeding it fails with TooDeep.
    #[serde(default = "StoreConfig::default_max_depth")]
    pub max_tree_depth: usize,
}

impl StoreConfig {
    fn default_hash_buckets() -> usize { 64 }
    fn default_max_depth() -> usize { 512 }

    /// Read settings from a JSON file, falling back to defaults if the file
    /// is absent or unreadable (startup must not fail on a missing file).
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match std::fs::read(path.as_ref()) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            security_hash_buckets: Self::default_hash_buckets(),
            max_tree_depth: Self::default_max_depth(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.security_hash_buckets, 64);
        assert_eq!(cfg.max_tree_depth, 512);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: StoreConfig = serde_json::from_str(r#"{"max_tree_depth": 16}"#).unwrap();
        assert_eq!(cfg.max_tree_depth, 16);
        assert_eq!(cfg.security_hash_buckets, 64);
    }

    #[test]
    fn load_missing_file_is_default() {
        let cfg = StoreConfig::load_or_default("/nonexistent/store.json");
        assert_eq!(cfg.max_tree_depth, 512);
    }
}
