//! Unified error model for the descriptor store and access checker.
//! Every public operation returns one of these kinds; internal invariant
//! violations (e.g. a cache entry claimed live for a cell that is absent)
//! are logic errors and panic instead of surfacing here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegError {
    /// Cell allocation or dirty-marking failed: out of storage or out of
    /// log space. Never retried inside the core; retry policy belongs to
    /// the caller.
    #[error("storage exhausted: {op}")]
    Exhausted { op: String },

    /// Access evaluation completed and the answer is no.
    #[error("access denied")]
    Denied,

    /// The node behind this handle has been removed; all security
    /// operations on it fail.
    #[error("key has been deleted")]
    Deleted,

    /// A key with live subkeys cannot be deleted.
    #[error("key still has subkeys")]
    NotEmpty,

    /// Subtree traversal exceeded the configured depth bound.
    #[error("tree depth {depth} exceeds the configured bound")]
    TooDeep { depth: usize },

    /// Stored descriptor bytes failed to parse.
    #[error("malformed security descriptor: {reason}")]
    Malformed { reason: String },
}

impl RegError {
    pub fn exhausted(op: impl Into<String>) -> Self {
        RegError::Exhausted { op: op.into() }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        RegError::Malformed { reason: reason.into() }
    }

    /// True for the kinds that indicate resource failure rather than a
    /// legitimate negative answer.
    pub fn is_resource(&self) -> bool {
        matches!(self, RegError::Exhausted { .. })
    }
}

pub type RegResult<T> = Result<T, RegError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_classify() {
        assert!(RegError::exhausted("allocate").is_resource());
        assert!(!RegError::Denied.is_resource());
        assert!(!RegError::Deleted.is_resource());
        assert!(!RegError::NotEmpty.is_resource());
        assert!(!RegError::TooDeep { depth: 513 }.is_resource());
    }

    #[test]
    fn display_has_no_internal_indices() {
        let msg = RegError::exhausted("mark dirty").to_string();
        assert_eq!(msg, "storage exhausted: mark dirty");
        let msg = RegError::malformed("truncated header").to_string();
        assert!(msg.contains("truncated header"));
    }

    #[test]
    fn serde_tagging_round_trips() {
        let e = RegError::TooDeep { depth: 600 };
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("too_deep"));
        let back: RegError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
