use thiserror::Error;

use crate::domain::{ItemId, ItemStatus};

/// Errors raised by a record store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection refused, lock timeout, network partition. Retry with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A row could not be decoded (bad status string, bad JSON, ...).
    #[error("corrupt record {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("item {0} already exists")]
    Duplicate(ItemId),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn corrupt(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Transient errors do not mutate state and are safe to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum DroverError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Every candidate was won by another worker. Benign; claim again.
    #[error("claim conflict: lost every candidate in {rounds} round(s)")]
    ClaimConflict { rounds: u32 },

    #[error("item {0} not found")]
    ItemNotFound(ItemId),

    #[error("cannot {op} item {item_id} in status {status}")]
    InvalidTransition {
        item_id: ItemId,
        status: ItemStatus,
        op: &'static str,
    },

    /// A live (not yet stale) claim is held by another worker.
    #[error("item {item_id} is already claimed by {}", .owner.as_deref().unwrap_or("another worker"))]
    AlreadyClaimed {
        item_id: ItemId,
        owner: Option<String>,
    },

    /// The row kept changing under an operator update.
    #[error("item {0} is contended, try again")]
    Contended(ItemId),

    #[error("config error: {0}")]
    Config(String),
}

impl DroverError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Only transient store errors cross the worker loop boundary.
    pub fn is_transient(&self) -> bool {
        match self {
            DroverError::Store(e) => e.is_transient(),
            DroverError::ClaimConflict { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T, E = DroverError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::unavailable("timeout").is_transient());
        assert!(!StoreError::corrupt("k", "bad json").is_transient());

        let err: DroverError = StoreError::unavailable("down").into();
        assert!(err.is_transient());
        assert!(DroverError::ClaimConflict { rounds: 3 }.is_transient());
        assert!(!DroverError::config("bad").is_transient());
    }

    #[test]
    fn error_display_formatting() {
        let err: DroverError = StoreError::unavailable("connection refused").into();
        assert_eq!(err.to_string(), "store unavailable: connection refused");
    }

    #[test]
    fn already_claimed_names_the_owner() {
        let item_id = ItemId::from_ulid(ulid::Ulid::nil());
        let err = DroverError::AlreadyClaimed {
            item_id,
            owner: Some("worker-2@77".into()),
        };
        assert!(err.to_string().ends_with("is already claimed by worker-2@77"));

        let err = DroverError::AlreadyClaimed { item_id, owner: None };
        assert!(err.to_string().ends_with("by another worker"));
    }
}
