//! Conditional update model (compare-and-set over one item row).
//!
//! Every status change is expressed as `(UpdateGuard, ItemUpdate)`: the store
//! applies the update only if the row still matches the guard, and applies the
//! parent row and its sub-item rows in one atomic step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::SubItemId;
use super::item::WorkItem;
use super::status::ItemStatus;

/// Compare half of a compare-and-set.
///
/// `attempts` increments on every claim, so `(status, attempts)` identifies
/// one specific claim of one item: two workers that observed the same row can
/// never both win, and an outcome can only land on the claim that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateGuard {
    pub status: ItemStatus,
    pub attempts: u32,
}

impl UpdateGuard {
    pub fn new(status: ItemStatus, attempts: u32) -> Self {
        Self { status, attempts }
    }

    /// Guard matching the row exactly as it was observed.
    pub fn observed(item: &WorkItem) -> Self {
        Self::new(item.status, item.attempts)
    }

    pub fn matches(&self, item: &WorkItem) -> bool {
        item.status == self.status && item.attempts == self.attempts
    }
}

/// Set half of a compare-and-set.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemUpdate {
    pub status: ItemStatus,
    pub attempts: u32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,

    /// `None` leaves the stored result untouched.
    pub result: Option<serde_json::Value>,

    pub sub_items: SubItemUpdate,
}

impl ItemUpdate {
    /// `pending|stale claimed -> claimed`, attempts + 1, sub-items follow.
    pub fn claim(item: &WorkItem, now: DateTime<Utc>) -> Self {
        Self {
            status: ItemStatus::Claimed,
            attempts: item.attempts + 1,
            claimed_at: Some(now),
            claimed_by: None,
            completed_at: None,
            result: None,
            sub_items: SubItemUpdate::all(ItemStatus::Claimed),
        }
    }

    /// Record who holds (or last held) the claim.
    pub fn with_owner(mut self, owner: Option<String>) -> Self {
        self.claimed_by = owner;
        self
    }

    /// `claimed -> done|failed` with the result metadata and per-sub-item outcomes.
    pub fn terminal(
        status: ItemStatus,
        attempts: u32,
        claimed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        result: serde_json::Value,
        sub_items: SubItemUpdate,
    ) -> Self {
        debug_assert!(status.is_terminal());
        Self {
            status,
            attempts,
            claimed_at,
            claimed_by: None,
            completed_at: Some(now),
            result: Some(result),
            sub_items,
        }
    }

    /// Operator reset back to `pending`. Attempts and result are kept.
    pub fn reset(item: &WorkItem) -> Self {
        Self {
            status: ItemStatus::Pending,
            attempts: item.attempts,
            claimed_at: None,
            claimed_by: None,
            completed_at: None,
            result: None,
            sub_items: SubItemUpdate::all(ItemStatus::Pending),
        }
    }
}

/// Sub-item changes applied together with the parent row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubItemUpdate {
    /// Status for every sub-item that has no explicit patch (`None` = leave).
    pub default: Option<ItemStatus>,

    pub patches: Vec<SubItemPatch>,
}

impl SubItemUpdate {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn all(status: ItemStatus) -> Self {
        Self {
            default: Some(status),
            patches: Vec::new(),
        }
    }

    /// Status that sub-item `id` ends up with, if it changes at all.
    pub fn status_for(&self, id: SubItemId) -> Option<ItemStatus> {
        self.patch_for(id).map(|p| p.status).or(self.default)
    }

    pub fn patch_for(&self, id: SubItemId) -> Option<&SubItemPatch> {
        self.patches.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubItemPatch {
    pub id: SubItemId,
    pub status: ItemStatus,
    pub result: Option<serde_json::Value>,
}
