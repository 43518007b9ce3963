//! Work item records: the rows of the shared record store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ItemId, SubItemId};
use super::status::ItemStatus;

/// One unit of backlog content (a page).
///
/// Design:
/// - This is the single source of truth for the item's state; it lives in the
///   record store, never in worker memory.
/// - `status`/`claimed_at`/`attempts` change only through conditional updates
///   issued by the claim manager, the outcome recorder and the operator reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,

    /// Batch filter (product subcategory, site section, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Where the primary content is fetched from.
    pub source_url: String,

    pub status: ItemStatus,

    /// Set on every claim; drives staleness detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    /// Worker that made the latest claim (`worker-3@4711`, `cli@4711`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,

    /// Number of claims consumed by this item (monotonic).
    pub attempts: u32,

    /// Opaque result metadata, written at terminal states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Build a fresh `pending` row from an ingestion record.
    pub fn from_new(new: &NewWorkItem, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            category: new.category.clone(),
            source_url: new.source_url.clone(),
            status: ItemStatus::Pending,
            claimed_at: None,
            claimed_by: None,
            attempts: 0,
            result: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Claimed, and the claim is older than `staleness_timeout`.
    pub fn is_stale(&self, now: DateTime<Utc>, staleness_timeout: Duration) -> bool {
        match (self.status, self.claimed_at) {
            (ItemStatus::Claimed, Some(claimed_at)) => now - claimed_at >= staleness_timeout,
            // A claimed row without a timestamp can never be recovered otherwise.
            (ItemStatus::Claimed, None) => true,
            _ => false,
        }
    }

    /// Can a worker claim this row right now?
    pub fn is_claimable(&self, now: DateTime<Utc>, staleness_timeout: Duration) -> bool {
        self.status == ItemStatus::Pending || self.is_stale(now, staleness_timeout)
    }
}

/// Claims made at or before this instant are stale.
///
/// A timeout reaching past chrono's range means nothing is ever stale.
pub fn stale_before(now: DateTime<Utc>, staleness_timeout: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(staleness_timeout)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Dependent content (an attachment) processed within its parent's pipeline run.
///
/// No independent claim: whoever holds the parent's claim owns the sub-items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubItem {
    pub id: SubItemId,
    pub parent_id: ItemId,
    pub source_url: String,
    pub status: ItemStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    pub updated_at: DateTime<Utc>,
}

impl SubItem {
    pub fn from_new(parent_id: ItemId, new: &NewSubItem, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            parent_id,
            source_url: new.source_url.clone(),
            status: ItemStatus::Pending,
            result: None,
            updated_at: now,
        }
    }
}

/// Ingestion input for one work item and its sub-items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub id: ItemId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    pub source_url: String,

    #[serde(default)]
    pub sub_items: Vec<NewSubItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSubItem {
    pub id: SubItemId,
    pub source_url: String,
}
