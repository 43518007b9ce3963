//! RecordStore port - the shared, durable table of work items.
//!
//! All coordination between workers happens here. The store must provide
//! per-row conditional writes (compare-and-set) with at least read-committed
//! isolation; no client-side locking is ever layered on top.
//!
//! # Implementations
//! - `impls::InMemoryRecordStore`: one process, tests and demos
//! - `drover-libsql`: embedded SQLite file shared by several processes

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ItemId, ItemStatus, ItemUpdate, NewWorkItem, SubItem, UpdateGuard, WorkItem,
};
use crate::error::StoreError;

/// Which rows a worker may claim right now.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibilityQuery {
    /// Claimed rows with `claimed_at <= stale_before` are abandoned.
    pub stale_before: DateTime<Utc>,

    pub category: Option<String>,
}

impl EligibilityQuery {
    pub fn matches(&self, item: &WorkItem) -> bool {
        let eligible = match item.status {
            ItemStatus::Pending => true,
            ItemStatus::Claimed => item.claimed_at.is_none_or(|t| t <= self.stale_before),
            ItemStatus::Done | ItemStatus::Failed => false,
        };
        eligible && category_matches(self.category.as_deref(), item)
    }
}

pub(crate) fn category_matches(filter: Option<&str>, item: &WorkItem) -> bool {
    match filter {
        Some(c) => item.category.as_deref() == Some(c),
        None => true,
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub claimed: usize,
    pub done: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Pending => self.pending += 1,
            ItemStatus::Claimed => self.claimed += 1,
            ItemStatus::Done => self.done += 1,
            ItemStatus::Failed => self.failed += 1,
        }
    }

    pub fn get(&self, status: ItemStatus) -> usize {
        match status {
            ItemStatus::Pending => self.pending,
            ItemStatus::Claimed => self.claimed,
            ItemStatus::Done => self.done,
            ItemStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.done + self.failed
    }

    /// Nothing left to do and nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.claimed == 0
    }
}

/// Aggregate view used by the operator `status` query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogCounts {
    pub items: StatusCounts,
    pub sub_items: StatusCounts,

    /// Claimed items whose claim is older than the staleness timeout.
    pub stale: usize,

    /// Sum of `attempts` over all counted items.
    pub attempts: u64,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Bulk ingestion helper; the row starts `pending`.
    async fn insert(&self, item: NewWorkItem, now: DateTime<Utc>) -> Result<WorkItem, StoreError>;

    /// Claimable rows, oldest first (id order), at most `limit`.
    async fn find_eligible(
        &self,
        query: &EligibilityQuery,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Apply `update` iff the row still matches `guard`. Returns whether it did.
    ///
    /// The parent row and every sub-item change in `update.sub_items` are
    /// applied atomically: all of them or none.
    async fn conditional_update(
        &self,
        id: ItemId,
        guard: UpdateGuard,
        update: ItemUpdate,
    ) -> Result<bool, StoreError>;

    async fn read(&self, id: ItemId) -> Result<Option<WorkItem>, StoreError>;

    /// Sub-items of `parent`, in id order.
    async fn sub_items(&self, parent: ItemId) -> Result<Vec<SubItem>, StoreError>;

    /// Rows in `status`, oldest first, at most `limit`.
    async fn list_by_status(
        &self,
        status: ItemStatus,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    async fn counts(
        &self,
        category: Option<&str>,
        stale_before: DateTime<Utc>,
    ) -> Result<BacklogCounts, StoreError>;
}
