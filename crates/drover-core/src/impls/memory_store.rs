//! InMemoryRecordStore - 開発用・テスト用の RecordStore
//!
//! One `tokio::sync::Mutex` guards the whole table, so every conditional
//! update (parent row plus sub-items) is trivially atomic. Rows live in
//! `BTreeMap`s keyed by ULID, which makes iteration order creation order.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    ItemId, ItemStatus, ItemUpdate, NewWorkItem, SubItem, SubItemId, UpdateGuard, WorkItem,
};
use crate::error::StoreError;
use crate::ports::record_store::category_matches;
use crate::ports::{BacklogCounts, EligibilityQuery, RecordStore};

#[derive(Default)]
struct InMemoryStoreState {
    /// All item rows (single source of truth).
    items: BTreeMap<ItemId, WorkItem>,

    /// Sub-item rows, keyed by id.
    sub_items: BTreeMap<SubItemId, SubItem>,

    /// Injected `Unavailable` errors still to be returned.
    #[cfg(test)]
    pending_failures: u32,
}

impl InMemoryStoreState {
    #[cfg(test)]
    fn take_failure(&mut self) -> Result<(), StoreError> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(StoreError::unavailable("injected failure"));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn take_failure(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn children_of(&self, parent: ItemId) -> impl Iterator<Item = &SubItem> {
        self.sub_items.values().filter(move |s| s.parent_id == parent)
    }

    /// Apply `update` to the row and its sub-items. Caller has checked the guard.
    fn apply(&mut self, id: ItemId, update: ItemUpdate, now: DateTime<Utc>) {
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        item.status = update.status;
        item.attempts = update.attempts;
        item.claimed_at = update.claimed_at;
        item.claimed_by = update.claimed_by;
        item.completed_at = update.completed_at;
        if let Some(result) = update.result {
            item.result = Some(result);
        }
        item.updated_at = now;

        for sub in self.sub_items.values_mut().filter(|s| s.parent_id == id) {
            if let Some(patch) = update.sub_items.patch_for(sub.id) {
                sub.status = patch.status;
                if let Some(result) = &patch.result {
                    sub.result = Some(result.clone());
                }
                sub.updated_at = now;
            } else if let Some(status) = update.sub_items.default {
                sub.status = status;
                sub.updated_at = now;
            }
        }
    }
}

/// In-memory record store.
#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    state: Arc<Mutex<InMemoryStoreState>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` store calls fail with `StoreError::Unavailable`.
    #[cfg(test)]
    pub async fn fail_next(&self, n: u32) {
        self.state.lock().await.pending_failures = n;
    }

    /// Overwrite a row directly, bypassing the guard (test setup only).
    #[cfg(test)]
    pub async fn put(&self, item: WorkItem) {
        self.state.lock().await.items.insert(item.id, item);
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, new: NewWorkItem, now: DateTime<Utc>) -> Result<WorkItem, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        if state.items.contains_key(&new.id) {
            return Err(StoreError::Duplicate(new.id));
        }
        // Sub-item ids are unique across the store, like the parent's.
        let mut seen = std::collections::HashSet::new();
        if new
            .sub_items
            .iter()
            .any(|sub| state.sub_items.contains_key(&sub.id) || !seen.insert(sub.id))
        {
            return Err(StoreError::Duplicate(new.id));
        }

        let item = WorkItem::from_new(&new, now);
        for sub in &new.sub_items {
            state
                .sub_items
                .insert(sub.id, SubItem::from_new(new.id, sub, now));
        }
        state.items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn find_eligible(
        &self,
        query: &EligibilityQuery,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        Ok(state
            .items
            .values()
            .filter(|item| query.matches(item))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn conditional_update(
        &self,
        id: ItemId,
        guard: UpdateGuard,
        update: ItemUpdate,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        let Some(item) = state.items.get(&id) else {
            return Ok(false);
        };
        if !guard.matches(item) {
            return Ok(false);
        }

        let now = update
            .completed_at
            .or(update.claimed_at)
            .unwrap_or_else(Utc::now);
        state.apply(id, update, now);
        Ok(true)
    }

    async fn read(&self, id: ItemId) -> Result<Option<WorkItem>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        Ok(state.items.get(&id).cloned())
    }

    async fn sub_items(&self, parent: ItemId) -> Result<Vec<SubItem>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        Ok(state.children_of(parent).cloned().collect())
    }

    async fn list_by_status(
        &self,
        status: ItemStatus,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        Ok(state
            .items
            .values()
            .filter(|item| item.status == status && category_matches(category, item))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn counts(
        &self,
        category: Option<&str>,
        stale_before: DateTime<Utc>,
    ) -> Result<BacklogCounts, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;

        let mut counts = BacklogCounts::default();
        for item in state.items.values() {
            if !category_matches(category, item) {
                continue;
            }
            counts.items.add(item.status);
            counts.attempts += u64::from(item.attempts);
            if item.status == ItemStatus::Claimed
                && item.claimed_at.is_none_or(|t| t <= stale_before)
            {
                counts.stale += 1;
            }
            for sub in state.children_of(item.id) {
                counts.sub_items.add(sub.status);
            }
        }
        Ok(counts)
    }
}
