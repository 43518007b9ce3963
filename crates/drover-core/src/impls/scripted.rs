//! Scripted collaborators (テスト用).
//!
//! Each collaborator replays a [`Script`] per call, so tests can inject
//! failures, panics and latency at a precise stage.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    ItemId, ItemStatus, ItemUpdate, NewWorkItem, StageFailure, SubItem, SubItemId, UpdateGuard,
    WorkItem,
};
use crate::error::StoreError;
use crate::impls::InMemoryRecordStore;
use crate::ports::{
    ArtifactSink, Artifacts, BacklogCounts, ContentSource, EligibilityQuery, RecordStore,
    StagePayload, SubItemProcessor,
};

#[derive(Debug, Clone)]
pub enum Script {
    Ok(StagePayload),
    Fail(StageFailure),
    Sleep(Duration),
    Panic(String),
}

impl Script {
    async fn play(self) -> Result<StagePayload, StageFailure> {
        match self {
            Script::Ok(payload) => Ok(payload),
            Script::Fail(failure) => Err(failure),
            Script::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(StagePayload::Null)
            }
            Script::Panic(msg) => panic!("{msg}"),
        }
    }
}

/// Content source with a default script and per-item overrides.
pub struct ScriptedSource {
    default: Script,
    per_item: Mutex<HashMap<ItemId, VecDeque<Script>>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            per_item: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn ok() -> Self {
        Self::new(Script::Ok(serde_json::json!({ "title": "page" })))
    }

    /// Queue scripts for `id`; once used up, the default applies again.
    pub async fn script(&self, id: ItemId, scripts: impl IntoIterator<Item = Script>) {
        self.per_item
            .lock()
            .await
            .entry(id)
            .or_default()
            .extend(scripts);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentSource for ScriptedSource {
    async fn fetch(&self, item: &WorkItem) -> Result<StagePayload, StageFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .per_item
            .lock()
            .await
            .get_mut(&item.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default.clone());
        script.play().await
    }
}

/// Sub-item processor failing on chosen ids.
#[derive(Default)]
pub struct ScriptedSubItems {
    failing: HashSet<SubItemId>,
}

impl ScriptedSubItems {
    pub fn fail_on(mut self, id: SubItemId) -> Self {
        self.failing.insert(id);
        self
    }
}

#[async_trait]
impl SubItemProcessor for ScriptedSubItems {
    async fn process(
        &self,
        _parent: &WorkItem,
        _primary: &StagePayload,
        sub_item: &SubItem,
    ) -> Result<StagePayload, StageFailure> {
        if self.failing.contains(&sub_item.id) {
            return Err(StageFailure::permanent(format!(
                "cannot parse {}",
                sub_item.source_url
            )));
        }
        Ok(serde_json::json!({ "pages": 1 }))
    }
}

/// Sink that remembers what it persisted.
#[derive(Default)]
pub struct RecordingSink {
    failure: Option<StageFailure>,
    persisted: Mutex<Vec<ItemId>>,
}

impl RecordingSink {
    pub fn failing(failure: StageFailure) -> Self {
        Self {
            failure: Some(failure),
            persisted: Mutex::new(Vec::new()),
        }
    }

    pub async fn persisted(&self) -> Vec<ItemId> {
        self.persisted.lock().await.clone()
    }
}

#[async_trait]
impl ArtifactSink for RecordingSink {
    async fn persist(
        &self,
        item: &WorkItem,
        artifacts: Artifacts<'_>,
    ) -> Result<StagePayload, StageFailure> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        self.persisted.lock().await.push(item.id);
        Ok(serde_json::json!({ "sub_items": artifacts.sub_items.len() }))
    }
}

/// Where `PanickingStore` crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicPoint {
    /// In `find_eligible`, before anything is claimed.
    Claim,
    /// In a terminal `conditional_update`, leaving the row claimed.
    Record,
}

/// Store wrapper that panics the first `panics` times it reaches its
/// `PanicPoint`, killing the worker task outside the pipeline's panic guard.
pub struct PanickingStore {
    inner: Arc<InMemoryRecordStore>,
    point: PanicPoint,
    remaining: AtomicU32,
}

impl PanickingStore {
    pub fn new(inner: Arc<InMemoryRecordStore>, panics: u32) -> Self {
        Self::at(inner, PanicPoint::Claim, panics)
    }

    pub fn at(inner: Arc<InMemoryRecordStore>, point: PanicPoint, panics: u32) -> Self {
        Self {
            inner,
            point,
            remaining: AtomicU32::new(panics),
        }
    }

    fn trip(&self, point: PanicPoint) {
        if point != self.point {
            return;
        }
        let armed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            panic!("store driver crashed");
        }
    }
}

#[async_trait]
impl RecordStore for PanickingStore {
    async fn insert(&self, item: NewWorkItem, now: DateTime<Utc>) -> Result<WorkItem, StoreError> {
        self.inner.insert(item, now).await
    }

    async fn find_eligible(
        &self,
        query: &EligibilityQuery,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        self.trip(PanicPoint::Claim);
        self.inner.find_eligible(query, limit).await
    }

    async fn conditional_update(
        &self,
        id: ItemId,
        guard: UpdateGuard,
        update: ItemUpdate,
    ) -> Result<bool, StoreError> {
        if update.status.is_terminal() {
            self.trip(PanicPoint::Record);
        }
        self.inner.conditional_update(id, guard, update).await
    }

    async fn read(&self, id: ItemId) -> Result<Option<WorkItem>, StoreError> {
        self.inner.read(id).await
    }

    async fn sub_items(&self, parent: ItemId) -> Result<Vec<SubItem>, StoreError> {
        self.inner.sub_items(parent).await
    }

    async fn list_by_status(
        &self,
        status: ItemStatus,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        self.inner.list_by_status(status, category, limit).await
    }

    async fn counts(
        &self,
        category: Option<&str>,
        stale_before: DateTime<Utc>,
    ) -> Result<BacklogCounts, StoreError> {
        self.inner.counts(category, stale_before).await
    }
}
