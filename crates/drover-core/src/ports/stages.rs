//! Processing collaborators - the opaque pipeline stages.
//!
//! Scraping, PDF/table/image parsing, embeddings and graph construction all
//! live behind these traits. The core only sees success/failure plus an opaque
//! JSON payload that it passes through into the item's result.
//!
//! Stages may run more than once for the same item (a slow worker can be
//! reclaimed after the staleness timeout), so implementations should be
//! idempotent for the same input.

use async_trait::async_trait;

use crate::domain::{StageFailure, SubItem, SubItemOutcome, WorkItem};

/// Opaque stage output.
pub type StagePayload = serde_json::Value;

/// Fetches and parses the primary content of an item. Required stage.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(&self, item: &WorkItem) -> Result<StagePayload, StageFailure>;
}

/// Fetches and processes one attachment.
#[async_trait]
pub trait SubItemProcessor: Send + Sync {
    async fn process(
        &self,
        parent: &WorkItem,
        primary: &StagePayload,
        sub_item: &SubItem,
    ) -> Result<StagePayload, StageFailure>;
}

/// Extraction / enrichment over everything fetched for the item.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(
        &self,
        item: &WorkItem,
        primary: &StagePayload,
        sub_items: &[SubItemOutcome],
    ) -> Result<StagePayload, StageFailure>;
}

/// What the persist stage receives.
#[derive(Debug, Clone, Copy)]
pub struct Artifacts<'a> {
    pub primary: &'a StagePayload,
    pub sub_items: &'a [SubItemOutcome],
    pub enrichment: Option<&'a StagePayload>,
}

/// Writes derived artifacts (documents, images, graph input) somewhere durable.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn persist(
        &self,
        item: &WorkItem,
        artifacts: Artifacts<'_>,
    ) -> Result<StagePayload, StageFailure>;
}

/// Enricher that does nothing; for deployments without an enrichment step.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEnricher;

#[async_trait]
impl Enricher for NoopEnricher {
    async fn enrich(
        &self,
        _item: &WorkItem,
        _primary: &StagePayload,
        _sub_items: &[SubItemOutcome],
    ) -> Result<StagePayload, StageFailure> {
        Ok(StagePayload::Null)
    }
}

/// Processor that accepts every sub-item without looking at it.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughSubItems;

#[async_trait]
impl SubItemProcessor for PassThroughSubItems {
    async fn process(
        &self,
        _parent: &WorkItem,
        _primary: &StagePayload,
        sub_item: &SubItem,
    ) -> Result<StagePayload, StageFailure> {
        Ok(serde_json::json!({ "source_url": sub_item.source_url }))
    }
}
