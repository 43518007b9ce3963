//! Pipeline - run the processing stages for one claimed item.
//!
//! The pipeline is pure with respect to status: it reads the sub-item list
//! from the store but never writes a status. Everything that happens during
//! the run comes back as data in a [`PipelineResult`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::domain::{
    PipelineResult, Stage, StageError, StageFailure, SubItem, SubItemOutcome, WorkItem,
};
use crate::ports::{
    ArtifactSink, Artifacts, ContentSource, Enricher, NoopEnricher, PassThroughSubItems,
    RecordStore, StagePayload, SubItemProcessor,
};

/// The opaque processing collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn ContentSource>,

    /// Tried when `source` fails.
    pub fallback: Option<Arc<dyn ContentSource>>,

    pub sub_items: Arc<dyn SubItemProcessor>,
    pub enricher: Arc<dyn Enricher>,
    pub sink: Arc<dyn ArtifactSink>,
}

impl Collaborators {
    /// Source and sink are mandatory; the rest default to no-ops.
    pub fn new(source: Arc<dyn ContentSource>, sink: Arc<dyn ArtifactSink>) -> Self {
        Self {
            source,
            fallback: None,
            sub_items: Arc::new(PassThroughSubItems),
            enricher: Arc::new(NoopEnricher),
            sink,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ContentSource>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_sub_items(mut self, processor: Arc<dyn SubItemProcessor>) -> Self {
        self.sub_items = processor;
        self
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = enricher;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub stage_timeout: Option<Duration>,
    pub max_duration: Duration,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            stage_timeout: config.stage_timeout(),
            max_duration: config.max_duration(),
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn RecordStore>,
    collaborators: Collaborators,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        collaborators: Collaborators,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            collaborators,
            settings,
        }
    }

    /// Run all stages for `item`. Never fails: failures are part of the result.
    pub async fn run(&self, item: &WorkItem) -> PipelineResult {
        let started = Instant::now();
        let mut result = match tokio::time::timeout(self.settings.max_duration, self.run_stages(item))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    item_id = %item.id,
                    max_duration_secs = self.settings.max_duration.as_secs(),
                    "pipeline exceeded its time budget"
                );
                PipelineResult::failed(StageFailure::timeout(format!(
                    "pipeline exceeded {:?}",
                    self.settings.max_duration
                )))
            }
        };
        result.metrics.total_ms = elapsed_ms(started);
        result.finalize();
        result
    }

    async fn run_stages(&self, item: &WorkItem) -> PipelineResult {
        let mut result = PipelineResult::succeeded();

        // fetch (required)
        let started = Instant::now();
        let fetched = self.fetch(item, &mut result).await;
        result.metrics.stage_ms.insert(Stage::Fetch, elapsed_ms(started));
        let (primary, sub_items) = match fetched {
            Ok(fetched) => fetched,
            // Nothing downstream can run without the primary content.
            Err(failure) => {
                let failed = stage_failed(item, &mut result, Stage::Fetch, failure);
                return failed.unwrap_or(result);
            }
        };

        // sub_items
        let started = Instant::now();
        for sub in &sub_items {
            let outcome = self.process_sub_item(item, &primary, sub).await;
            if let Some(err) = &outcome.error {
                tracing::warn!(item_id = %item.id, sub_item_id = %sub.id, error = %err, "sub-item failed");
            }
            result.per_subitem_outcomes.push(outcome);
        }
        result
            .metrics
            .stage_ms
            .insert(Stage::SubItems, elapsed_ms(started));

        // enrich
        let started = Instant::now();
        let enrichment = self
            .stage(
                Stage::Enrich,
                self.collaborators
                    .enricher
                    .enrich(item, &primary, &result.per_subitem_outcomes),
            )
            .await;
        result.metrics.stage_ms.insert(Stage::Enrich, elapsed_ms(started));
        let enrichment = match enrichment {
            Ok(payload) => Some(payload),
            Err(error) => {
                if let Some(failed) = stage_failed(item, &mut result, Stage::Enrich, error) {
                    return failed;
                }
                None
            }
        };

        // persist
        let started = Instant::now();
        let artifacts = Artifacts {
            primary: &primary,
            sub_items: &result.per_subitem_outcomes,
            enrichment: enrichment.as_ref(),
        };
        let persisted = self
            .stage(Stage::Persist, self.collaborators.sink.persist(item, artifacts))
            .await;
        result.metrics.stage_ms.insert(Stage::Persist, elapsed_ms(started));
        match persisted {
            Ok(payload) => {
                insert_payload(&mut result, Stage::Persist, payload);
            }
            Err(error) => {
                if let Some(failed) = stage_failed(item, &mut result, Stage::Persist, error) {
                    return failed;
                }
            }
        }

        insert_payload(&mut result, Stage::Fetch, primary);
        if let Some(payload) = enrichment {
            insert_payload(&mut result, Stage::Enrich, payload);
        }
        result
    }

    /// Primary content (with fallback) plus the sub-item list.
    async fn fetch(
        &self,
        item: &WorkItem,
        result: &mut PipelineResult,
    ) -> Result<(StagePayload, Vec<SubItem>), StageFailure> {
        let primary = match self
            .stage(Stage::Fetch, self.collaborators.source.fetch(item))
            .await
        {
            Ok(primary) => primary,
            Err(primary_err) => {
                let Some(fallback) = &self.collaborators.fallback else {
                    return Err(primary_err);
                };
                tracing::info!(item_id = %item.id, error = %primary_err, "primary source failed, trying fallback");
                let payload = self
                    .stage(Stage::Fetch, fallback.fetch(item))
                    .await
                    .map_err(|fallback_err| {
                        StageFailure::new(
                            fallback_err.kind,
                            format!("primary: {primary_err}; fallback: {fallback_err}"),
                        )
                    })?;
                result.metrics.used_fallback = true;
                payload
            }
        };

        let sub_items = self
            .store
            .sub_items(item.id)
            .await
            .map_err(|e| StageFailure::transient(format!("loading sub-items: {e}")))?;

        Ok((primary, sub_items))
    }

    async fn process_sub_item(
        &self,
        parent: &WorkItem,
        primary: &StagePayload,
        sub: &SubItem,
    ) -> SubItemOutcome {
        let started = Instant::now();
        let outcome = self
            .stage(
                Stage::SubItems,
                self.collaborators.sub_items.process(parent, primary, sub),
            )
            .await;
        let duration_ms = elapsed_ms(started);

        match outcome {
            Ok(payload) => SubItemOutcome {
                sub_item_id: sub.id,
                success: true,
                payload: Some(payload),
                error: None,
                duration_ms,
            },
            Err(error) => SubItemOutcome {
                sub_item_id: sub.id,
                success: false,
                payload: None,
                error: Some(error),
                duration_ms,
            },
        }
    }

    /// Bound one collaborator call by the stage timeout.
    async fn stage<F>(&self, stage: Stage, call: F) -> Result<StagePayload, StageFailure>
    where
        F: Future<Output = Result<StagePayload, StageFailure>>,
    {
        match self.settings.stage_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                Err(StageFailure::timeout(format!(
                    "{} stage exceeded {limit:?}",
                    stage.as_str()
                )))
            }),
            None => call.await,
        }
    }
}

fn insert_payload(result: &mut PipelineResult, stage: Stage, payload: StagePayload) {
    if !payload.is_null() {
        result.payloads.insert(stage, payload);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Fold a stage failure into `result`.
///
/// A required stage fails the item outright: the returned result replaces
/// `result` and keeps its metrics. Best-effort stages only add a `StageError`.
fn stage_failed(
    item: &WorkItem,
    result: &mut PipelineResult,
    stage: Stage,
    error: StageFailure,
) -> Option<PipelineResult> {
    if stage.is_required() {
        tracing::warn!(item_id = %item.id, stage = stage.as_str(), %error, "required stage failed");
        let mut failed = PipelineResult::failed(error);
        failed.metrics = std::mem::take(&mut result.metrics);
        return Some(failed);
    }
    tracing::warn!(item_id = %item.id, stage = stage.as_str(), %error, "stage failed, continuing");
    result.stage_errors.push(StageError { stage, error });
    None
}
