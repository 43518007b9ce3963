//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - store, content source and artifact sink are mandatory
//! - the config is validated in `build()`, before any worker starts
//! - everything else (clock, fallback, enricher, sub-item processor) has a default

use std::sync::Arc;

use crate::app::claim::{ClaimManager, ClaimSettings};
use crate::app::operator::Operator;
use crate::app::pipeline::{Collaborators, Pipeline, PipelineSettings};
use crate::app::recorder::OutcomeRecorder;
use crate::app::supervisor::{Supervisor, SupervisorSettings, WorkerFactory};
use crate::app::worker_loop::WorkerLoop;
use crate::config::DroverConfig;
use crate::error::DroverError;
use crate::ports::{
    ArtifactSink, Clock, ContentSource, Enricher, RecordStore, SubItemProcessor, SystemClock,
};

/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(config)
///     .store(Arc::new(store))
///     .source(Arc::new(HttpSource::new(..)))
///     .sink(Arc::new(FsArtifactSink::new(..)))
///     .build()?;
/// let report = app.supervisor().run_until_signal().await;
/// ```
pub struct AppBuilder {
    config: DroverConfig,
    store: Option<Arc<dyn RecordStore>>,
    clock: Arc<dyn Clock>,
    source: Option<Arc<dyn ContentSource>>,
    fallback: Option<Arc<dyn ContentSource>>,
    sub_items: Option<Arc<dyn SubItemProcessor>>,
    enricher: Option<Arc<dyn Enricher>>,
    sink: Option<Arc<dyn ArtifactSink>>,
}

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing components: {0:?}. These must be provided before build().")]
    MissingComponents(Vec<&'static str>),

    #[error(transparent)]
    InvalidConfig(#[from] DroverError),
}

impl AppBuilder {
    pub fn new(config: DroverConfig) -> Self {
        Self {
            config,
            store: None,
            clock: Arc::new(SystemClock),
            source: None,
            fallback: None,
            sub_items: None,
            enricher: None,
            sink: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn source(mut self, source: Arc<dyn ContentSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn ContentSource>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn sub_items(mut self, processor: Arc<dyn SubItemProcessor>) -> Self {
        self.sub_items = Some(processor);
        self
    }

    pub fn enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        let mut missing = Vec::new();
        if self.store.is_none() {
            missing.push("store");
        }
        if self.source.is_none() {
            missing.push("source");
        }
        if self.sink.is_none() {
            missing.push("sink");
        }
        let (Some(store), Some(source), Some(sink)) = (self.store, self.source, self.sink) else {
            return Err(BuildError::MissingComponents(missing));
        };

        self.config.validate()?;

        let mut collaborators = Collaborators::new(source, sink);
        if let Some(fallback) = self.fallback {
            collaborators = collaborators.with_fallback(fallback);
        }
        if let Some(processor) = self.sub_items {
            collaborators = collaborators.with_sub_items(processor);
        }
        if let Some(enricher) = self.enricher {
            collaborators = collaborators.with_enricher(enricher);
        }

        Ok(App {
            config: Arc::new(self.config),
            store,
            clock: self.clock,
            collaborators,
        })
    }
}

/// Wired components; cheap to clone.
#[derive(Clone)]
pub struct App {
    config: Arc<DroverConfig>,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    collaborators: Collaborators,
}

impl App {
    pub fn config(&self) -> &DroverConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store)
    }

    pub fn claim_manager(&self) -> ClaimManager {
        ClaimManager::new(
            self.store(),
            Arc::clone(&self.clock),
            ClaimSettings::from(&self.config.claim),
        )
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.store(),
            self.collaborators.clone(),
            PipelineSettings::from(&self.config.pipeline),
        )
    }

    pub fn recorder(&self) -> OutcomeRecorder {
        OutcomeRecorder::new(
            self.store(),
            Arc::clone(&self.clock),
            self.config.recorder.retry_policy(),
            self.config.recorder.max_retries,
        )
    }

    pub fn operator(&self) -> Operator {
        Operator::new(
            self.store(),
            Arc::clone(&self.clock),
            self.config.claim.staleness_timeout(),
        )
    }

    pub fn worker(&self, worker_id: usize) -> WorkerLoop {
        self.worker_as(worker_id, format!("worker-{worker_id}@{}", std::process::id()))
    }

    /// Worker loop whose claims carry `owner` as the lock holder.
    pub fn worker_as(&self, worker_id: usize, owner: impl Into<String>) -> WorkerLoop {
        WorkerLoop::new(
            worker_id,
            self.claim_manager().with_owner(owner),
            self.pipeline(),
            self.recorder(),
            self.config.worker.idle_policy(),
        )
    }

    /// Start `worker.count` supervised workers.
    pub fn supervisor(&self) -> Supervisor {
        let app = self.clone();
        let factory: WorkerFactory = Arc::new(move |worker_id| app.worker(worker_id));
        Supervisor::start(
            factory,
            SupervisorSettings::from_config(
                self.config.worker.count,
                self.config.worker.stagger(),
                &self.config.supervisor,
            ),
        )
    }
}
