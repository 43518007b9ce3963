//! Supervisor - N 個の WorkerLoop を監視する
//!
//! # フロー
//! 1. `start()` で worker を stagger 付きで spawn
//! 2. monitor tick ごとに終了した worker を検出し、backoff 後に再起動
//!    （`max_restarts` を使い切った slot は retired）
//! 3. `shutdown()` で停止信号を送り、deadline まで待ってから abort
//!
//! A worker that dies mid-item leaves its row `claimed`; nothing here
//! repairs it. The row becomes eligible again once its claim is stale.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::app::operator::Operator;
use crate::app::worker_loop::{WorkerLoop, WorkerState, WorkerStats, sleep_or_shutdown};
use crate::config::SupervisorConfig;
use crate::error::Result;

/// Builds the worker loop for a slot; called again on every restart.
pub type WorkerFactory = Arc<dyn Fn(usize) -> WorkerLoop + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub workers: usize,
    pub stagger: Duration,
    pub monitor_interval: Duration,
    pub restart_backoff: Duration,
    /// Restarts per slot. `None` = unlimited.
    pub max_restarts: Option<u32>,
    pub shutdown_deadline: Duration,
}

impl SupervisorSettings {
    pub fn from_config(workers: usize, stagger: Duration, config: &SupervisorConfig) -> Self {
        Self {
            workers,
            stagger,
            monitor_interval: config.monitor_interval(),
            restart_backoff: config.restart_backoff(),
            max_restarts: config.max_restarts,
            shutdown_deadline: config.shutdown_deadline(),
        }
    }
}

/// Summary returned after shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorReport {
    /// Merged counters of every worker that exited cleanly.
    pub stats: WorkerStats,

    /// Worker tasks that ended unexpectedly (panic or early return).
    pub crashes: u32,

    pub restarts: u32,

    /// Slots whose worker had to be aborted at the shutdown deadline.
    pub aborted: Vec<usize>,
}

struct Slot {
    worker_id: usize,
    handle: JoinHandle<WorkerStats>,
    state: watch::Receiver<WorkerState>,
    restarts: u32,
    /// Restart budget used up; the slot stays empty.
    retired: bool,
}

/// Worker group handle.
/// - `shutdown()` sends the signal, waits up to the deadline, then aborts
/// - a monitor tick restarts workers that died while no shutdown was requested
pub struct Supervisor {
    factory: WorkerFactory,
    settings: SupervisorSettings,
    shutdown_tx: watch::Sender<bool>,
    slots: Vec<Slot>,
    report: SupervisorReport,
}

impl Supervisor {
    /// Spawn `settings.workers` workers; worker `i` starts after `i * stagger`.
    pub fn start(factory: WorkerFactory, settings: SupervisorSettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let mut supervisor = Self {
            factory,
            settings,
            shutdown_tx,
            slots: Vec::new(),
            report: SupervisorReport::default(),
        };

        for worker_id in 0..supervisor.settings.workers {
            let delay = supervisor.settings.stagger.saturating_mul(worker_id as u32);
            let slot = supervisor.spawn(worker_id, delay, 0);
            supervisor.slots.push(slot);
        }
        tracing::info!(workers = supervisor.settings.workers, "supervisor started");
        supervisor
    }

    fn spawn(&self, worker_id: usize, delay: Duration, restarts: u32) -> Slot {
        let worker = (self.factory)(worker_id);
        let state = worker.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            if !delay.is_zero() && !sleep_or_shutdown(delay, &mut shutdown).await {
                return WorkerStats::default();
            }
            worker.run(shutdown).await
        });

        Slot {
            worker_id,
            handle,
            state,
            restarts,
            retired: false,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Current state of every live worker.
    pub fn states(&self) -> Vec<(usize, WorkerState)> {
        self.slots
            .iter()
            .filter(|s| !s.retired)
            .map(|s| (s.worker_id, *s.state.borrow()))
            .collect()
    }

    /// One liveness pass: restart every worker that ended unexpectedly.
    pub async fn check_workers(&mut self) {
        if self.is_shutting_down() {
            return;
        }

        for i in 0..self.slots.len() {
            let slot = &self.slots[i];
            if slot.retired || !slot.handle.is_finished() {
                continue;
            }

            let worker_id = slot.worker_id;
            let restarts = slot.restarts;
            self.report.crashes += 1;
            // Already finished, so this resolves immediately.
            match (&mut self.slots[i].handle).await {
                Ok(stats) => {
                    tracing::error!(worker_id, "worker exited without a shutdown request");
                    self.report.stats.merge(&stats);
                }
                Err(e) if e.is_panic() => {
                    tracing::error!(worker_id, error = %e, "worker panicked");
                }
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "worker task failed");
                }
            }

            if self.settings.max_restarts.is_some_and(|max| restarts >= max) {
                tracing::error!(worker_id, restarts, "restart budget exhausted, slot retired");
                self.slots[i].retired = true;
                continue;
            }

            tracing::warn!(
                worker_id,
                restart = restarts + 1,
                backoff_ms = self.settings.restart_backoff.as_millis() as u64,
                "restarting worker"
            );
            self.report.restarts += 1;
            self.slots[i] = self.spawn(worker_id, self.settings.restart_backoff, restarts + 1);
        }
    }

    /// Monitor workers until `stop` resolves, then shut down.
    pub async fn run_until<F>(mut self, stop: F) -> SupervisorReport
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.settings.monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(stop);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => self.check_workers().await,
            }
        }
        self.shutdown().await
    }

    /// Run until Ctrl-C.
    pub async fn run_until_signal(self) -> SupervisorReport {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for ctrl-c, stopping");
                return;
            }
            tracing::info!("ctrl-c received, shutting down");
        })
        .await
    }

    /// Run until nothing is `pending` or `claimed`, then shut down.
    pub async fn run_until_drained(
        mut self,
        operator: &Operator,
        category: Option<&str>,
    ) -> Result<SupervisorReport> {
        let mut ticker = tokio::time::interval(self.settings.monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.check_workers().await;

            let status = match operator.status(category).await {
                Ok(status) => status,
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "status check failed, will retry");
                    continue;
                }
                Err(e) => {
                    self.shutdown().await;
                    return Err(e);
                }
            };
            if status.is_drained() {
                tracing::info!(
                    done = status.items.done,
                    failed = status.items.failed,
                    "backlog drained"
                );
                break;
            }
            if self.slots.iter().all(|s| s.retired) {
                tracing::error!("every worker slot retired before the backlog drained");
                break;
            }
        }
        Ok(self.shutdown().await)
    }

    /// Signal shutdown, wait for in-flight items up to the deadline, abort the rest.
    pub async fn shutdown(mut self) -> SupervisorReport {
        self.shutdown_tx.send_replace(true);
        let deadline = Instant::now() + self.settings.shutdown_deadline;
        tracing::info!(
            deadline_secs = self.settings.shutdown_deadline.as_secs(),
            "shutdown requested, waiting for workers"
        );

        for slot in self.slots.drain(..) {
            if slot.retired {
                continue;
            }
            let mut handle = slot.handle;
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(stats)) => self.report.stats.merge(&stats),
                Ok(Err(e)) => {
                    tracing::error!(worker_id = slot.worker_id, error = %e, "worker ended abnormally");
                    self.report.crashes += 1;
                }
                Err(_) => {
                    tracing::warn!(worker_id = slot.worker_id, "shutdown deadline passed, aborting worker");
                    handle.abort();
                    self.report.aborted.push(slot.worker_id);
                }
            }
        }

        tracing::info!(report = ?self.report, "supervisor stopped");
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::claim::{ClaimManager, ClaimSettings};
    use crate::app::pipeline::{Collaborators, Pipeline, PipelineSettings};
    use crate::app::recorder::OutcomeRecorder;
    use crate::domain::{ItemId, ItemStatus, NewWorkItem, RetryPolicy};
    use crate::impls::InMemoryRecordStore;
    use crate::impls::scripted::{PanicPoint, PanickingStore, RecordingSink, Script, ScriptedSource};
    use crate::ports::{Clock, RecordStore, SystemClock};
    use std::collections::HashSet;
    use ulid::Ulid;

    fn settings(workers: usize) -> SupervisorSettings {
        SupervisorSettings {
            workers,
            stagger: Duration::from_millis(2),
            monitor_interval: Duration::from_millis(10),
            restart_backoff: Duration::from_millis(5),
            max_restarts: Some(3),
            shutdown_deadline: Duration::from_secs(2),
        }
    }

    fn factory(store: Arc<dyn RecordStore>, source: Arc<ScriptedSource>) -> WorkerFactory {
        factory_with_staleness(store, source, chrono::Duration::seconds(60))
    }

    fn factory_with_staleness(
        store: Arc<dyn RecordStore>,
        source: Arc<ScriptedSource>,
        staleness_timeout: chrono::Duration,
    ) -> WorkerFactory {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Arc::new(move |worker_id| {
            let claims = ClaimManager::new(
                store.clone(),
                clock.clone(),
                ClaimSettings {
                    staleness_timeout,
                    candidate_window: 4,
                    max_rounds: 3,
                    category: None,
                },
            );
            let pipeline = Pipeline::new(
                store.clone(),
                Collaborators::new(source.clone(), Arc::new(RecordingSink::default())),
                PipelineSettings {
                    stage_timeout: Some(Duration::from_secs(1)),
                    max_duration: Duration::from_secs(5),
                },
            );
            let recorder = OutcomeRecorder::new(
                store.clone(),
                clock.clone(),
                RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
                3,
            );
            WorkerLoop::new(
                worker_id,
                claims,
                pipeline,
                recorder,
                RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
            )
        })
    }

    async fn seed(store: &dyn RecordStore, n: usize) -> Vec<ItemId> {
        let mut ids = Vec::new();
        for _ in 0..n {
            let new = NewWorkItem {
                id: ItemId::from_ulid(Ulid::new()),
                category: None,
                source_url: "https://example.com/p".into(),
                sub_items: vec![],
            };
            ids.push(store.insert(new, chrono::Utc::now()).await.unwrap().id);
        }
        ids
    }

    fn operator(store: Arc<dyn RecordStore>) -> Operator {
        Operator::new(store, Arc::new(SystemClock), chrono::Duration::seconds(60))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn five_workers_drain_twelve_items_exactly_once() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let ids = seed(store.as_ref(), 12).await;
        let source = Arc::new(ScriptedSource::ok());

        let supervisor = Supervisor::start(factory(store.clone(), source.clone()), settings(5));
        let report = supervisor
            .run_until_drained(&operator(store.clone()), None)
            .await
            .unwrap();

        let status = operator(store.clone()).status(None).await.unwrap();
        assert_eq!(status.items.done, 12);
        assert_eq!(status.total_attempts, 12);
        assert_eq!(source.calls(), 12);
        assert_eq!(report.stats.claimed, 12);
        assert_eq!(report.stats.done, 12);
        assert!(report.aborted.is_empty());

        let mut seen = HashSet::new();
        for id in ids {
            let item = store.read(id).await.unwrap().unwrap();
            assert_eq!(item.status, ItemStatus::Done);
            assert_eq!(item.attempts, 1);
            seen.insert(id);
        }
        assert_eq!(seen.len(), 12);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panicking_item_does_not_block_the_backlog() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let ids = seed(store.as_ref(), 6).await;
        let source = Arc::new(ScriptedSource::ok());
        source.script(ids[2], [Script::Panic("boom".into())]).await;

        let supervisor = Supervisor::start(factory(store.clone(), source), settings(3));
        let report = supervisor
            .run_until_drained(&operator(store.clone()), None)
            .await
            .unwrap();

        let status = operator(store.clone()).status(None).await.unwrap();
        assert_eq!(status.items.done, 5);
        assert_eq!(status.items.failed, 1);
        assert_eq!(report.stats.panics, 1);
        assert_eq!(report.crashes, 0);
    }

    #[tokio::test]
    async fn crashed_worker_is_restarted() {
        let inner = Arc::new(InMemoryRecordStore::new());
        seed(inner.as_ref(), 3).await;
        let store: Arc<dyn RecordStore> = Arc::new(PanickingStore::new(inner.clone(), 1));

        let supervisor =
            Supervisor::start(factory(store.clone(), Arc::new(ScriptedSource::ok())), settings(1));
        let report = supervisor
            .run_until_drained(&operator(inner.clone()), None)
            .await
            .unwrap();

        assert_eq!(report.crashes, 1);
        assert_eq!(report.restarts, 1);
        assert_eq!(report.stats.done, 3);
        let status = operator(inner).status(None).await.unwrap();
        assert_eq!(status.items.done, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn claims_orphaned_by_crashed_workers_are_reclaimed_once_stale() {
        let inner = Arc::new(InMemoryRecordStore::new());
        let ids = seed(inner.as_ref(), 12).await;
        let store: Arc<dyn RecordStore> =
            Arc::new(PanickingStore::at(inner.clone(), PanicPoint::Record, 2));
        let source = Arc::new(ScriptedSource::ok());
        let factory =
            factory_with_staleness(store, source.clone(), chrono::Duration::milliseconds(300));

        let supervisor = Supervisor::start(factory, settings(5));
        let report = supervisor
            .run_until_drained(&operator(inner.clone()), None)
            .await
            .unwrap();

        assert_eq!(report.crashes, 2);
        assert_eq!(report.restarts, 2);
        assert_eq!(report.stats.reclaimed, 2);

        let status = operator(inner.clone()).status(None).await.unwrap();
        assert_eq!(status.items.done, 12);
        assert_eq!(status.items.claimed, 0);
        // One attempt per item plus one per staleness-triggered reclaim.
        assert_eq!(status.total_attempts, 12 + report.stats.reclaimed);
        assert_eq!(source.calls(), 14);

        let reclaimed: Vec<_> = {
            let mut rows = Vec::new();
            for id in ids {
                rows.push(inner.read(id).await.unwrap().unwrap());
            }
            rows.into_iter().filter(|item| item.attempts == 2).collect()
        };
        assert_eq!(reclaimed.len(), 2);
        assert!(reclaimed.iter().all(|item| item.status == ItemStatus::Done));
    }

    #[tokio::test]
    async fn restart_budget_retires_the_slot() {
        let inner = Arc::new(InMemoryRecordStore::new());
        seed(inner.as_ref(), 1).await;
        let store: Arc<dyn RecordStore> = Arc::new(PanickingStore::new(inner.clone(), u32::MAX));
        let mut s = settings(1);
        s.max_restarts = Some(2);

        let supervisor = Supervisor::start(factory(store, Arc::new(ScriptedSource::ok())), s);
        let report = supervisor
            .run_until_drained(&operator(inner), None)
            .await
            .unwrap();

        assert_eq!(report.restarts, 2);
        assert_eq!(report.crashes, 3);
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_in_flight_item() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let ids = seed(store.as_ref(), 1).await;
        let source = Arc::new(ScriptedSource::new(Script::Sleep(Duration::from_millis(100))));

        let supervisor = Supervisor::start(factory(store.clone(), source), settings(1));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(supervisor.states(), vec![(0, WorkerState::Processing)]);

        let report = supervisor.shutdown().await;
        assert!(report.aborted.is_empty());
        assert_eq!(report.stats.done, 1);
        let item = store.read(ids[0]).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Done);
    }

    #[tokio::test]
    async fn shutdown_deadline_aborts_stuck_workers() {
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let ids = seed(store.as_ref(), 1).await;
        let source = Arc::new(ScriptedSource::new(Script::Sleep(Duration::from_secs(30))));
        let mut s = settings(1);
        s.shutdown_deadline = Duration::from_millis(50);

        let supervisor = Supervisor::start(factory(store.clone(), source), s);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = supervisor.shutdown().await;
        assert_eq!(report.aborted, vec![0]);
        // The claim is left for staleness recovery.
        let item = store.read(ids[0]).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Claimed);
    }
}
