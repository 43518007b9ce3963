//! WorkerLoop - claim → process → record, until shutdown.
//!
//! # フロー
//! 1. ClaimManager::claim_one() で 1 件 claim（なければ idle backoff）
//! 2. Pipeline::run() で処理（panic は catch_unwind で failed result に変換）
//! 3. OutcomeRecorder::record() で done / failed を書き戻す
//!
//! Shutdown is only checked between cycles: an item that was claimed is
//! always processed and recorded before the loop exits.
//!
//! `process_id` runs the same cycle once for a chosen item.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::Instrument;

use crate::app::claim::{Claim, ClaimManager};
use crate::app::pipeline::Pipeline;
use crate::app::recorder::{OutcomeRecorder, RecordOutcome};
use crate::domain::{ItemId, ItemStatus, PipelineResult, RetryPolicy, StageFailure};
use crate::error::{DroverError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Claiming,
    Processing,
    Recording,
    Stopped,
}

/// Counters returned when a worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub claimed: u64,
    pub reclaimed: u64,
    pub done: u64,
    pub failed: u64,
    pub conflicts: u64,
    pub store_errors: u64,
    pub panics: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.claimed += other.claimed;
        self.reclaimed += other.reclaimed;
        self.done += other.done;
        self.failed += other.failed;
        self.conflicts += other.conflicts;
        self.store_errors += other.store_errors;
        self.panics += other.panics;
    }
}

/// What one `tick()` did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Nothing eligible.
    Idle,

    /// An item was claimed, processed and its outcome written (or discarded).
    Processed(RecordOutcome),

    /// Every candidate was won by other workers.
    ClaimConflict,

    /// The store failed; the cycle made no progress.
    StoreUnavailable,
}

pub struct WorkerLoop {
    worker_id: usize,
    claims: ClaimManager,
    pipeline: Pipeline,
    recorder: OutcomeRecorder,
    idle_policy: RetryPolicy,
    state_tx: watch::Sender<WorkerState>,
    stats: WorkerStats,
}

impl WorkerLoop {
    pub fn new(
        worker_id: usize,
        claims: ClaimManager,
        pipeline: Pipeline,
        recorder: OutcomeRecorder,
        idle_policy: RetryPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Idle);
        Self {
            worker_id,
            claims,
            pipeline,
            recorder,
            idle_policy,
            state_tx,
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state_tx.send_replace(state);
    }

    /// Run exactly one claim → process → record cycle.
    pub async fn tick(&mut self) -> TickOutcome {
        self.set_state(WorkerState::Claiming);
        let claim = match self.claims.claim_one().await {
            Ok(Some(claim)) => claim,
            Ok(None) => {
                self.set_state(WorkerState::Idle);
                return TickOutcome::Idle;
            }
            Err(DroverError::ClaimConflict { rounds }) => {
                tracing::debug!(rounds, "claim conflict");
                self.stats.conflicts += 1;
                self.set_state(WorkerState::Idle);
                return TickOutcome::ClaimConflict;
            }
            Err(e) => {
                tracing::warn!(error = %e, "claim failed");
                self.stats.store_errors += 1;
                self.set_state(WorkerState::Idle);
                return TickOutcome::StoreUnavailable;
            }
        };

        let outcome = match self.process_claim(claim).await {
            Ok(outcome) => TickOutcome::Processed(outcome),
            Err(_) => TickOutcome::StoreUnavailable,
        };
        self.set_state(WorkerState::Idle);
        outcome
    }

    /// Claim `id` regardless of the category filter, process it and record the outcome.
    ///
    /// Fails without side effects when the item is terminal or held by a live claim.
    pub async fn process_id(&mut self, id: ItemId) -> Result<RecordOutcome> {
        self.set_state(WorkerState::Claiming);
        let outcome = match self.claims.claim_id(id).await {
            Ok(claim) => self.process_claim(claim).await,
            Err(e) => Err(e),
        };
        self.set_state(WorkerState::Idle);
        outcome
    }

    async fn process_claim(&mut self, claim: Claim) -> Result<RecordOutcome> {
        self.stats.claimed += 1;
        if claim.reclaimed {
            self.stats.reclaimed += 1;
        }

        let span = tracing::info_span!("item", item_id = %claim.item.id, attempts = claim.attempts);
        self.process_and_record(claim).instrument(span).await
    }

    async fn process_and_record(&mut self, claim: Claim) -> Result<RecordOutcome> {
        self.set_state(WorkerState::Processing);
        let result = match AssertUnwindSafe(self.pipeline.run(&claim.item))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(panic = %message, "pipeline panicked");
                self.stats.panics += 1;
                PipelineResult::failed(StageFailure::panicked(message))
            }
        };

        self.set_state(WorkerState::Recording);
        match self.recorder.record(&claim, result).await {
            Ok(outcome) => {
                match &outcome {
                    RecordOutcome::Recorded(ItemStatus::Done) => self.stats.done += 1,
                    RecordOutcome::Recorded(_) => self.stats.failed += 1,
                    RecordOutcome::Conflict { .. } => self.stats.conflicts += 1,
                }
                Ok(outcome)
            }
            Err(e) => {
                // Row stays claimed and will be recovered once stale.
                tracing::error!(error = %e, "could not record outcome");
                self.stats.store_errors += 1;
                Err(e)
            }
        }
    }

    /// Loop until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        let span = tracing::info_span!("worker", worker_id = self.worker_id);
        async move {
            tracing::info!(category = ?self.claims.settings().category, "worker started");
            let mut idle_streak: u32 = 0;
            let mut error_streak: u32 = 0;

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let delay = match self.tick().await {
                    TickOutcome::Processed(_) => {
                        idle_streak = 0;
                        error_streak = 0;
                        None
                    }
                    TickOutcome::ClaimConflict => None,
                    TickOutcome::Idle => {
                        idle_streak = idle_streak.saturating_add(1);
                        Some(self.idle_policy.jittered_delay(idle_streak))
                    }
                    TickOutcome::StoreUnavailable => {
                        error_streak = error_streak.saturating_add(1);
                        Some(self.idle_policy.jittered_delay(error_streak))
                    }
                };

                if let Some(delay) = delay
                    && !sleep_or_shutdown(delay, &mut shutdown).await
                {
                    break;
                }
            }

            self.set_state(WorkerState::Stopped);
            tracing::info!(stats = ?self.stats, "worker stopped");
            self.stats
        }
        .instrument(span)
        .await
    }
}

/// Sleep for `delay`. Returns `false` if shutdown was requested meanwhile.
pub(crate) async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => !*shutdown.borrow(),
        changed = shutdown.changed() => {
            // A dropped sender also means stop.
            changed.is_ok() && !*shutdown.borrow()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
