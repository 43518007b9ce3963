//! Operator surface: reset, status, inspect.
//!
//! Resets go through the same compare-and-set as claims, so an operator can
//! run them while workers are active without corrupting a live claim: the
//! worker whose claim was reset simply gets a `Conflict` when it records.

use std::sync::Arc;

use crate::app::status::{ItemDetail, StatusReport};
use crate::domain::{ItemId, ItemStatus, ItemUpdate, UpdateGuard, stale_before};
use crate::error::{DroverError, Result};
use crate::ports::{Clock, RecordStore};

/// Rows fetched per page by `reset_failed`.
const RESET_BATCH: usize = 500;

/// How often `reset` re-reads a row that changed under it.
const RESET_ROUNDS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The row moved back to `pending` from `previous`.
    Reset { previous: ItemStatus, attempts: u32 },

    /// Already `pending`; nothing written.
    AlreadyPending,
}

#[derive(Clone)]
pub struct Operator {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    staleness_timeout: chrono::Duration,
}

impl Operator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        staleness_timeout: chrono::Duration,
    ) -> Self {
        Self {
            store,
            clock,
            staleness_timeout,
        }
    }

    /// Put one item back in the backlog.
    ///
    /// `failed` and `claimed` items reset unconditionally; `done` items only
    /// with `force`. Resetting a `pending` item is a no-op.
    pub async fn reset(&self, id: ItemId, force: bool) -> Result<ResetOutcome> {
        for _ in 0..RESET_ROUNDS {
            let item = self
                .store
                .read(id)
                .await?
                .ok_or(DroverError::ItemNotFound(id))?;

            match item.status {
                ItemStatus::Pending => return Ok(ResetOutcome::AlreadyPending),
                ItemStatus::Done if !force => {
                    return Err(DroverError::InvalidTransition {
                        item_id: id,
                        status: item.status,
                        op: "reset",
                    });
                }
                _ => {}
            }

            let written = self
                .store
                .conditional_update(id, UpdateGuard::observed(&item), ItemUpdate::reset(&item))
                .await?;
            if written {
                tracing::info!(
                    item_id = %id,
                    previous = %item.status,
                    attempts = item.attempts,
                    "reset item to pending"
                );
                return Ok(ResetOutcome::Reset {
                    previous: item.status,
                    attempts: item.attempts,
                });
            }
        }
        Err(DroverError::Contended(id))
    }

    /// Reset every `failed` item (optionally of one category). Returns how many moved.
    pub async fn reset_failed(&self, category: Option<&str>) -> Result<usize> {
        let mut total = 0;
        loop {
            let batch = self
                .store
                .list_by_status(ItemStatus::Failed, category, RESET_BATCH)
                .await?;
            if batch.is_empty() {
                break;
            }

            let mut moved = 0;
            for item in &batch {
                let written = self
                    .store
                    .conditional_update(
                        item.id,
                        UpdateGuard::observed(item),
                        ItemUpdate::reset(item),
                    )
                    .await?;
                if written {
                    moved += 1;
                }
            }
            total += moved;

            // Everything in the page changed under us; avoid spinning on it.
            if moved == 0 || batch.len() < RESET_BATCH {
                break;
            }
        }
        tracing::info!(category = ?category, reset = total, "reset failed items");
        Ok(total)
    }

    pub async fn status(&self, category: Option<&str>) -> Result<StatusReport> {
        let now = self.clock.now();
        let counts = self
            .store
            .counts(category, stale_before(now, self.staleness_timeout))
            .await?;
        Ok(StatusReport::new(category.map(str::to_string), counts, now))
    }

    pub async fn inspect(&self, id: ItemId) -> Result<ItemDetail> {
        let item = self
            .store
            .read(id)
            .await?
            .ok_or(DroverError::ItemNotFound(id))?;
        let sub_items = self.store.sub_items(id).await?;
        Ok(ItemDetail { item, sub_items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::claim::{ClaimManager, ClaimSettings};
    use crate::app::recorder::OutcomeRecorder;
    use crate::domain::{
        NewSubItem, NewWorkItem, PipelineResult, RetryPolicy, StageFailure, SubItemId,
    };
    use crate::impls::InMemoryRecordStore;
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone, Utc};
    use rstest::rstest;
    use ulid::Ulid;

    struct Fixture {
        store: Arc<InMemoryRecordStore>,
        clock: Arc<FixedClock>,
        claims: ClaimManager,
        recorder: OutcomeRecorder,
        operator: Operator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryRecordStore::new());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        let claims = ClaimManager::new(
            store.clone(),
            clock.clone(),
            ClaimSettings {
                staleness_timeout: Duration::seconds(60),
                candidate_window: 1,
                max_rounds: 3,
                category: None,
            },
        );
        let recorder = OutcomeRecorder::new(store.clone(), clock.clone(), RetryPolicy::default(), 0);
        let operator = Operator::new(store.clone(), clock.clone(), Duration::seconds(60));
        Fixture {
            store,
            clock,
            claims,
            recorder,
            operator,
        }
    }

    async fn seed(f: &Fixture, category: &str) -> ItemId {
        let new = NewWorkItem {
            id: ItemId::from_ulid(Ulid::new()),
            category: Some(category.into()),
            source_url: "https://example.com/p".into(),
            sub_items: vec![NewSubItem {
                id: SubItemId::from_ulid(Ulid::new()),
                source_url: "https://example.com/d.pdf".into(),
            }],
        };
        f.store.insert(new, f.clock.now()).await.unwrap().id
    }

    async fn finish(f: &Fixture, result: PipelineResult) {
        let claim = f.claims.claim_one().await.unwrap().unwrap();
        f.recorder.record(&claim, result).await.unwrap();
    }

    #[tokio::test]
    async fn reset_failed_item_is_idempotent() {
        let f = fixture();
        let id = seed(&f, "sensors").await;
        finish(&f, PipelineResult::failed(StageFailure::permanent("404"))).await;

        let first = f.operator.reset(id, false).await.unwrap();
        assert_eq!(
            first,
            ResetOutcome::Reset {
                previous: ItemStatus::Failed,
                attempts: 1
            }
        );
        let second = f.operator.reset(id, false).await.unwrap();
        assert_eq!(second, ResetOutcome::AlreadyPending);

        let detail = f.operator.inspect(id).await.unwrap();
        assert_eq!(detail.item.status, ItemStatus::Pending);
        assert_eq!(detail.item.attempts, 1);
        assert!(detail.item.claimed_at.is_none());
        // Result is kept for diagnosis.
        assert!(detail.item.result.is_some());
        assert!(detail.sub_items.iter().all(|s| s.status == ItemStatus::Pending));
    }

    #[tokio::test]
    async fn reset_then_reprocess_ends_done_with_total_attempts() {
        let f = fixture();
        let id = seed(&f, "sensors").await;
        finish(&f, PipelineResult::failed(StageFailure::transient("503"))).await;

        f.operator.reset(id, false).await.unwrap();
        finish(&f, PipelineResult::succeeded()).await;

        let detail = f.operator.inspect(id).await.unwrap();
        assert_eq!(detail.item.status, ItemStatus::Done);
        assert_eq!(detail.item.attempts, 2);
        assert!(detail.sub_items.iter().all(|s| s.status == ItemStatus::Done));
    }

    #[rstest]
    #[case(false, false)]
    #[case(true, true)]
    #[tokio::test]
    async fn reset_done_requires_force(#[case] force: bool, #[case] allowed: bool) {
        let f = fixture();
        let id = seed(&f, "sensors").await;
        finish(&f, PipelineResult::succeeded()).await;

        let result = f.operator.reset(id, force).await;
        if allowed {
            assert!(matches!(result, Ok(ResetOutcome::Reset { previous: ItemStatus::Done, .. })));
        } else {
            assert!(matches!(result, Err(DroverError::InvalidTransition { .. })));
        }
    }

    #[tokio::test]
    async fn reset_of_live_claim_makes_the_worker_conflict() {
        let f = fixture();
        let id = seed(&f, "sensors").await;
        let claim = f.claims.claim_one().await.unwrap().unwrap();

        f.operator.reset(id, false).await.unwrap();
        let outcome = f
            .recorder
            .record(&claim, PipelineResult::succeeded())
            .await
            .unwrap();

        assert!(matches!(outcome, crate::app::recorder::RecordOutcome::Conflict { .. }));
        assert_eq!(f.store.read(id).await.unwrap().unwrap().status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn reset_unknown_item_is_not_found() {
        let f = fixture();
        let err = f
            .operator
            .reset(ItemId::from_ulid(Ulid::new()), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DroverError::ItemNotFound(_)));
    }

    #[tokio::test]
    async fn reset_failed_respects_category() {
        let f = fixture();
        seed(&f, "sensors").await;
        seed(&f, "motors").await;
        finish(&f, PipelineResult::failed(StageFailure::transient("503"))).await;
        finish(&f, PipelineResult::failed(StageFailure::transient("503"))).await;

        assert_eq!(f.operator.reset_failed(Some("motors")).await.unwrap(), 1);
        let status = f.operator.status(None).await.unwrap();
        assert_eq!(status.items.pending, 1);
        assert_eq!(status.items.failed, 1);

        assert_eq!(f.operator.reset_failed(None).await.unwrap(), 1);
        assert_eq!(f.operator.reset_failed(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn status_counts_stale_claims() {
        let f = fixture();
        seed(&f, "sensors").await;
        seed(&f, "sensors").await;
        f.claims.claim_one().await.unwrap().unwrap();

        let status = f.operator.status(Some("sensors")).await.unwrap();
        assert_eq!(status.items.claimed, 1);
        assert_eq!(status.items.pending, 1);
        assert_eq!(status.stale_claims, 0);
        assert_eq!(status.total_attempts, 1);

        f.clock.advance(Duration::seconds(60));
        let status = f.operator.status(Some("sensors")).await.unwrap();
        assert_eq!(status.stale_claims, 1);
        assert_eq!(status.sub_items.claimed, 1);
    }

    #[tokio::test]
    async fn status_with_out_of_range_staleness_reports_no_stale_claims() {
        let f = fixture();
        seed(&f, "sensors").await;
        f.claims.claim_one().await.unwrap().unwrap();
        let operator = Operator::new(
            f.store.clone(),
            f.clock.clone(),
            Duration::seconds(10_000_000_000_000),
        );

        f.clock.advance(Duration::days(365));
        let status = operator.status(None).await.unwrap();
        assert_eq!(status.items.claimed, 1);
        assert_eq!(status.stale_claims, 0);
    }
}
