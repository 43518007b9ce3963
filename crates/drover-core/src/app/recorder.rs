//! OutcomeRecorder - write a pipeline result back through the claim guard.

use std::sync::Arc;

use crate::app::claim::Claim;
use crate::domain::{
    ItemStatus, ItemUpdate, PipelineResult, RetryPolicy, SubItemPatch, SubItemUpdate, WorkItem,
};
use crate::error::{DroverError, Result};
use crate::ports::{Clock, RecordStore};

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// The row moved to this terminal status.
    Recorded(ItemStatus),

    /// The claim was superseded (reclaimed or reset); nothing was written.
    Conflict { observed: Option<WorkItem> },
}

#[derive(Clone)]
pub struct OutcomeRecorder {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    max_retries: u32,
}

impl OutcomeRecorder {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            clock,
            retry,
            max_retries,
        }
    }

    /// Move the claimed row to `done` or `failed`.
    ///
    /// Sub-items with an outcome get their own status and payload; every
    /// other sub-item takes the parent's terminal status.
    pub async fn record(&self, claim: &Claim, result: PipelineResult) -> Result<RecordOutcome> {
        let status = result.terminal_status();
        let update = ItemUpdate::terminal(
            status,
            claim.attempts,
            claim.item.claimed_at,
            self.clock.now(),
            result.to_metadata(claim.attempts),
            sub_item_update(status, &result),
        )
        .with_owner(claim.item.claimed_by.clone());

        let mut retries = 0;
        let written = loop {
            match self
                .store
                .conditional_update(claim.item.id, claim.guard(), update.clone())
                .await
            {
                Ok(written) => break written,
                Err(e) if e.is_transient() && retries < self.max_retries => {
                    retries += 1;
                    let delay = self.retry.jittered_delay(retries);
                    tracing::warn!(
                        item_id = %claim.item.id,
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "store unavailable while recording outcome, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(DroverError::Store(e)),
            }
        };

        if written {
            tracing::info!(
                item_id = %claim.item.id,
                attempts = claim.attempts,
                %status,
                partial = result.partial,
                sub_items_failed = result.metrics.sub_items_failed,
                "recorded outcome"
            );
            return Ok(RecordOutcome::Recorded(status));
        }

        let observed = self.store.read(claim.item.id).await.ok().flatten();
        tracing::warn!(
            item_id = %claim.item.id,
            attempts = claim.attempts,
            observed_status = ?observed.as_ref().map(|i| i.status),
            observed_attempts = ?observed.as_ref().map(|i| i.attempts),
            "claim superseded, discarding outcome"
        );
        Ok(RecordOutcome::Conflict { observed })
    }
}

fn sub_item_update(status: ItemStatus, result: &PipelineResult) -> SubItemUpdate {
    SubItemUpdate {
        default: Some(status),
        patches: result
            .per_subitem_outcomes
            .iter()
            .map(|outcome| SubItemPatch {
                id: outcome.sub_item_id,
                status: outcome.status(),
                result: serde_json::to_value(outcome).ok(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::claim::{ClaimManager, ClaimSettings};
    use crate::domain::{
        ItemId, NewSubItem, NewWorkItem, StageFailure, SubItemId, SubItemOutcome,
    };
    use crate::impls::InMemoryRecordStore;
    use crate::ports::FixedClock;
    use chrono::{Duration, TimeZone, Utc};
    use ulid::Ulid;

    struct Fixture {
        store: Arc<InMemoryRecordStore>,
        clock: Arc<FixedClock>,
        claims: ClaimManager,
        recorder: OutcomeRecorder,
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
        let recorder = OutcomeRecorder::new(
            store.clone(),
            clock.clone(),
            RetryPolicy::new(std::time::Duration::from_millis(1), std::time::Duration::from_millis(5)),
            3,
        );
        Fixture {
            store,
            clock,
            claims,
            recorder,
        }
    }

    async fn seed(store: &InMemoryRecordStore, subs: usize) -> ItemId {
        let new = NewWorkItem {
            id: ItemId::from_ulid(Ulid::new()),
            category: None,
            source_url: "https://example.com/p".into(),
            sub_items: (0..subs)
                .map(|_| NewSubItem {
                    id: SubItemId::from_ulid(Ulid::new()),
                    source_url: "https://example.com/d.pdf".into(),
                })
                .collect(),
        };
        store.insert(new, Utc::now()).await.unwrap().id
    }

    fn outcome(id: SubItemId, success: bool) -> SubItemOutcome {
        SubItemOutcome {
            sub_item_id: id,
            success,
            payload: None,
            error: (!success).then(|| StageFailure::permanent("bad pdf")),
            duration_ms: 3,
        }
    }

    #[tokio::test]
    async fn success_marks_item_and_sub_items_done() {
        let f = fixture();
        let id = seed(&f.store, 2).await;
        let claim = f.claims.claim_one().await.unwrap().unwrap();

        let outcome = f
            .recorder
            .record(&claim, PipelineResult::succeeded())
            .await
            .unwrap();

        assert_eq!(outcome, RecordOutcome::Recorded(ItemStatus::Done));
        let item = f.store.read(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Done);
        assert_eq!(item.result.as_ref().unwrap()["attempts"], 1);
        assert!(item.completed_at.is_some());
        let subs = f.store.sub_items(id).await.unwrap();
        assert!(subs.iter().all(|s| s.status == ItemStatus::Done));
    }

    #[tokio::test]
    async fn terminal_row_keeps_the_claiming_worker() {
        let f = fixture();
        let id = seed(&f.store, 0).await;
        let claims = f.claims.clone().with_owner("worker-2@99");
        let claim = claims.claim_one().await.unwrap().unwrap();

        f.recorder
            .record(&claim, PipelineResult::failed(StageFailure::permanent("404")))
            .await
            .unwrap();

        let item = f.store.read(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.claimed_by.as_deref(), Some("worker-2@99"));
    }

    #[tokio::test]
    async fn partial_failure_marks_only_the_failed_sub_item() {
        let f = fixture();
        let id = seed(&f.store, 3).await;
        let subs = f.store.sub_items(id).await.unwrap();
        let claim = f.claims.claim_one().await.unwrap().unwrap();

        let mut result = PipelineResult::succeeded();
        result.per_subitem_outcomes = vec![
            outcome(subs[0].id, true),
            outcome(subs[1].id, false),
            outcome(subs[2].id, true),
        ];
        result.finalize();

        f.recorder.record(&claim, result).await.unwrap();

        let item = f.store.read(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Done);
        let meta = item.result.unwrap();
        assert_eq!(meta["partial"], true);
        let failures: Vec<_> = meta["per_subitem_outcomes"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|o| o["success"] == false)
            .collect();
        assert_eq!(failures.len(), 1);

        let statuses: Vec<_> = f
            .store
            .sub_items(id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.status)
            .collect();
        assert_eq!(
            statuses,
            vec![ItemStatus::Done, ItemStatus::Failed, ItemStatus::Done]
        );
    }

    #[tokio::test]
    async fn failure_cascades_to_sub_items() {
        let f = fixture();
        let id = seed(&f.store, 2).await;
        let claim = f.claims.claim_one().await.unwrap().unwrap();

        let outcome = f
            .recorder
            .record(&claim, PipelineResult::failed(StageFailure::permanent("404")))
            .await
            .unwrap();

        assert_eq!(outcome, RecordOutcome::Recorded(ItemStatus::Failed));
        let subs = f.store.sub_items(id).await.unwrap();
        assert!(subs.iter().all(|s| s.status == ItemStatus::Failed));
    }

    #[tokio::test]
    async fn superseded_claim_is_a_conflict_and_keeps_the_newer_claim() {
        let f = fixture();
        let id = seed(&f.store, 0).await;
        let old = f.claims.claim_one().await.unwrap().unwrap();

        f.clock.advance(Duration::seconds(61));
        let new = f.claims.claim_one().await.unwrap().unwrap();
        assert_eq!(new.attempts, 2);

        let outcome = f
            .recorder
            .record(&old, PipelineResult::succeeded())
            .await
            .unwrap();
        let RecordOutcome::Conflict { observed } = outcome else {
            panic!("expected conflict, got {outcome:?}");
        };
        assert_eq!(observed.unwrap().attempts, 2);

        let item = f.store.read(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Claimed);

        let outcome = f
            .recorder
            .record(&new, PipelineResult::succeeded())
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Recorded(ItemStatus::Done));
    }

    #[tokio::test]
    async fn transient_store_errors_are_retried() {
        let f = fixture();
        seed(&f.store, 0).await;
        let claim = f.claims.claim_one().await.unwrap().unwrap();

        f.store.fail_next(2).await;
        let outcome = f
            .recorder
            .record(&claim, PipelineResult::succeeded())
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::Recorded(ItemStatus::Done));
    }

    #[tokio::test]
    async fn exhausted_retries_leave_the_row_claimed() {
        let f = fixture();
        let id = seed(&f.store, 0).await;
        let claim = f.claims.claim_one().await.unwrap().unwrap();

        f.store.fail_next(10).await;
        let err = f
            .recorder
            .record(&claim, PipelineResult::succeeded())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        f.store.fail_next(0).await;
        let item = f.store.read(id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Claimed);
    }
}
