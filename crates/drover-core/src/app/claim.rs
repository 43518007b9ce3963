//! ClaimManager - claim one eligible item via compare-and-set.
//!
//! # フロー
//! 1. `find_eligible` returns the oldest `candidate_window` claimable rows
//! 2. starting at a random offset, try `conditional_update` on each with the
//!    guard taken from the observed row
//! 3. the first successful write wins; losing every candidate starts a new
//!    round, up to `max_rounds`
//!
//! `claim_id` runs the same compare-and-set against one chosen row, for
//! processing a single item on demand.

use std::sync::Arc;

use rand::Rng;

use crate::config::ClaimConfig;
use crate::domain::{ItemId, ItemStatus, ItemUpdate, UpdateGuard, WorkItem, stale_before};
use crate::error::{DroverError, Result};
use crate::ports::{Clock, EligibilityQuery, RecordStore};

/// An item this worker now owns.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    /// The row as written by the claim (status `claimed`).
    pub item: WorkItem,

    /// `attempts` after the increment; part of the recorder's guard.
    pub attempts: u32,

    /// The row was an abandoned claim of some earlier worker.
    pub reclaimed: bool,
}

impl Claim {
    pub fn guard(&self) -> UpdateGuard {
        UpdateGuard::new(ItemStatus::Claimed, self.attempts)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimSettings {
    pub staleness_timeout: chrono::Duration,
    pub candidate_window: usize,
    pub max_rounds: u32,
    pub category: Option<String>,
}

impl From<&ClaimConfig> for ClaimSettings {
    fn from(config: &ClaimConfig) -> Self {
        Self {
            staleness_timeout: config.staleness_timeout(),
            candidate_window: config.candidate_window.max(1),
            max_rounds: config.max_rounds.max(1),
            category: config.category.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ClaimManager {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    settings: ClaimSettings,
    owner: Option<String>,
}

impl ClaimManager {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, settings: ClaimSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            owner: None,
        }
    }

    /// Label written to `claimed_by` on every claim.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn settings(&self) -> &ClaimSettings {
        &self.settings
    }

    /// Atomically claim one eligible item.
    ///
    /// - `Ok(None)`: nothing eligible right now
    /// - `Err(ClaimConflict)`: every candidate was taken by other workers
    /// - `Err(Store(..))`: the store failed; nothing was claimed
    pub async fn claim_one(&self) -> Result<Option<Claim>> {
        for round in 1..=self.settings.max_rounds {
            let now = self.clock.now();
            let query = EligibilityQuery {
                stale_before: stale_before(now, self.settings.staleness_timeout),
                category: self.settings.category.clone(),
            };

            let candidates = self
                .store
                .find_eligible(&query, self.settings.candidate_window)
                .await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            let offset = rand::thread_rng().gen_range(0..candidates.len());
            for i in 0..candidates.len() {
                let observed = &candidates[(offset + i) % candidates.len()];
                if let Some(claim) = self.try_claim(observed, now).await? {
                    return Ok(Some(claim));
                }
            }

            tracing::debug!(round, candidates = candidates.len(), "lost every candidate");
        }

        Err(DroverError::ClaimConflict {
            rounds: self.settings.max_rounds,
        })
    }

    /// Claim one specific item, ignoring the category filter.
    ///
    /// - `Err(ItemNotFound)`: no such row
    /// - `Err(InvalidTransition)`: the item is `done` or `failed` (reset it first)
    /// - `Err(AlreadyClaimed)`: another worker holds a live claim
    /// - `Err(Contended)`: the row changed under every attempt
    pub async fn claim_id(&self, id: ItemId) -> Result<Claim> {
        for _ in 0..self.settings.max_rounds {
            let now = self.clock.now();
            let observed = self
                .store
                .read(id)
                .await?
                .ok_or(DroverError::ItemNotFound(id))?;

            match observed.status {
                ItemStatus::Done | ItemStatus::Failed => {
                    return Err(DroverError::InvalidTransition {
                        item_id: id,
                        status: observed.status,
                        op: "claim",
                    });
                }
                ItemStatus::Claimed if !observed.is_stale(now, self.settings.staleness_timeout) => {
                    return Err(DroverError::AlreadyClaimed {
                        item_id: id,
                        owner: observed.claimed_by,
                    });
                }
                ItemStatus::Pending | ItemStatus::Claimed => {}
            }

            if let Some(claim) = self.try_claim(&observed, now).await? {
                return Ok(claim);
            }
            tracing::debug!(item_id = %id, "row changed while claiming, re-reading");
        }
        Err(DroverError::Contended(id))
    }

    async fn try_claim(
        &self,
        observed: &WorkItem,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Claim>> {
        let update = ItemUpdate::claim(observed, now).with_owner(self.owner.clone());
        let attempts = update.attempts;
        let won = self
            .store
            .conditional_update(observed.id, UpdateGuard::observed(observed), update)
            .await?;
        if !won {
            return Ok(None);
        }

        let reclaimed = observed.status == ItemStatus::Claimed;
        if reclaimed {
            tracing::warn!(
                item_id = %observed.id,
                attempts,
                previous_claimed_at = ?observed.claimed_at,
                previous_owner = ?observed.claimed_by,
                "reclaimed stale item"
            );
        } else {
            tracing::info!(item_id = %observed.id, attempts, owner = ?self.owner, "claimed item");
        }

        let mut item = observed.clone();
        item.status = ItemStatus::Claimed;
        item.attempts = attempts;
        item.claimed_at = Some(now);
        item.claimed_by = self.owner.clone();
        item.completed_at = None;
        item.updated_at = now;

        Ok(Some(Claim {
            item,
            attempts,
            reclaimed,
        }))
    }
}
