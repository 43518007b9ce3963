//! Pipeline outcome model.
//!
//! This module does not assume workers or persistence. It defines the shape
//! of what one pipeline run produced, which the outcome recorder writes into
//! the item's `result` column verbatim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::errors::StageFailure;
use super::ids::SubItemId;
use super::status::ItemStatus;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Primary content + sub-item list. Required.
    Fetch,
    /// One call per sub-item. Best effort.
    SubItems,
    /// Extraction / enrichment over everything fetched. Best effort.
    Enrich,
    /// Derived artifacts written out. Best effort.
    Persist,
}

impl Stage {
    /// A failure in a required stage fails the whole item.
    pub fn is_required(self) -> bool {
        matches!(self, Stage::Fetch)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::SubItems => "sub_items",
            Stage::Enrich => "enrich",
            Stage::Persist => "persist",
        }
    }
}

/// Outcome of processing one sub-item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubItemOutcome {
    pub sub_item_id: SubItemId,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageFailure>,

    pub duration_ms: u64,
}

impl SubItemOutcome {
    pub fn status(&self) -> ItemStatus {
        if self.success {
            ItemStatus::Done
        } else {
            ItemStatus::Failed
        }
    }
}

/// A failure in a best-effort stage (the item still ends `done`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub error: StageFailure,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    /// Wall time per stage that ran.
    #[serde(default)]
    pub stage_ms: BTreeMap<Stage, u64>,

    pub sub_items_total: usize,
    pub sub_items_failed: usize,
    pub total_ms: u64,

    /// True when the primary content came from the fallback source.
    #[serde(default)]
    pub used_fallback: bool,
}

/// Everything one pipeline run produced.
///
/// - `overall_success = false` only when a required stage failed.
/// - `partial = true` when the run succeeded but something best-effort failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub overall_success: bool,

    #[serde(default)]
    pub partial: bool,

    #[serde(default)]
    pub per_subitem_outcomes: Vec<SubItemOutcome>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stage_errors: Vec<StageError>,

    #[serde(default)]
    pub metrics: PipelineMetrics,

    /// Opaque stage payloads, passed through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payloads: BTreeMap<Stage, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageFailure>,
}

impl PipelineResult {
    pub fn succeeded() -> Self {
        Self {
            overall_success: true,
            partial: false,
            per_subitem_outcomes: Vec::new(),
            stage_errors: Vec::new(),
            metrics: PipelineMetrics::default(),
            payloads: BTreeMap::new(),
            error: None,
        }
    }

    /// A whole-item failure (required stage failed, panic, overall timeout).
    pub fn failed(error: StageFailure) -> Self {
        Self {
            overall_success: false,
            error: Some(error),
            ..Self::succeeded()
        }
    }

    pub fn terminal_status(&self) -> ItemStatus {
        if self.overall_success {
            ItemStatus::Done
        } else {
            ItemStatus::Failed
        }
    }

    pub fn failed_sub_items(&self) -> impl Iterator<Item = &SubItemOutcome> {
        self.per_subitem_outcomes.iter().filter(|o| !o.success)
    }

    /// Recompute `partial` and the sub-item counters from the collected data.
    pub fn finalize(&mut self) {
        self.metrics.sub_items_total = self.per_subitem_outcomes.len();
        self.metrics.sub_items_failed = self.failed_sub_items().count();
        self.partial = self.overall_success
            && (self.metrics.sub_items_failed > 0 || !self.stage_errors.is_empty());
    }

    /// JSON written to the item's `result` column.
    pub fn to_metadata(&self, attempts: u32) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({
                "overall_success": self.overall_success,
                "serialize_error": e.to_string(),
            })
        });
        if let Some(obj) = value.as_object_mut() {
            obj.insert("attempts".to_string(), serde_json::json!(attempts));
        }
        value
    }
}
