//! Status - ステータスクエリ
//!
//! Backlog counts for operators: how much is pending, in flight, stuck.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ItemStatus, SubItem, WorkItem};
use crate::ports::{BacklogCounts, StatusCounts};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    pub items: StatusCounts,
    pub sub_items: StatusCounts,

    /// Claims older than the staleness timeout; the next claim picks them up.
    pub stale_claims: usize,

    pub total_attempts: u64,
    pub generated_at: DateTime<Utc>,
}

impl StatusReport {
    pub fn new(category: Option<String>, counts: BacklogCounts, generated_at: DateTime<Utc>) -> Self {
        Self {
            category,
            items: counts.items,
            sub_items: counts.sub_items,
            stale_claims: counts.stale,
            total_attempts: counts.attempts,
            generated_at,
        }
    }

    pub fn is_drained(&self) -> bool {
        self.items.is_drained()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.category {
            Some(c) => writeln!(f, "category: {c}")?,
            None => writeln!(f, "category: (all)")?,
        }
        writeln!(f, "{:<10} {:>8} {:>10}", "status", "items", "sub_items")?;
        for status in ItemStatus::ALL {
            writeln!(
                f,
                "{:<10} {:>8} {:>10}",
                status.as_str(),
                self.items.get(status),
                self.sub_items.get(status)
            )?;
        }
        writeln!(
            f,
            "{:<10} {:>8} {:>10}",
            "total",
            self.items.total(),
            self.sub_items.total()
        )?;
        writeln!(f, "stale claims:   {}", self.stale_claims)?;
        write!(f, "total attempts: {}", self.total_attempts)
    }
}

/// One item together with its sub-items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDetail {
    pub item: WorkItem,
    pub sub_items: Vec<SubItem>,
}
