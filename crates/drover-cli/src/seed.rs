//! JSONL ingestion for `drover seed`.
//!
//! One record per line. Ids are optional; missing ones are minted so that
//! file order roughly matches claim order.

use chrono::Utc;
use drover_core::domain::{ItemId, NewSubItem, NewWorkItem, SubItemId};
use drover_core::ports::{IdGenerator, RecordStore};
use drover_core::{DroverError, StoreError};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SeedRecord {
    #[serde(default)]
    id: Option<ItemId>,
    #[serde(default)]
    category: Option<String>,
    source_url: String,
    #[serde(default)]
    sub_items: Vec<SeedSubItem>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SeedSubItem {
    Url(String),
    Full {
        #[serde(default)]
        id: Option<SubItemId>,
        source_url: String,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SeedSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Parse a JSONL document. Blank lines and `#` comments are skipped.
pub(crate) fn parse(content: &str, ids: &dyn IdGenerator) -> Result<Vec<NewWorkItem>, DroverError> {
    let mut items = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let record: SeedRecord = serde_json::from_str(line)
            .map_err(|e| DroverError::Config(format!("line {}: {e}", n + 1)))?;
        if record.source_url.trim().is_empty() {
            return Err(DroverError::Config(format!("line {}: empty source_url", n + 1)));
        }

        let sub_items = record
            .sub_items
            .into_iter()
            .map(|sub| {
                let (id, source_url) = match sub {
                    SeedSubItem::Url(url) => (None, url),
                    SeedSubItem::Full { id, source_url } => (id, source_url),
                };
                NewSubItem {
                    id: id.unwrap_or_else(|| ids.generate_sub_item_id()),
                    source_url,
                }
            })
            .collect();

        items.push(NewWorkItem {
            id: record.id.unwrap_or_else(|| ids.generate_item_id()),
            category: record.category,
            source_url: record.source_url,
            sub_items,
        });
    }
    Ok(items)
}

/// Insert every item; ids already present are counted, not fatal.
pub(crate) async fn insert_all(
    store: &dyn RecordStore,
    items: Vec<NewWorkItem>,
) -> Result<SeedSummary, StoreError> {
    let mut summary = SeedSummary::default();
    for item in items {
        match store.insert(item, Utc::now()).await {
            Ok(inserted) => {
                tracing::debug!(item_id = %inserted.id, "seeded");
                summary.inserted += 1;
            }
            Err(StoreError::Duplicate(id)) => {
                tracing::warn!(item_id = %id, "already present, skipped");
                summary.duplicates += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(summary)
}
