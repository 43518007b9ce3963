//! libSQL (embedded SQLite) record store.
//!
//! Several drover processes on one host can share the same database file:
//! every conditional update runs in a `BEGIN IMMEDIATE` transaction and the
//! guard is part of the `UPDATE ... WHERE`, so SQLite's write lock is the
//! only serialization point. Each operation opens its own connection, which
//! lets concurrent workers in one process proceed independently.

mod migrations;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover_core::config::StoreConfig;
use drover_core::domain::{
    ItemId, ItemStatus, ItemUpdate, NewWorkItem, SubItem, UpdateGuard, WorkItem,
};
use drover_core::error::StoreError;
use drover_core::ports::{BacklogCounts, EligibilityQuery, RecordStore};
use libsql::{Connection, Database, TransactionBehavior, params};

const ITEM_COLUMNS: &str = "id, category, source_url, status, claimed_at, attempts, result, \
                            created_at, updated_at, completed_at, claimed_by";

const SUB_ITEM_COLUMNS: &str = "id, parent_id, source_url, status, result, updated_at";

/// Record store backed by a local libSQL database file.
pub struct LibsqlRecordStore {
    db: Database,
    busy_timeout: Duration,
}

impl LibsqlRecordStore {
    /// Open or create the database at `path` and apply pending migrations.
    pub async fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::unavailable(format!("{}: {e}", parent.display())))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let store = Self { db, busy_timeout };
        let conn = store.connect().await?;
        pragma(&conn, "PRAGMA journal_mode = WAL").await?;
        store.run_migrations(&conn).await?;
        tracing::debug!(path = %path.display(), "record store opened");
        Ok(store)
    }

    pub async fn open_with_config(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::open(&config.path, Duration::from_millis(config.busy_timeout_ms)).await
    }

    async fn connect(&self) -> Result<Connection, StoreError> {
        let conn = self.db.connect().map_err(db_err)?;
        pragma(
            &conn,
            &format!("PRAGMA busy_timeout = {}", self.busy_timeout.as_millis()),
        )
        .await?;
        pragma(&conn, "PRAGMA foreign_keys = ON").await?;
        Ok(conn)
    }

    /// Applies pending migrations under the write lock, so processes opening
    /// a fresh file at the same time run each migration once.
    async fn run_migrations(&self, conn: &Connection) -> Result<(), StoreError> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;
        let current_version = schema_version(&tx).await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                tx.execute_batch(migration.sql).await.map_err(|e| {
                    StoreError::unavailable(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn query_items(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let conn = self.connect().await?;
        let mut rows = conn.query(sql, params).await.map_err(db_err)?;
        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            items.push(row_to_item(&row)?);
        }
        Ok(items)
    }
}

#[async_trait]
impl RecordStore for LibsqlRecordStore {
    async fn insert(&self, new: NewWorkItem, now: DateTime<Utc>) -> Result<WorkItem, StoreError> {
        let item = WorkItem::from_new(&new, now);
        let conn = self.connect().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        let inserted = tx
            .execute(
                "INSERT INTO work_items (id, category, source_url, status, attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    item.id.to_key(),
                    item.category.as_deref(),
                    item.source_url.as_str(),
                    item.status.as_str(),
                    millis(now),
                ],
            )
            .await
            .map_err(db_err)?;
        if inserted == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Err(StoreError::Duplicate(new.id));
        }

        for sub in &new.sub_items {
            tx.execute(
                "INSERT INTO sub_items (id, parent_id, source_url, status, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![
                    sub.id.to_key(),
                    item.id.to_key(),
                    sub.source_url.as_str(),
                    millis(now)
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::Duplicate(new.id)
                } else {
                    db_err(e)
                }
            })?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(item)
    }

    async fn find_eligible(
        &self,
        query: &EligibilityQuery,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM work_items
             WHERE (status = 'pending'
                    OR (status = 'claimed' AND (claimed_at IS NULL OR claimed_at <= ?1)))
               AND (?2 IS NULL OR category = ?2)
             ORDER BY id
             LIMIT ?3"
        );
        self.query_items(
            &sql,
            params![
                millis(query.stale_before),
                query.category.as_deref(),
                limit as i64
            ],
        )
        .await
    }

    async fn conditional_update(
        &self,
        id: ItemId,
        guard: UpdateGuard,
        update: ItemUpdate,
    ) -> Result<bool, StoreError> {
        let now = update
            .completed_at
            .or(update.claimed_at)
            .unwrap_or_else(Utc::now);
        let result = update.result.as_ref().map(serde_json::Value::to_string);

        let conn = self.connect().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        let changed = tx
            .execute(
                "UPDATE work_items
                 SET status = ?1, attempts = ?2, claimed_at = ?3, completed_at = ?4,
                     result = COALESCE(?5, result), updated_at = ?6, claimed_by = ?10
                 WHERE id = ?7 AND status = ?8 AND attempts = ?9",
                params![
                    update.status.as_str(),
                    i64::from(update.attempts),
                    update.claimed_at.map(millis),
                    update.completed_at.map(millis),
                    result,
                    millis(now),
                    id.to_key(),
                    guard.status.as_str(),
                    i64::from(guard.attempts),
                    update.claimed_by.as_deref(),
                ],
            )
            .await
            .map_err(db_err)?;
        if changed == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        if let Some(status) = update.sub_items.default {
            tx.execute(
                "UPDATE sub_items SET status = ?1, updated_at = ?2 WHERE parent_id = ?3",
                params![status.as_str(), millis(now), id.to_key()],
            )
            .await
            .map_err(db_err)?;
        }
        for patch in &update.sub_items.patches {
            tx.execute(
                "UPDATE sub_items SET status = ?1, result = COALESCE(?2, result), updated_at = ?3
                 WHERE id = ?4 AND parent_id = ?5",
                params![
                    patch.status.as_str(),
                    patch.result.as_ref().map(serde_json::Value::to_string),
                    millis(now),
                    patch.id.to_key(),
                    id.to_key(),
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn read(&self, id: ItemId) -> Result<Option<WorkItem>, StoreError> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = ?1");
        Ok(self
            .query_items(&sql, params![id.to_key()])
            .await?
            .into_iter()
            .next())
    }

    async fn sub_items(&self, parent: ItemId) -> Result<Vec<SubItem>, StoreError> {
        let conn = self.connect().await?;
        let sql = format!("SELECT {SUB_ITEM_COLUMNS} FROM sub_items WHERE parent_id = ?1 ORDER BY id");
        let mut rows = conn
            .query(&sql, params![parent.to_key()])
            .await
            .map_err(db_err)?;
        let mut subs = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            subs.push(row_to_sub_item(&row)?);
        }
        Ok(subs)
    }

    async fn list_by_status(
        &self,
        status: ItemStatus,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM work_items
             WHERE status = ?1 AND (?2 IS NULL OR category = ?2)
             ORDER BY id
             LIMIT ?3"
        );
        self.query_items(&sql, params![status.as_str(), category, limit as i64])
            .await
    }

    async fn counts(
        &self,
        category: Option<&str>,
        stale_before: DateTime<Utc>,
    ) -> Result<BacklogCounts, StoreError> {
        let conn = self.connect().await?;
        let mut counts = BacklogCounts::default();

        let mut rows = conn
            .query(
                "SELECT status, COUNT(*), COALESCE(SUM(attempts), 0),
                        SUM(CASE WHEN status = 'claimed'
                                  AND (claimed_at IS NULL OR claimed_at <= ?1)
                             THEN 1 ELSE 0 END)
                 FROM work_items
                 WHERE (?2 IS NULL OR category = ?2)
                 GROUP BY status",
                params![millis(stale_before), category],
            )
            .await
            .map_err(db_err)?;
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status = parse_status(&row, 0)?;
            let n = count(&row, 1)?;
            for _ in 0..n {
                counts.items.add(status);
            }
            counts.attempts += row.get::<i64>(2).map_err(db_err)?.max(0) as u64;
            counts.stale += count(&row, 3)?;
        }

        let mut rows = conn
            .query(
                "SELECT s.status, COUNT(*)
                 FROM sub_items s JOIN work_items w ON w.id = s.parent_id
                 WHERE (?1 IS NULL OR w.category = ?1)
                 GROUP BY s.status",
                params![category],
            )
            .await
            .map_err(db_err)?;
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status = parse_status(&row, 0)?;
            for _ in 0..count(&row, 1)? {
                counts.sub_items.add(status);
            }
        }
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn row_to_item(row: &libsql::Row) -> Result<WorkItem, StoreError> {
    let key: String = row.get(0).map_err(db_err)?;
    let id: ItemId = key
        .parse()
        .map_err(|e| StoreError::corrupt(&key, format!("bad id: {e}")))?;

    Ok(WorkItem {
        id,
        category: row.get::<String>(1).ok(),
        source_url: row.get(2).map_err(db_err)?,
        status: parse_status(row, 3)?,
        claimed_at: optional_time(row, 4, &key)?,
        claimed_by: row.get::<String>(10).ok(),
        attempts: u32::try_from(row.get::<i64>(5).map_err(db_err)?)
            .map_err(|e| StoreError::corrupt(&key, format!("bad attempts: {e}")))?,
        result: optional_json(row, 6, &key)?,
        created_at: time(row, 7, &key)?,
        updated_at: time(row, 8, &key)?,
        completed_at: optional_time(row, 9, &key)?,
    })
}

fn row_to_sub_item(row: &libsql::Row) -> Result<SubItem, StoreError> {
    let key: String = row.get(0).map_err(db_err)?;
    let parent: String = row.get(1).map_err(db_err)?;

    Ok(SubItem {
        id: key
            .parse()
            .map_err(|e| StoreError::corrupt(&key, format!("bad id: {e}")))?,
        parent_id: parent
            .parse()
            .map_err(|e| StoreError::corrupt(&key, format!("bad parent id: {e}")))?,
        source_url: row.get(2).map_err(db_err)?,
        status: parse_status(row, 3)?,
        result: optional_json(row, 4, &key)?,
        updated_at: time(row, 5, &key)?,
    })
}

fn parse_status(row: &libsql::Row, idx: i32) -> Result<ItemStatus, StoreError> {
    let raw: String = row.get(idx).map_err(db_err)?;
    raw.parse()
        .map_err(|e| StoreError::corrupt(raw.clone(), format!("bad status: {e}")))
}

fn count(row: &libsql::Row, idx: i32) -> Result<usize, StoreError> {
    let n: i64 = row.get(idx).map_err(db_err)?;
    Ok(usize::try_from(n).unwrap_or(0))
}

fn time(row: &libsql::Row, idx: i32, key: &str) -> Result<DateTime<Utc>, StoreError> {
    let ms: i64 = row.get(idx).map_err(db_err)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::corrupt(key, format!("timestamp out of range: {ms}")))
}

fn optional_time(
    row: &libsql::Row,
    idx: i32,
    key: &str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    match row.get::<i64>(idx).ok() {
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or_else(|| StoreError::corrupt(key, format!("timestamp out of range: {ms}"))),
        None => Ok(None),
    }
}

fn optional_json(
    row: &libsql::Row,
    idx: i32,
    key: &str,
) -> Result<Option<serde_json::Value>, StoreError> {
    match row.get::<String>(idx).ok() {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StoreError::corrupt(key, format!("bad result json: {e}"))),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Every driver error is treated as the store being unavailable; a locked or
/// busy database is the common case and resolves by retrying.
fn db_err(e: libsql::Error) -> StoreError {
    StoreError::unavailable(e.to_string())
}

/// Primary-key and UNIQUE violations; SQLite reports both the same way.
fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

/// Run a PRAGMA and discard whatever row it returns.
async fn pragma(conn: &Connection, sql: &str) -> Result<(), StoreError> {
    let mut rows = conn.query(sql, params![]).await.map_err(db_err)?;
    while rows.next().await.map_err(db_err)?.is_some() {}
    Ok(())
}

async fn schema_version(conn: &Connection) -> u32 {
    let result = conn
        .query("SELECT MAX(version) FROM schema_migrations", params![])
        .await;

    match result {
        Ok(mut rows) => match rows.next().await {
            Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
            _ => 0,
        },
        // Table doesn't exist yet
        Err(_) => 0,
    }
}
