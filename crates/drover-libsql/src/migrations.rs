//! Schema migrations for the drover record store.
//!
//! Applied in order on open. Timestamps are unix milliseconds so that the
//! staleness comparison is a plain integer comparison; ids are bare ULIDs,
//! which sort in creation order.

pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: work_items, sub_items",
        sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS work_items (
    id           TEXT PRIMARY KEY,
    category     TEXT,
    source_url   TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'pending'
                 CHECK (status IN ('pending', 'claimed', 'done', 'failed')),
    claimed_at   INTEGER,
    claimed_by   TEXT,
    attempts     INTEGER NOT NULL DEFAULT 0,
    result       TEXT,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    completed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(status, id);
CREATE INDEX IF NOT EXISTS idx_work_items_category ON work_items(category, status, id);

CREATE TABLE IF NOT EXISTS sub_items (
    id         TEXT PRIMARY KEY,
    parent_id  TEXT NOT NULL REFERENCES work_items(id) ON DELETE CASCADE,
    source_url TEXT NOT NULL,
    status     TEXT NOT NULL DEFAULT 'pending'
               CHECK (status IN ('pending', 'claimed', 'done', 'failed')),
    result     TEXT,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sub_items_parent ON sub_items(parent_id, id);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
