//! Impls - 実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryRecordStore**: single-process record store
//! - **scripted**: collaborators with injectable failures (tests only)
//!
//! # 本番用実装
//! - `drover-libsql`: LibsqlRecordStore

pub mod memory_store;

#[cfg(test)]
pub mod scripted;

pub use self::memory_store::InMemoryRecordStore;
