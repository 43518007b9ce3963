//! drover-core
//!
//! Claim-check coordination for a pool of workers draining a shared backlog.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, status, item, update, outcome, errors, retry）
//! - **ports**: 抽象化レイヤー（RecordStore, ContentSource, ArtifactSink, Clock, ...）
//! - **app**: claim, pipeline, recorder, worker_loop, supervisor, operator, builder
//! - **impls**: InMemoryRecordStore（開発用・テスト用）
//! - **config**: drover.toml
//! - **error**: DroverError / StoreError

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

pub use crate::app::{App, AppBuilder};
pub use crate::config::DroverConfig;
pub use crate::error::{DroverError, Result, StoreError};
