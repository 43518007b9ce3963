//! App - アプリケーション層
//!
//! Combines the ports into the coordination logic.
//!
//! # 主要コンポーネント
//! - **ClaimManager**: atomic claim of one eligible item
//! - **Pipeline**: runs the stages, produces a PipelineResult
//! - **OutcomeRecorder**: writes done / failed through the claim guard
//! - **WorkerLoop**: claim → process → record
//! - **Supervisor**: runs N workers, restarts crashed ones, drains on shutdown
//! - **Operator**: reset / status / inspect
//! - **AppBuilder**: wiring

pub mod builder;
pub mod claim;
pub mod operator;
pub mod pipeline;
pub mod recorder;
pub mod status;
pub mod supervisor;
pub mod worker_loop;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::claim::{Claim, ClaimManager, ClaimSettings};
pub use self::operator::{Operator, ResetOutcome};
pub use self::pipeline::{Collaborators, Pipeline, PipelineSettings};
pub use self::recorder::{OutcomeRecorder, RecordOutcome};
pub use self::status::{ItemDetail, StatusReport};
pub use self::supervisor::{Supervisor, SupervisorReport, SupervisorSettings, WorkerFactory};
pub use self::worker_loop::{TickOutcome, WorkerLoop, WorkerState, WorkerStats};
