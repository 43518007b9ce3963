//! Domain model (ids, statuses, records, conditional updates, outcomes).

pub mod errors;
pub mod ids;
pub mod item;
pub mod outcome;
pub mod retry;
pub mod status;
pub mod update;

pub use errors::{FailureKind, StageFailure};
pub use ids::{ItemId, ParseIdError, SubItemId};
pub use item::{NewSubItem, NewWorkItem, SubItem, WorkItem, stale_before};
pub use outcome::{PipelineMetrics, PipelineResult, Stage, StageError, SubItemOutcome};
pub use retry::RetryPolicy;
pub use status::{ItemStatus, ParseStatusError};
pub use update::{ItemUpdate, SubItemPatch, SubItemUpdate, UpdateGuard};
