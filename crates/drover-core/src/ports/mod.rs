//! Ports - 抽象化レイヤー
//!
//! Each trait is the seam to something outside the core: the shared record
//! store, the processing collaborators, time and id generation.

pub mod clock;
pub mod id_generator;
pub mod record_store;
pub mod stages;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::record_store::{BacklogCounts, EligibilityQuery, RecordStore, StatusCounts};
pub use self::stages::{
    ArtifactSink, Artifacts, ContentSource, Enricher, NoopEnricher, PassThroughSubItems,
    StagePayload, SubItemProcessor,
};
