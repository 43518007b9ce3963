//! IdGenerator port - ID 生成の抽象化
//!
//! Ingestion (the `seed` command, tests) mints ids through this trait so the
//! timestamp part of the ULID follows the injected clock.

use crate::domain::ids::{ItemId, SubItemId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_item_id(&self) -> ItemId;

    fn generate_sub_item_id(&self) -> SubItemId;
}

/// ULID generator: clock timestamp + random tail.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_item_id(&self) -> ItemId {
        ItemId::from(self.next_ulid())
    }

    fn generate_sub_item_id(&self) -> SubItemId {
        SubItemId::from(self.next_ulid())
    }
}
