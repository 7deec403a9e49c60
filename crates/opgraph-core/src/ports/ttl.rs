//! TtlPolicy port - エンティティごとの有効期間

use chrono::Duration;

use crate::domain::EntityDescription;

/// How long a fulfilled fetch of `entity` stays fresh.
pub trait TtlPolicy: Send + Sync {
    fn ttl_for(&self, entity: &EntityDescription) -> Duration;
}

impl<F> TtlPolicy for F
where
    F: Fn(&EntityDescription) -> Duration + Send + Sync,
{
    fn ttl_for(&self, entity: &EntityDescription) -> Duration {
        self(entity)
    }
}
