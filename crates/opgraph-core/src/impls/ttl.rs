//! MetadataTtlPolicy - エンティティのメタデータから TTL を読む

use chrono::Duration;
use tracing::warn;

use crate::domain::{EntityDescription, request::TIME_TO_LIVE_KEY};
use crate::ports::TtlPolicy;

/// Reads `timeToLive` (seconds, fractional allowed) from the entity's
/// metadata, falling back to `default` when absent or unparsable.
#[derive(Debug, Clone, Copy)]
pub struct MetadataTtlPolicy {
    default: Duration,
}

impl MetadataTtlPolicy {
    pub fn new(default: Duration) -> Self {
        Self { default }
    }

    pub fn from_secs(default_secs: f64) -> Self {
        Self::new(secs_to_duration(default_secs))
    }

    pub fn default_ttl(&self) -> Duration {
        self.default
    }
}

/// Negative and non-finite values become zero.
pub(crate) fn secs_to_duration(secs: f64) -> Duration {
    if !secs.is_finite() || secs <= 0.0 {
        return Duration::zero();
    }
    let millis = (secs * 1000.0).min(i64::MAX as f64) as i64;
    Duration::try_milliseconds(millis).unwrap_or(Duration::MAX)
}

impl TtlPolicy for MetadataTtlPolicy {
    fn ttl_for(&self, entity: &EntityDescription) -> Duration {
        let Some(raw) = entity.metadata(TIME_TO_LIVE_KEY) else {
            return self.default;
        };
        match raw.trim().parse::<f64>() {
            Ok(secs) => secs_to_duration(secs),
            Err(_) => {
                warn!(entity = %entity.name, value = raw, "unparsable timeToLive, using default");
                self.default
            }
        }
    }
}
