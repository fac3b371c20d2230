use async_trait::async_trait;

use crate::error::Error;
use crate::models::ActivityKind;

/// The part of the timed-group-activity contract every engine shares.
/// `create` and `join` stay inherent on each engine because their parameter
/// shapes differ per kind; `advance` is the re-entrant transition invoked by
/// scheduled callbacks and the expiry sweeper, and must re-read current
/// state, verify the expected status, and no-op when the record is gone or
/// in an unexpected phase.
#[async_trait]
pub trait GroupActivity: Send + Sync {
    fn kind(&self) -> ActivityKind;

    /// Advance the activity's state machine for `channel`. Idempotent
    /// against stale timer firings.
    async fn advance(&self, channel: &str) -> Result<(), Error>;

    /// Refund all committed stakes and delete the record. Returns true when
    /// something was actually cancelled; repeated calls are no-ops.
    async fn cancel(&self, channel: &str) -> Result<bool, Error>;
}
