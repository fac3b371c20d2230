use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Error;

/// Shared key-value store holding activity documents. Read-then-write only:
/// no transactions are assumed, so callers follow the read-verify-write
/// discipline on every mutation.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;
    async fn delete(&self, key: &str) -> Result<(), Error>;
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, Error>;
}

/// Service of record for user point balances. `reason` is a free-form audit
/// tag with no behavioral effect. `remove_points` must fail with
/// `Error::InsufficientPoints` before mutating anything when the balance is
/// short.
#[async_trait]
pub trait PointsLedger: Send + Sync {
    async fn get_points(&self, channel: &str, user_id: Uuid) -> Result<i64, Error>;

    async fn add_points(
        &self,
        channel: &str,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<(), Error>;

    async fn remove_points(
        &self,
        channel: &str,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<(), Error>;
}

/// Sends a chat line to a channel. Fire-and-forget: implementations log
/// delivery failures instead of surfacing them.
#[async_trait]
pub trait ResponseEmitter: Send + Sync {
    async fn say(&self, channel: &str, text: &str);
}
