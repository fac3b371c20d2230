//! src/storage/mod.rs
//!
//! Typed access to activity documents on top of the raw `StateStore`
//! contract, plus the concrete store/ledger backends.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use tracing::warn;

use rumblebot_common::models::{ActivityKind, ActivityRecord, ACTIVITY_SCHEMA_VERSION};
use rumblebot_common::traits::store_traits::StateStore;
use rumblebot_common::Error;

pub use memory::{MemoryPointsLedger, MemoryStateStore};
pub use postgres::{PostgresPointsLedger, PostgresStateStore};

/// Wraps the raw byte-oriented store with the versioned activity schema.
/// Every read validates the schema version and that the stored kind matches
/// the key prefix, so malformed or stale documents fail closed instead of
/// corrupting in-memory logic.
#[derive(Clone)]
pub struct ActivityStore {
    store: Arc<dyn StateStore>,
}

impl ActivityStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// The underlying store, for auxiliary keys that are not activity
    /// documents (e.g. the persistent boss level).
    pub fn backing(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub async fn load(
        &self,
        kind: ActivityKind,
        channel: &str,
    ) -> Result<Option<ActivityRecord>, Error> {
        let key = kind.storage_key(channel);
        let bytes = match self.store.get(&key).await? {
            Some(b) => b,
            None => return Ok(None),
        };

        let record: ActivityRecord = serde_json::from_slice(&bytes).map_err(|e| {
            warn!("malformed activity document at '{}': {}", key, e);
            Error::Store(format!("malformed activity document at '{}'", key))
        })?;

        if record.version != ACTIVITY_SCHEMA_VERSION {
            warn!(
                "activity document at '{}' has schema version {} (expected {})",
                key, record.version, ACTIVITY_SCHEMA_VERSION
            );
            return Err(Error::Store(format!(
                "unsupported schema version {} at '{}'",
                record.version, key
            )));
        }
        if record.kind() != kind {
            warn!(
                "activity document at '{}' claims kind {:?}",
                key,
                record.kind()
            );
            return Err(Error::Store(format!("kind mismatch at '{}'", key)));
        }

        Ok(Some(record))
    }

    pub async fn save(&self, record: &ActivityRecord) -> Result<(), Error> {
        let key = record.kind().storage_key(&record.channel);
        let bytes = serde_json::to_vec(record)?;
        self.store.set(&key, bytes).await
    }

    pub async fn remove(&self, kind: ActivityKind, channel: &str) -> Result<(), Error> {
        self.store.delete(&kind.storage_key(channel)).await
    }

    /// Channels that currently have a record of `kind`, derived from the
    /// key namespace.
    pub async fn channels_with(&self, kind: ActivityKind) -> Result<Vec<String>, Error> {
        let prefix = format!("{}:", kind.key_prefix());
        let keys = self.store.list_keys(&prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rumblebot_common::models::{ActivityState, CrewStatus, HeistState};

    fn heist_record(channel: &str) -> ActivityRecord {
        ActivityRecord::new(
            channel,
            Utc::now(),
            ActivityState::Heist(HeistState {
                status: CrewStatus::Recruiting,
                crew: vec![],
                recruit_until: Utc::now(),
            }),
        )
    }

    #[tokio::test]
    async fn save_load_remove_round_trip() {
        let store = ActivityStore::new(Arc::new(MemoryStateStore::new()));
        assert!(store.load(ActivityKind::Heist, "chan").await.unwrap().is_none());

        store.save(&heist_record("chan")).await.unwrap();
        let loaded = store.load(ActivityKind::Heist, "chan").await.unwrap().unwrap();
        assert_eq!(loaded.kind(), ActivityKind::Heist);

        store.remove(ActivityKind::Heist, "chan").await.unwrap();
        assert!(store.load(ActivityKind::Heist, "chan").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_document_fails_closed() {
        let raw = Arc::new(MemoryStateStore::new());
        raw.set("heist:chan", b"{not json".to_vec()).await.unwrap();

        let store = ActivityStore::new(raw);
        assert!(matches!(
            store.load(ActivityKind::Heist, "chan").await,
            Err(Error::Store(_))
        ));
    }

    #[tokio::test]
    async fn wrong_kind_under_key_fails_closed() {
        let raw = Arc::new(MemoryStateStore::new());
        let store = ActivityStore::new(raw.clone());

        // A heist document parked under the raffle namespace must be
        // rejected, not interpreted.
        let bytes = serde_json::to_vec(&heist_record("chan")).unwrap();
        raw.set("raffle:chan", bytes).await.unwrap();
        assert!(matches!(
            store.load(ActivityKind::Raffle, "chan").await,
            Err(Error::Store(_))
        ));
    }

    #[tokio::test]
    async fn unknown_schema_version_fails_closed() {
        let raw = Arc::new(MemoryStateStore::new());
        let store = ActivityStore::new(raw.clone());

        let mut record = heist_record("chan");
        record.version = ACTIVITY_SCHEMA_VERSION + 1;
        raw.set("heist:chan", serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();
        assert!(matches!(
            store.load(ActivityKind::Heist, "chan").await,
            Err(Error::Store(_))
        ));
    }

    #[tokio::test]
    async fn channels_with_strips_the_namespace() {
        let store = ActivityStore::new(Arc::new(MemoryStateStore::new()));
        store.save(&heist_record("alpha")).await.unwrap();
        store.save(&heist_record("beta")).await.unwrap();

        let mut channels = store.channels_with(ActivityKind::Heist).await.unwrap();
        channels.sort();
        assert_eq!(channels, vec!["alpha", "beta"]);
        assert!(store
            .channels_with(ActivityKind::Raffle)
            .await
            .unwrap()
            .is_empty());
    }
}
