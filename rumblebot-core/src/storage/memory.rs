//! In-memory store and ledger backends. Used by the local simulator and by
//! tests; each test gets isolated state with no shared globals.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use rumblebot_common::traits::store_traits::{PointsLedger, StateStore};
use rumblebot_common::Error;

#[derive(Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }
}

/// One ledger mutation, kept so tests can assert the conservation
/// invariant: the pot of any activity must equal the sum of debits issued
/// against the ledger for it, and settled activities must net to zero.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub channel: String,
    pub user_id: Uuid,
    pub delta: i64,
    pub reason: String,
}

#[derive(Default)]
pub struct MemoryPointsLedger {
    balances: DashMap<(String, Uuid), i64>,
    audit: Mutex<Vec<LedgerEntry>>,
}

impl MemoryPointsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: set a balance directly, bypassing the audit trail.
    pub fn set_points(&self, channel: &str, user_id: Uuid, amount: i64) {
        self.balances.insert((channel.to_string(), user_id), amount);
    }

    pub fn audit_trail(&self) -> Vec<LedgerEntry> {
        self.audit.lock().unwrap().clone()
    }

    /// Net of all recorded mutations whose reason starts with `prefix`.
    pub fn net_for_reason(&self, prefix: &str) -> i64 {
        self.audit
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.reason.starts_with(prefix))
            .map(|e| e.delta)
            .sum()
    }

    fn record(&self, channel: &str, user_id: Uuid, delta: i64, reason: &str) {
        self.audit.lock().unwrap().push(LedgerEntry {
            channel: channel.to_string(),
            user_id,
            delta,
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl PointsLedger for MemoryPointsLedger {
    async fn get_points(&self, channel: &str, user_id: Uuid) -> Result<i64, Error> {
        Ok(self
            .balances
            .get(&(channel.to_string(), user_id))
            .map(|v| *v)
            .unwrap_or(0))
    }

    async fn add_points(
        &self,
        channel: &str,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<(), Error> {
        if amount < 0 {
            return Err(Error::Ledger(format!("negative credit: {}", amount)));
        }
        *self
            .balances
            .entry((channel.to_string(), user_id))
            .or_insert(0) += amount;
        self.record(channel, user_id, amount, reason);
        Ok(())
    }

    async fn remove_points(
        &self,
        channel: &str,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<(), Error> {
        if amount < 0 {
            return Err(Error::Ledger(format!("negative debit: {}", amount)));
        }
        let mut entry = self
            .balances
            .entry((channel.to_string(), user_id))
            .or_insert(0);
        if *entry < amount {
            return Err(Error::InsufficientPoints {
                needed: amount,
                available: *entry,
            });
        }
        *entry -= amount;
        drop(entry);
        self.record(channel, user_id, -amount, reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn debit_fails_before_mutating_when_short() {
        let ledger = MemoryPointsLedger::new();
        let user = Uuid::new_v4();
        ledger.set_points("chan", user, 50);

        let err = ledger
            .remove_points("chan", user, 80, "test")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientPoints {
                needed: 80,
                available: 50
            }
        ));
        assert_eq!(ledger.get_points("chan", user).await.unwrap(), 50);
        assert!(ledger.audit_trail().is_empty());
    }

    #[tokio::test]
    async fn audit_trail_nets_mutations() {
        let ledger = MemoryPointsLedger::new();
        let user = Uuid::new_v4();
        ledger.set_points("chan", user, 100);

        ledger.remove_points("chan", user, 40, "duel:escrow").await.unwrap();
        ledger.add_points("chan", user, 80, "duel:win").await.unwrap();

        assert_eq!(ledger.get_points("chan", user).await.unwrap(), 140);
        assert_eq!(ledger.net_for_reason("duel:"), 40);
    }

    #[tokio::test]
    async fn balances_are_scoped_per_channel() {
        let ledger = MemoryPointsLedger::new();
        let user = Uuid::new_v4();
        ledger.add_points("a", user, 10, "seed").await.unwrap();
        assert_eq!(ledger.get_points("a", user).await.unwrap(), 10);
        assert_eq!(ledger.get_points("b", user).await.unwrap(), 0);
    }
}
