//! Ledger: keyed escrow storage with atomic per-key read-modify-write
//!
//! Each entry sits behind its own mutex: operations on different keys run
//! independently, operations on the same key are strictly serialized for
//! the duration of one state transition. In-memory here; a durable store
//! slots in behind the same surface.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, RwLock};

use crate::EscrowResult;
use crate::error::EscrowError;
use crate::models::EscrowEntry;

#[derive(Debug, Default)]
pub struct Ledger {
    entries: RwLock<HashMap<String, Arc<Mutex<EscrowEntry>>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry under its record key. The check-and-insert is one
    /// atomic step under the map write lock, so two concurrent creates with
    /// the same key cannot both succeed.
    pub async fn insert(&self, entry: EscrowEntry) -> EscrowResult<()> {
        let key = entry.record.key.clone();
        let mut entries = self.entries.write().await;
        if entries.contains_key(&key) {
            return Err(EscrowError::DuplicateEscrow(key));
        }
        entries.insert(key, Arc::new(Mutex::new(entry)));
        Ok(())
    }

    /// Fetch the lockable handle for an entry.
    pub async fn get(&self, key: &str) -> EscrowResult<Arc<Mutex<EscrowEntry>>> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| EscrowError::NotFound(key.to_string()))
    }

    /// Point-in-time copy of an entry, for read-only consumers.
    pub async fn snapshot(&self, key: &str) -> EscrowResult<EscrowEntry> {
        let entry = self.get(key).await?;
        let guard = entry.lock().await;
        Ok(guard.clone())
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::ReleaseConditions;
    use crate::models::{ClaimTicket, EscrowRecord, EscrowVariant, VariantState};
    use chrono::Utc;

    fn entry(key: &str) -> EscrowEntry {
        let record = EscrowRecord::new(
            key.to_string(),
            EscrowVariant::SingleConditional,
            "alice".to_string(),
            100,
            None,
            Utc::now(),
        );
        let ticket = ClaimTicket::new(
            "bob".to_string(),
            100,
            key.to_string(),
            ReleaseConditions::default(),
        );
        EscrowEntry {
            record,
            state: VariantState::Single(ticket),
        }
    }

    #[tokio::test]
    async fn duplicate_keys_are_rejected() {
        let ledger = Ledger::new();
        ledger.insert(entry("gift-1")).await.unwrap();

        let err = ledger.insert(entry("gift-1")).await.unwrap_err();
        assert!(matches!(err, EscrowError::DuplicateEscrow(key) if key == "gift-1"));
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_key_is_not_found() {
        let ledger = Ledger::new();
        let err = ledger.get("missing").await.unwrap_err();
        assert!(matches!(err, EscrowError::NotFound(key) if key == "missing"));
    }

    #[tokio::test]
    async fn snapshot_is_a_copy() {
        let ledger = Ledger::new();
        ledger.insert(entry("gift-1")).await.unwrap();

        let snapshot = ledger.snapshot("gift-1").await.unwrap();
        {
            let handle = ledger.get("gift-1").await.unwrap();
            let mut guard = handle.lock().await;
            guard.record.released_amount = 100;
        }
        assert_eq!(snapshot.record.released_amount, 0);
    }
}
