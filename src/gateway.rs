//! Transfer gateway: the injected capability that moves value
//!
//! The engine delegates actual value movement to a [`TransferGateway`] and
//! treats it as slow and fallible: a failed transfer aborts the attempted
//! state transition before any bookkeeping advances. Engine state, never
//! gateway idempotency, is the source of truth for "has this been paid".

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::EscrowResult;
use crate::error::EscrowError;

/// Receipt for a settled transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub reference: String,
    /// The custody account value was moved out of (the escrow key)
    pub custody: String,
    pub destination: String,
    pub amount: u64,
    pub transferred_at: DateTime<Utc>,
}

/// Capability that moves value from escrow custody to a destination.
#[async_trait]
pub trait TransferGateway: Send + Sync {
    async fn transfer(
        &self,
        custody: &str,
        destination: &str,
        amount: u64,
    ) -> EscrowResult<TransferReceipt>;
}

/// In-process gateway that records every transfer and supports per-
/// destination failure injection. Stands in for a real payment rail in
/// tests and local runs.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    transfers: RwLock<Vec<TransferReceipt>>,
    failing: RwLock<HashSet<String>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// All settled transfers, in order.
    pub async fn transfers(&self) -> Vec<TransferReceipt> {
        self.transfers.read().await.clone()
    }

    /// Total value settled to a destination.
    pub async fn total_to(&self, destination: &str) -> u64 {
        self.transfers
            .read()
            .await
            .iter()
            .filter(|receipt| receipt.destination == destination)
            .map(|receipt| receipt.amount)
            .sum()
    }

    /// Make transfers to this destination fail until healed.
    pub async fn fail_destination(&self, destination: &str) {
        self.failing.write().await.insert(destination.to_string());
    }

    pub async fn heal_destination(&self, destination: &str) {
        self.failing.write().await.remove(destination);
    }
}

#[async_trait]
impl TransferGateway for RecordingGateway {
    async fn transfer(
        &self,
        custody: &str,
        destination: &str,
        amount: u64,
    ) -> EscrowResult<TransferReceipt> {
        if amount == 0 {
            return Err(EscrowError::gateway("zero-amount transfer"));
        }
        if self.failing.read().await.contains(destination) {
            return Err(EscrowError::gateway(format!(
                "destination {destination} unreachable"
            )));
        }

        let receipt = TransferReceipt {
            reference: format!("xfer_{}", Uuid::new_v4()),
            custody: custody.to_string(),
            destination: destination.to_string(),
            amount,
            transferred_at: Utc::now(),
        };

        info!(custody, destination, amount, "transfer settled");
        self.transfers.write().await.push(receipt.clone());

        Ok(receipt)
    }
}
