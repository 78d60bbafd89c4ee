//! Escrow engine: the shared core behind all five release families
//!
//! The engine owns the ledger and audit trail and borrows the injected
//! capabilities (transfer gateway, clock). Variant operations live in their
//! own modules as `impl EscrowEngine` blocks; the helpers here carry the
//! shared discipline: checked releases, per-key serialization, rollback on
//! gateway failure, and event logging.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;

use crate::EscrowResult;
use crate::clock::{Clock, SystemClock};
use crate::error::EscrowError;
use crate::gateway::{TransferGateway, TransferReceipt};
use crate::ledger::Ledger;
use crate::models::{EscrowEntry, EscrowEvent, EscrowRecord, EscrowStatus};

/// Configuration for the escrow engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum value a single escrow may reserve
    pub max_escrow_amount: u64,
    /// Maximum recipients per batch campaign
    pub max_batch_recipients: usize,
    /// Minimum recurring-payment interval in seconds
    pub min_interval_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_escrow_amount: 10_000_000,
            max_batch_recipients: 100,
            min_interval_seconds: 1,
        }
    }
}

/// Main escrow engine. Cheap to share behind an `Arc`; all operations take
/// `&self`.
pub struct EscrowEngine {
    pub(crate) config: EngineConfig,
    pub(crate) ledger: Ledger,
    pub(crate) gateway: Arc<dyn TransferGateway>,
    pub(crate) clock: Arc<dyn Clock>,
    events: RwLock<Vec<EscrowEvent>>,
}

impl EscrowEngine {
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn TransferGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!("initializing escrow engine");
        Self {
            config,
            ledger: Ledger::new(),
            gateway,
            clock,
            events: RwLock::new(Vec::new()),
        }
    }

    /// Engine with default configuration and the system clock.
    pub fn with_defaults(gateway: Arc<dyn TransferGateway>) -> Self {
        Self::new(EngineConfig::default(), gateway, Arc::new(SystemClock))
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Point-in-time copy of an escrow for read-only consumers.
    pub async fn snapshot(&self, key: &str) -> EscrowResult<EscrowEntry> {
        self.ledger.snapshot(key).await
    }

    /// The full audit trail, in order.
    pub async fn events(&self) -> Vec<EscrowEvent> {
        self.events.read().await.clone()
    }

    /// Audit events for one escrow.
    pub async fn events_for(&self, key: &str) -> Vec<EscrowEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|event| event.escrow_key == key)
            .cloned()
            .collect()
    }

    /// Append an audit event. Mutating operations call this after the
    /// transition has committed and while still holding the entry lock, so
    /// event order matches transition order for any one key.
    pub(crate) async fn record_event(
        &self,
        event_type: &str,
        escrow_key: &str,
        actor: Option<&str>,
        amount: Option<u64>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut events = self.events.write().await;
        let event = EscrowEvent {
            seq: events.len() as u64,
            event_type: event_type.to_string(),
            escrow_key: escrow_key.to_string(),
            actor: actor.map(str::to_string),
            amount,
            metadata,
            created_at: self.now(),
        };
        events.push(event);
    }

    /// Reject zero amounts and amounts above the configured maximum.
    pub(crate) fn validate_amount(&self, amount: u64) -> EscrowResult<()> {
        if amount == 0 || amount > self.config.max_escrow_amount {
            return Err(EscrowError::InvalidAmount(amount));
        }
        Ok(())
    }

    /// Reject funding that does not cover the amount to reserve.
    pub(crate) fn validate_funding(&self, required: u64, provided: u64) -> EscrowResult<()> {
        if provided < required {
            return Err(EscrowError::InsufficientFunding { required, provided });
        }
        Ok(())
    }

    /// Move value out of custody through the gateway, then account for it.
    ///
    /// The gateway call happens first: if it fails, no bookkeeping has
    /// advanced and the caller's transition aborts cleanly. Callers mutate
    /// variant state only after this returns Ok.
    pub(crate) async fn pay(
        &self,
        record: &mut EscrowRecord,
        destination: &str,
        amount: u64,
    ) -> EscrowResult<TransferReceipt> {
        let receipt = self.gateway.transfer(&record.key, destination, amount).await?;
        record.record_release(amount)?;
        Ok(receipt)
    }
}

/// Convenience check shared by the variant modules: map a terminal record
/// status to the error a mutating operation should report.
pub(crate) fn reject_terminal(record: &EscrowRecord) -> EscrowResult<()> {
    match record.status {
        EscrowStatus::Expired => Err(EscrowError::Expired),
        EscrowStatus::Cancelled => Err(EscrowError::state_transition(
            format!("{:?}", record.status),
            "Active".to_string(),
        )),
        EscrowStatus::Completed => Err(EscrowError::state_transition(
            format!("{:?}", record.status),
            "Active".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::RecordingGateway;
    use crate::models::EscrowVariant;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[tokio::test]
    async fn pay_rolls_back_on_gateway_failure() {
        init_tracing();
        let gateway = Arc::new(RecordingGateway::new());
        let engine = EscrowEngine::with_defaults(gateway.clone());

        let mut record = EscrowRecord::new(
            "gift-1".to_string(),
            EscrowVariant::SingleConditional,
            "alice".to_string(),
            100,
            None,
            Utc::now(),
        );

        gateway.fail_destination("bob").await;
        let err = engine.pay(&mut record, "bob", 100).await.unwrap_err();
        assert!(matches!(err, EscrowError::Gateway(_)));
        assert_eq!(record.released_amount, 0);

        gateway.heal_destination("bob").await;
        engine.pay(&mut record, "bob", 100).await.unwrap();
        assert_eq!(record.released_amount, 100);
        assert_eq!(gateway.total_to("bob").await, 100);
    }

    #[tokio::test]
    async fn events_are_ordered_and_filterable() {
        init_tracing();
        let engine = EscrowEngine::with_defaults(Arc::new(RecordingGateway::new()));

        engine
            .record_event("escrow.created", "gift-1", Some("alice"), Some(100), None)
            .await;
        engine
            .record_event("escrow.created", "pool-1", Some("carol"), None, None)
            .await;
        engine
            .record_event("escrow.claimed", "gift-1", Some("bob"), Some(100), None)
            .await;

        let all = engine.events().await;
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|pair| pair[0].seq < pair[1].seq));

        let gift = engine.events_for("gift-1").await;
        assert_eq!(gift.len(), 2);
        assert_eq!(gift[1].event_type, "escrow.claimed");
    }

    #[tokio::test]
    async fn amount_validation_uses_configured_maximum() {
        let engine = EscrowEngine::new(
            EngineConfig {
                max_escrow_amount: 1_000,
                ..EngineConfig::default()
            },
            Arc::new(RecordingGateway::new()),
            Arc::new(SystemClock),
        );
        assert!(engine.validate_amount(1_000).is_ok());
        assert!(matches!(
            engine.validate_amount(1_001).unwrap_err(),
            EscrowError::InvalidAmount(1_001)
        ));
        assert!(matches!(
            engine.validate_amount(0).unwrap_err(),
            EscrowError::InvalidAmount(0)
        ));
    }
}
