//! SingleConditional: single-recipient conditional release
//!
//! One sender reserves an amount for one recipient behind a claim code.
//! Release is gated by any conjunction of time lock, expiration, and
//! secret; an expired unclaimed escrow refunds to the sender.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::EscrowResult;
use crate::conditions::{ConditionOutcome, ReleaseConditions};
use crate::engine::{EscrowEngine, reject_terminal};
use crate::error::EscrowError;
use crate::models::{ClaimTicket, EscrowEntry, EscrowRecord, EscrowStatus, EscrowVariant, VariantState};

/// Conditional escrow creation request
#[derive(Debug, Clone)]
pub struct CreateConditionalRequest {
    pub sender: String,
    pub recipient: String,
    pub claim_code: String,
    pub amount: u64,
    /// Value the caller attached; must cover `amount`
    pub funding: u64,
    pub unlock_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub secret_hash: Option<[u8; 32]>,
    pub message: Option<String>,
}

impl EscrowEngine {
    /// Create a single-recipient conditional escrow. Reserves `amount` and
    /// leaves the escrow Pending until claimed or refunded.
    pub async fn create_conditional(
        &self,
        request: CreateConditionalRequest,
    ) -> EscrowResult<EscrowRecord> {
        info!(claim_code = %request.claim_code, "creating conditional escrow");

        self.validate_amount(request.amount)?;
        self.validate_funding(request.amount, request.funding)?;
        if request.sender.trim().is_empty() || request.recipient.trim().is_empty() {
            return Err(EscrowError::invalid_input("sender and recipient are required"));
        }
        if request.claim_code.trim().is_empty() {
            return Err(EscrowError::invalid_input("claim code is required"));
        }

        let now = self.now();
        let mut record = EscrowRecord::new(
            request.claim_code.clone(),
            EscrowVariant::SingleConditional,
            request.sender,
            request.amount,
            request.expires_at,
            now,
        );
        record.message = request.message;

        let conditions = ReleaseConditions {
            unlock_at: request.unlock_at,
            expires_at: request.expires_at,
            secret_hash: request.secret_hash,
        };
        let ticket = ClaimTicket::new(
            request.recipient,
            request.amount,
            request.claim_code.clone(),
            conditions,
        );

        let entry = EscrowEntry {
            record: record.clone(),
            state: VariantState::Single(ticket),
        };
        self.ledger.insert(entry).await.map_err(|err| match err {
            EscrowError::DuplicateEscrow(code) => EscrowError::DuplicateClaimCode(code),
            other => other,
        })?;

        self.record_event(
            "conditional.created",
            &record.key,
            Some(&record.sender),
            Some(record.total_amount),
            None,
        )
        .await;

        Ok(record)
    }

    /// Read-only claim preview: TimeLock ∧ Expiration, ignoring the secret.
    pub async fn can_claim(&self, claim_code: &str) -> EscrowResult<bool> {
        let handle = self.ledger.get(claim_code).await?;
        let guard = handle.lock().await;
        let VariantState::Single(ticket) = &guard.state else {
            return Err(EscrowError::NotFound(claim_code.to_string()));
        };
        if ticket.claimed || guard.record.status.is_terminal() {
            return Ok(false);
        }
        Ok(ticket.conditions.preview(self.now()).is_allowed())
    }

    /// Claim a conditional escrow. The claimed check-and-set is one atomic
    /// step under the entry lock: a racing second attempt observes
    /// AlreadyClaimed, never a double payout.
    pub async fn claim_conditional(
        &self,
        claim_code: &str,
        provided_secret: Option<&str>,
    ) -> EscrowResult<EscrowRecord> {
        let handle = self.ledger.get(claim_code).await?;
        let mut guard = handle.lock().await;
        let entry = &mut *guard;

        let VariantState::Single(ticket) = &mut entry.state else {
            return Err(EscrowError::NotFound(claim_code.to_string()));
        };
        if ticket.claimed {
            return Err(EscrowError::AlreadyClaimed(claim_code.to_string()));
        }
        reject_terminal(&entry.record)?;

        let now = self.now();
        if let ConditionOutcome::Deny(reason) = ticket.conditions.evaluate(now, provided_secret) {
            return Err(reason.into());
        }

        let recipient = ticket.recipient.clone();
        let amount = ticket.amount;
        // Gateway failure propagates here with the ticket still unclaimed.
        self.pay(&mut entry.record, &recipient, amount).await?;
        ticket.mark_claimed(now);
        entry.record.transition(EscrowStatus::Completed, now)?;

        let snapshot = entry.record.clone();
        info!(claim_code, amount, "conditional escrow claimed");
        // Recorded before the entry lock is released so event order matches
        // transition order for this key.
        self.record_event(
            "conditional.claimed",
            claim_code,
            Some(&recipient),
            Some(amount),
            None,
        )
        .await;
        drop(guard);

        Ok(snapshot)
    }

    /// Refund an expired, unclaimed conditional escrow to its sender.
    pub async fn refund_conditional(&self, claim_code: &str) -> EscrowResult<EscrowRecord> {
        let handle = self.ledger.get(claim_code).await?;
        let mut guard = handle.lock().await;
        let entry = &mut *guard;

        let VariantState::Single(ticket) = &entry.state else {
            return Err(EscrowError::NotFound(claim_code.to_string()));
        };
        if ticket.claimed {
            return Err(EscrowError::AlreadyClaimed(claim_code.to_string()));
        }
        if entry.record.status.is_terminal() {
            return Err(EscrowError::state_transition(
                format!("{:?}", entry.record.status),
                "Expired".to_string(),
            ));
        }

        let now = self.now();
        if !ticket.conditions.is_expired(now) {
            return Err(EscrowError::NotExpired);
        }

        let sender = entry.record.sender.clone();
        let remaining = entry.record.remaining_amount();
        self.pay(&mut entry.record, &sender, remaining).await?;
        entry.record.transition(EscrowStatus::Expired, now)?;

        let snapshot = entry.record.clone();
        info!(claim_code, remaining, "conditional escrow refunded");
        self.record_event(
            "conditional.refunded",
            claim_code,
            Some(&sender),
            Some(remaining),
            None,
        )
        .await;
        drop(guard);

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::conditions::hash_secret;
    use crate::engine::EngineConfig;
    use crate::gateway::RecordingGateway;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn setup() -> (Arc<EscrowEngine>, Arc<RecordingGateway>, Arc<ManualClock>) {
        let gateway = Arc::new(RecordingGateway::new());
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        let engine = Arc::new(EscrowEngine::new(
            EngineConfig::default(),
            gateway.clone(),
            clock.clone(),
        ));
        (engine, gateway, clock)
    }

    fn request(claim_code: &str, amount: u64) -> CreateConditionalRequest {
        CreateConditionalRequest {
            sender: "alice".to_string(),
            recipient: "bob".to_string(),
            claim_code: claim_code.to_string(),
            amount,
            funding: amount,
            unlock_at: None,
            expires_at: None,
            secret_hash: None,
            message: None,
        }
    }

    #[tokio::test]
    async fn wrong_secret_leaves_state_unchanged_then_correct_secret_pays() {
        let (engine, gateway, _clock) = setup();
        engine
            .create_conditional(CreateConditionalRequest {
                secret_hash: Some(hash_secret("X")),
                ..request("gift-1", 100)
            })
            .await
            .unwrap();

        let err = engine
            .claim_conditional("gift-1", Some("Y"))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidSecret));
        let snapshot = engine.snapshot("gift-1").await.unwrap();
        assert_eq!(snapshot.record.status, EscrowStatus::Pending);
        assert_eq!(snapshot.record.released_amount, 0);

        let record = engine
            .claim_conditional("gift-1", Some("X"))
            .await
            .unwrap();
        assert_eq!(record.status, EscrowStatus::Completed);
        assert_eq!(record.released_amount, 100);
        assert_eq!(gateway.total_to("bob").await, 100);
    }

    #[tokio::test]
    async fn missing_secret_is_rejected() {
        let (engine, _gateway, _clock) = setup();
        engine
            .create_conditional(CreateConditionalRequest {
                secret_hash: Some(hash_secret("X")),
                ..request("gift-1", 100)
            })
            .await
            .unwrap();

        let err = engine.claim_conditional("gift-1", None).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidSecret));
    }

    #[tokio::test]
    async fn duplicate_claim_code_is_rejected() {
        let (engine, _gateway, _clock) = setup();
        engine.create_conditional(request("gift-1", 100)).await.unwrap();

        let err = engine
            .create_conditional(request("gift-1", 50))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::DuplicateClaimCode(code) if code == "gift-1"));
    }

    #[tokio::test]
    async fn underfunded_create_is_rejected() {
        let (engine, _gateway, _clock) = setup();
        let err = engine
            .create_conditional(CreateConditionalRequest {
                funding: 99,
                ..request("gift-1", 100)
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::InsufficientFunding {
                required: 100,
                provided: 99
            }
        ));
    }

    #[tokio::test]
    async fn time_lock_gates_claim_until_unlock() {
        let (engine, gateway, clock) = setup();
        let unlock_at = clock.now() + Duration::hours(1);
        engine
            .create_conditional(CreateConditionalRequest {
                unlock_at: Some(unlock_at),
                ..request("gift-1", 100)
            })
            .await
            .unwrap();

        assert!(!engine.can_claim("gift-1").await.unwrap());
        let err = engine.claim_conditional("gift-1", None).await.unwrap_err();
        assert!(matches!(err, EscrowError::TimeLocked { unlock_at: at } if at == unlock_at));

        clock.advance(Duration::hours(1));
        assert!(engine.can_claim("gift-1").await.unwrap());
        engine.claim_conditional("gift-1", None).await.unwrap();
        assert_eq!(gateway.total_to("bob").await, 100);
    }

    #[tokio::test]
    async fn expired_escrow_refunds_to_sender() {
        let (engine, gateway, clock) = setup();
        let expires_at = clock.now() + Duration::hours(1);
        engine
            .create_conditional(CreateConditionalRequest {
                expires_at: Some(expires_at),
                ..request("gift-1", 100)
            })
            .await
            .unwrap();

        // Not expired yet: neither claim expiry nor refund applies.
        assert!(matches!(
            engine.refund_conditional("gift-1").await.unwrap_err(),
            EscrowError::NotExpired
        ));

        clock.advance(Duration::hours(2));
        assert!(matches!(
            engine.claim_conditional("gift-1", None).await.unwrap_err(),
            EscrowError::Expired
        ));

        let record = engine.refund_conditional("gift-1").await.unwrap();
        assert_eq!(record.status, EscrowStatus::Expired);
        assert_eq!(gateway.total_to("alice").await, 100);

        // Terminal: a second refund and a late claim both fail.
        assert!(matches!(
            engine.refund_conditional("gift-1").await.unwrap_err(),
            EscrowError::StateTransition { .. }
        ));
        assert!(matches!(
            engine.claim_conditional("gift-1", None).await.unwrap_err(),
            EscrowError::Expired
        ));
    }

    #[tokio::test]
    async fn refund_without_expiry_is_rejected() {
        let (engine, _gateway, _clock) = setup();
        engine.create_conditional(request("gift-1", 100)).await.unwrap();
        assert!(matches!(
            engine.refund_conditional("gift-1").await.unwrap_err(),
            EscrowError::NotExpired
        ));
    }

    #[tokio::test]
    async fn concurrent_claims_pay_exactly_once() {
        let (engine, gateway, _clock) = setup();
        engine.create_conditional(request("gift-1", 100)).await.unwrap();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.claim_conditional("gift-1", None).await })
        };
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.claim_conditional("gift-1", None).await })
        };

        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        let successes = [&first, &second]
            .iter()
            .filter(|outcome| outcome.is_ok())
            .count();
        assert_eq!(successes, 1);
        let failure = if first.is_err() { first } else { second };
        assert!(matches!(
            failure.unwrap_err(),
            EscrowError::AlreadyClaimed(_)
        ));
        assert_eq!(gateway.total_to("bob").await, 100);
    }

    #[tokio::test]
    async fn gateway_failure_leaves_ticket_claimable() {
        let (engine, gateway, _clock) = setup();
        engine.create_conditional(request("gift-1", 100)).await.unwrap();

        gateway.fail_destination("bob").await;
        let err = engine.claim_conditional("gift-1", None).await.unwrap_err();
        assert!(matches!(err, EscrowError::Gateway(_)));

        let snapshot = engine.snapshot("gift-1").await.unwrap();
        assert_eq!(snapshot.record.status, EscrowStatus::Pending);
        let VariantState::Single(ticket) = snapshot.state else {
            panic!("expected single variant");
        };
        assert!(!ticket.claimed);

        gateway.heal_destination("bob").await;
        let record = engine.claim_conditional("gift-1", None).await.unwrap();
        assert_eq!(record.status, EscrowStatus::Completed);
        assert_eq!(gateway.total_to("bob").await, 100);
    }

    #[tokio::test]
    async fn unknown_claim_code_is_not_found() {
        let (engine, _gateway, _clock) = setup();
        assert!(matches!(
            engine.claim_conditional("missing", None).await.unwrap_err(),
            EscrowError::NotFound(_)
        ));
    }
}
