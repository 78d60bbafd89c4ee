//! CrowdTarget: crowd-funded target release
//!
//! Contributors pool value toward a target. The contribution that reaches
//! the target distributes the whole pool to the recipient synchronously,
//! within the same call. A pool that misses its deadline refunds each
//! contribution individually.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::EscrowResult;
use crate::engine::{EscrowEngine, reject_terminal};
use crate::error::EscrowError;
use crate::models::{
    Contribution, CrowdState, EscrowEntry, EscrowRecord, EscrowStatus, EscrowVariant, VariantState,
};

/// Crowd pool creation request
#[derive(Debug, Clone)]
pub struct CreateCrowdfundRequest {
    pub sender: String,
    pub id: String,
    pub recipient: String,
    pub target_amount: u64,
    pub deadline: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl EscrowEngine {
    /// Create a crowd-funded pool. The pool starts empty; its reserved
    /// total grows with each contribution.
    pub async fn create_crowdfund(
        &self,
        request: CreateCrowdfundRequest,
    ) -> EscrowResult<EscrowRecord> {
        info!(id = %request.id, target = request.target_amount, "creating crowdfund pool");

        self.validate_amount(request.target_amount)?;
        if request.sender.trim().is_empty() || request.recipient.trim().is_empty() {
            return Err(EscrowError::invalid_input("sender and recipient are required"));
        }
        if request.id.trim().is_empty() {
            return Err(EscrowError::invalid_input("pool id is required"));
        }

        let now = self.now();
        let mut record = EscrowRecord::new(
            request.id.clone(),
            EscrowVariant::CrowdTarget,
            request.sender,
            0,
            request.deadline,
            now,
        );
        record.status = EscrowStatus::Active;
        record.message = request.message;

        let entry = EscrowEntry {
            record: record.clone(),
            state: VariantState::Crowd(CrowdState {
                recipient: request.recipient,
                target_amount: request.target_amount,
                current_amount: 0,
                contributor_count: 0,
                distributed: false,
                contributions: Vec::new(),
            }),
        };
        self.ledger.insert(entry).await?;

        self.record_event(
            "crowdfund.created",
            &record.key,
            Some(&record.sender),
            Some(request.target_amount),
            None,
        )
        .await;

        Ok(record)
    }

    /// Contribute to a pool. Reaching the target distributes the whole pool
    /// to the recipient synchronously; a gateway failure during that
    /// distribution rolls the triggering contribution back entirely.
    pub async fn contribute(
        &self,
        id: &str,
        contributor: &str,
        amount: u64,
    ) -> EscrowResult<EscrowRecord> {
        let handle = self.ledger.get(id).await?;
        let mut guard = handle.lock().await;
        let entry = &mut *guard;

        let VariantState::Crowd(crowd) = &mut entry.state else {
            return Err(EscrowError::NotFound(id.to_string()));
        };
        if crowd.distributed {
            return Err(EscrowError::AlreadyDistributed);
        }
        reject_terminal(&entry.record)?;
        self.validate_amount(amount)?;
        if contributor.trim().is_empty() {
            return Err(EscrowError::invalid_input("contributor is required"));
        }

        let now = self.now();
        if entry.record.deadline.is_some_and(|deadline| now > deadline) {
            return Err(EscrowError::Expired);
        }

        let new_current = crowd
            .current_amount
            .checked_add(amount)
            .ok_or_else(|| EscrowError::invalid_input("contribution overflows pool"))?;
        let new_total = entry
            .record
            .total_amount
            .checked_add(amount)
            .ok_or_else(|| EscrowError::invalid_input("contribution overflows pool"))?;

        let first_time = !crowd.has_contributed(contributor);
        crowd.contributions.push(Contribution {
            contributor: contributor.to_string(),
            amount,
            contributed_at: now,
            refunded: false,
        });
        crowd.current_amount = new_current;
        entry.record.total_amount = new_total;
        if first_time {
            crowd.contributor_count += 1;
        }

        let mut distributed_amount = None;
        if crowd.current_amount >= crowd.target_amount {
            let recipient = crowd.recipient.clone();
            let payout = crowd.current_amount;
            if let Err(err) = self.pay(&mut entry.record, &recipient, payout).await {
                // Roll the triggering contribution back entirely.
                crowd.contributions.pop();
                crowd.current_amount -= amount;
                entry.record.total_amount -= amount;
                if first_time {
                    crowd.contributor_count -= 1;
                }
                return Err(err);
            }
            crowd.distributed = true;
            entry.record.transition(EscrowStatus::Completed, now)?;
            distributed_amount = Some(payout);
        }

        let snapshot = entry.record.clone();
        info!(id, contributor, amount, "contribution accepted");
        // Recorded before the entry lock is released so event order matches
        // contribution order for this pool.
        self.record_event("crowdfund.contributed", id, Some(contributor), Some(amount), None)
            .await;
        if let Some(payout) = distributed_amount {
            info!(id, payout, "crowdfund target reached, pool distributed");
            self.record_event("crowdfund.distributed", id, None, Some(payout), None)
                .await;
        }
        drop(guard);

        Ok(snapshot)
    }

    /// Refund every non-refunded contribution of a pool that missed its
    /// deadline. Each contribution is refunded individually.
    pub async fn refund_crowdfund(&self, id: &str) -> EscrowResult<EscrowRecord> {
        let handle = self.ledger.get(id).await?;
        let mut guard = handle.lock().await;
        let entry = &mut *guard;

        let VariantState::Crowd(crowd) = &mut entry.state else {
            return Err(EscrowError::NotFound(id.to_string()));
        };
        if crowd.distributed {
            return Err(EscrowError::AlreadyDistributed);
        }
        if entry.record.status.is_terminal() {
            return Err(EscrowError::state_transition(
                format!("{:?}", entry.record.status),
                "Expired".to_string(),
            ));
        }

        let now = self.now();
        let expired = entry.record.deadline.is_some_and(|deadline| now > deadline);
        if !expired {
            return Err(EscrowError::NotExpired);
        }
        if crowd.current_amount >= crowd.target_amount {
            return Err(EscrowError::invalid_input(
                "target reached; pool awaits distribution",
            ));
        }

        let mut refunded_total = 0u64;
        for index in 0..crowd.contributions.len() {
            if crowd.contributions[index].refunded {
                continue;
            }
            let contributor = crowd.contributions[index].contributor.clone();
            let amount = crowd.contributions[index].amount;
            // A mid-loop gateway failure returns here; refunded legs stay
            // marked and a retry resumes with the rest.
            self.pay(&mut entry.record, &contributor, amount).await?;
            crowd.contributions[index].refunded = true;
            crowd.current_amount -= amount;
            refunded_total += amount;
        }
        entry.record.transition(EscrowStatus::Expired, now)?;

        let snapshot = entry.record.clone();
        info!(id, refunded_total, "crowdfund pool refunded");
        self.record_event("crowdfund.refunded", id, None, Some(refunded_total), None)
            .await;
        drop(guard);

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
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

    fn request(target_amount: u64, deadline: Option<DateTime<Utc>>) -> CreateCrowdfundRequest {
        CreateCrowdfundRequest {
            sender: "alice".to_string(),
            id: "pool-1".to_string(),
            recipient: "charity".to_string(),
            target_amount,
            deadline,
            message: None,
        }
    }

    fn crowd(entry: &EscrowEntry) -> CrowdState {
        let VariantState::Crowd(crowd) = &entry.state else {
            panic!("expected crowd variant");
        };
        crowd.clone()
    }

    #[tokio::test]
    async fn reaching_target_distributes_synchronously() {
        let (engine, gateway, _clock) = setup();
        engine.create_crowdfund(request(100, None)).await.unwrap();

        engine.contribute("pool-1", "bob", 60).await.unwrap();
        let entry = engine.snapshot("pool-1").await.unwrap();
        assert_eq!(crowd(&entry).current_amount, 60);
        assert!(!crowd(&entry).distributed);
        assert_eq!(gateway.total_to("charity").await, 0);

        let record = engine.contribute("pool-1", "carol", 50).await.unwrap();
        assert_eq!(record.status, EscrowStatus::Completed);
        assert_eq!(record.released_amount, 110);
        assert_eq!(gateway.total_to("charity").await, 110);

        let err = engine.contribute("pool-1", "dave", 10).await.unwrap_err();
        assert!(matches!(err, EscrowError::AlreadyDistributed));
    }

    #[tokio::test]
    async fn contributor_count_tracks_unique_contributors() {
        let (engine, _gateway, _clock) = setup();
        engine.create_crowdfund(request(1_000, None)).await.unwrap();

        engine.contribute("pool-1", "bob", 10).await.unwrap();
        engine.contribute("pool-1", "bob", 10).await.unwrap();
        engine.contribute("pool-1", "carol", 10).await.unwrap();

        let entry = engine.snapshot("pool-1").await.unwrap();
        let crowd = crowd(&entry);
        assert_eq!(crowd.contributor_count, 2);
        assert_eq!(crowd.contributions.len(), 3);
        assert_eq!(crowd.current_amount, 30);
    }

    #[tokio::test]
    async fn contributions_past_deadline_are_rejected() {
        let (engine, _gateway, clock) = setup();
        let deadline = clock.now() + Duration::days(1);
        engine
            .create_crowdfund(request(100, Some(deadline)))
            .await
            .unwrap();

        clock.advance(Duration::days(2));
        let err = engine.contribute("pool-1", "bob", 10).await.unwrap_err();
        assert!(matches!(err, EscrowError::Expired));
    }

    #[tokio::test]
    async fn zero_contribution_is_rejected() {
        let (engine, _gateway, _clock) = setup();
        engine.create_crowdfund(request(100, None)).await.unwrap();
        assert!(matches!(
            engine.contribute("pool-1", "bob", 0).await.unwrap_err(),
            EscrowError::InvalidAmount(0)
        ));
    }

    #[tokio::test]
    async fn missed_deadline_refunds_each_contribution() {
        let (engine, gateway, clock) = setup();
        let deadline = clock.now() + Duration::days(1);
        engine
            .create_crowdfund(request(100, Some(deadline)))
            .await
            .unwrap();
        engine.contribute("pool-1", "bob", 30).await.unwrap();
        engine.contribute("pool-1", "carol", 20).await.unwrap();

        assert!(matches!(
            engine.refund_crowdfund("pool-1").await.unwrap_err(),
            EscrowError::NotExpired
        ));

        clock.advance(Duration::days(2));
        let record = engine.refund_crowdfund("pool-1").await.unwrap();
        assert_eq!(record.status, EscrowStatus::Expired);
        assert_eq!(gateway.total_to("bob").await, 30);
        assert_eq!(gateway.total_to("carol").await, 20);

        let entry = engine.snapshot("pool-1").await.unwrap();
        let crowd = crowd(&entry);
        assert_eq!(crowd.current_amount, 0);
        assert!(crowd.contributions.iter().all(|c| c.refunded));

        assert!(matches!(
            engine.refund_crowdfund("pool-1").await.unwrap_err(),
            EscrowError::StateTransition { .. }
        ));
    }

    #[tokio::test]
    async fn failed_distribution_rolls_back_the_triggering_contribution() {
        let (engine, gateway, _clock) = setup();
        engine.create_crowdfund(request(100, None)).await.unwrap();
        engine.contribute("pool-1", "bob", 60).await.unwrap();

        gateway.fail_destination("charity").await;
        let err = engine.contribute("pool-1", "carol", 50).await.unwrap_err();
        assert!(matches!(err, EscrowError::Gateway(_)));

        let entry = engine.snapshot("pool-1").await.unwrap();
        let state = crowd(&entry);
        assert_eq!(state.current_amount, 60);
        assert_eq!(state.contributions.len(), 1);
        assert_eq!(state.contributor_count, 1);
        assert!(!state.distributed);
        assert_eq!(entry.record.status, EscrowStatus::Active);

        gateway.heal_destination("charity").await;
        let record = engine.contribute("pool-1", "carol", 50).await.unwrap();
        assert_eq!(record.status, EscrowStatus::Completed);
        assert_eq!(gateway.total_to("charity").await, 110);
    }

    #[tokio::test]
    async fn concurrent_target_crossings_distribute_once() {
        let (engine, gateway, _clock) = setup();
        engine.create_crowdfund(request(100, None)).await.unwrap();
        engine.contribute("pool-1", "bob", 60).await.unwrap();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.contribute("pool-1", "carol", 50).await })
        };
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.contribute("pool-1", "dave", 50).await })
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
            EscrowError::AlreadyDistributed
        ));

        // Only the winning contribution entered the pool before payout.
        assert_eq!(gateway.total_to("charity").await, 110);
        let entry = engine.snapshot("pool-1").await.unwrap();
        let state = crowd(&entry);
        assert!(state.distributed);
        assert_eq!(state.contributions.len(), 2);
    }

    #[tokio::test]
    async fn zero_target_is_rejected() {
        let (engine, _gateway, _clock) = setup();
        assert!(matches!(
            engine.create_crowdfund(request(0, None)).await.unwrap_err(),
            EscrowError::InvalidAmount(0)
        ));
    }
}
