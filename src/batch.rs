//! BatchThreshold: batch release with threshold-triggered cascade
//!
//! A campaign holds one ticket per recipient. Each successful claim
//! recomputes the completion percentage; the first time it crosses the
//! declared threshold, every remaining unclaimed ticket is released in the
//! same call. A per-campaign flag guards the cascade to at most once.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::EscrowResult;
use crate::conditions::{ConditionOutcome, ReleaseConditions, threshold_reached};
use crate::engine::{EscrowEngine, reject_terminal};
use crate::error::EscrowError;
use crate::models::{
    BatchState, ClaimTicket, EscrowEntry, EscrowRecord, EscrowStatus, EscrowVariant, VariantState,
};

/// Campaign creation request. Recipients, amounts, and claim codes are
/// parallel lists and must agree in length.
#[derive(Debug, Clone)]
pub struct CreateCampaignRequest {
    pub sender: String,
    pub campaign_code: String,
    pub recipients: Vec<String>,
    pub amounts: Vec<u64>,
    pub claim_codes: Vec<String>,
    /// Completion percentage (0-100) that triggers the cascade; 0 fires on
    /// the first claim
    pub threshold_percent: u8,
    /// Value the caller attached; must cover the sum of all amounts
    pub funding: u64,
    pub deadline: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl EscrowEngine {
    /// Create a batch campaign; reserves the sum of all ticket amounts.
    pub async fn create_campaign(
        &self,
        request: CreateCampaignRequest,
    ) -> EscrowResult<EscrowRecord> {
        info!(campaign_code = %request.campaign_code, recipients = request.recipients.len(), "creating campaign");

        if request.recipients.is_empty() {
            return Err(EscrowError::RecipientListEmpty);
        }
        if request.recipients.len() != request.amounts.len()
            || request.recipients.len() != request.claim_codes.len()
        {
            return Err(EscrowError::LengthMismatch);
        }
        if request.recipients.len() > self.config.max_batch_recipients {
            return Err(EscrowError::invalid_input(format!(
                "campaign exceeds maximum of {} recipients",
                self.config.max_batch_recipients
            )));
        }
        if request.threshold_percent > 100 {
            return Err(EscrowError::invalid_input(
                "threshold percent must be between 0 and 100",
            ));
        }
        if request.sender.trim().is_empty() {
            return Err(EscrowError::invalid_input("sender is required"));
        }

        let mut seen = HashSet::new();
        for claim_code in &request.claim_codes {
            if claim_code.trim().is_empty() {
                return Err(EscrowError::invalid_input("claim code is required"));
            }
            if !seen.insert(claim_code.as_str()) {
                return Err(EscrowError::DuplicateClaimCode(claim_code.clone()));
            }
        }

        let mut total = 0u64;
        for &amount in &request.amounts {
            self.validate_amount(amount)?;
            total = total
                .checked_add(amount)
                .ok_or_else(|| EscrowError::invalid_input("campaign total overflows"))?;
        }
        self.validate_funding(total, request.funding)?;

        let now = self.now();
        let mut record = EscrowRecord::new(
            request.campaign_code.clone(),
            EscrowVariant::BatchThreshold,
            request.sender,
            total,
            request.deadline,
            now,
        );
        record.status = EscrowStatus::Active;
        record.message = request.message;

        let tickets = request
            .recipients
            .into_iter()
            .zip(request.amounts)
            .zip(request.claim_codes)
            .map(|((recipient, amount), claim_code)| {
                ClaimTicket::new(
                    recipient,
                    amount,
                    claim_code,
                    ReleaseConditions {
                        expires_at: request.deadline,
                        ..ReleaseConditions::default()
                    },
                )
            })
            .collect();

        let entry = EscrowEntry {
            record: record.clone(),
            state: VariantState::Batch(BatchState {
                threshold_percent: request.threshold_percent,
                threshold_fired: false,
                tickets,
            }),
        };
        self.ledger.insert(entry).await.map_err(|err| match err {
            EscrowError::DuplicateEscrow(code) => EscrowError::DuplicateCampaign(code),
            other => other,
        })?;

        self.record_event(
            "campaign.created",
            &record.key,
            Some(&record.sender),
            Some(total),
            Some(serde_json::json!({
                "threshold_percent": request.threshold_percent,
            })),
        )
        .await;

        Ok(record)
    }

    /// Claim one campaign ticket. If the claim pushes the completion
    /// percentage across the threshold, every remaining unclaimed ticket is
    /// released within this same call.
    pub async fn claim_campaign(
        &self,
        campaign_code: &str,
        claim_code: &str,
    ) -> EscrowResult<EscrowRecord> {
        let handle = self.ledger.get(campaign_code).await?;
        let mut guard = handle.lock().await;
        let entry = &mut *guard;

        let VariantState::Batch(batch) = &mut entry.state else {
            return Err(EscrowError::NotFound(campaign_code.to_string()));
        };
        reject_terminal(&entry.record)?;

        let Some(index) = batch.ticket_index(claim_code) else {
            return Err(EscrowError::NotFound(format!("{campaign_code}/{claim_code}")));
        };
        if batch.tickets[index].claimed {
            return Err(EscrowError::AlreadyClaimed(claim_code.to_string()));
        }

        let now = self.now();
        if let ConditionOutcome::Deny(reason) = batch.tickets[index].conditions.evaluate(now, None)
        {
            return Err(reason.into());
        }

        let recipient = batch.tickets[index].recipient.clone();
        let amount = batch.tickets[index].amount;
        self.pay(&mut entry.record, &recipient, amount).await?;
        batch.tickets[index].mark_claimed(now);

        // Reentrant trigger: the cascade runs inside this claim's critical
        // section, never as a callback, so per-key serialization holds.
        let mut cascaded = 0u32;
        if !batch.threshold_fired
            && threshold_reached(
                batch.claimed_count(),
                batch.total_recipients(),
                batch.threshold_percent,
            )
            .is_allowed()
        {
            batch.threshold_fired = true;
            for i in 0..batch.tickets.len() {
                if batch.tickets[i].claimed {
                    continue;
                }
                let leg_recipient = batch.tickets[i].recipient.clone();
                let leg_amount = batch.tickets[i].amount;
                match self.pay(&mut entry.record, &leg_recipient, leg_amount).await {
                    Ok(_) => {
                        batch.tickets[i].mark_claimed(now);
                        cascaded += 1;
                    }
                    // A failed leg stays unclaimed and individually
                    // claimable; paid legs are already marked.
                    Err(err) => {
                        error!(campaign_code, recipient = %leg_recipient, %err, "cascade leg failed");
                    }
                }
            }
        }

        if batch.all_claimed() {
            entry.record.transition(EscrowStatus::Completed, now)?;
        }

        let claimed_count = batch.claimed_count();
        let total_recipients = batch.total_recipients();
        let snapshot = entry.record.clone();
        info!(campaign_code, claim_code, amount, cascaded, "campaign ticket claimed");
        // Recorded before the entry lock is released so event order matches
        // claim order for this campaign.
        self.record_event(
            "campaign.claimed",
            campaign_code,
            Some(&recipient),
            Some(amount),
            Some(serde_json::json!({
                "claim_code": claim_code,
                "claimed_count": claimed_count,
                "total_recipients": total_recipients,
            })),
        )
        .await;
        if cascaded > 0 {
            self.record_event(
                "campaign.cascade",
                campaign_code,
                None,
                None,
                Some(serde_json::json!({ "released_tickets": cascaded })),
            )
            .await;
        }

        Ok(snapshot)
    }

    /// Refund the unclaimed remainder of a campaign to its sender, once the
    /// deadline has passed.
    pub async fn refund_campaign(&self, campaign_code: &str) -> EscrowResult<EscrowRecord> {
        let handle = self.ledger.get(campaign_code).await?;
        let mut guard = handle.lock().await;
        let entry = &mut *guard;

        let VariantState::Batch(batch) = &mut entry.state else {
            return Err(EscrowError::NotFound(campaign_code.to_string()));
        };
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

        let sender = entry.record.sender.clone();
        let unclaimed = batch.unclaimed_total();
        if unclaimed > 0 {
            self.pay(&mut entry.record, &sender, unclaimed).await?;
        }
        entry.record.transition(EscrowStatus::Expired, now)?;

        let snapshot = entry.record.clone();
        info!(campaign_code, unclaimed, "campaign refunded");
        self.record_event(
            "campaign.refunded",
            campaign_code,
            Some(&sender),
            Some(unclaimed),
            None,
        )
        .await;
        drop(guard);

        Ok(snapshot)
    }
}
