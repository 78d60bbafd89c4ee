//! MultiSigApproval: multi-party-approval release
//!
//! A proposal releases a fixed amount to one recipient once a quorum of
//! authorized signers has approved it. Signatures are one per signer,
//! execution is at most once, and the release fires automatically inside
//! the signature that completes the quorum.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::EscrowResult;
use crate::engine::EscrowEngine;
use crate::error::EscrowError;
use crate::gateway::TransferReceipt;
use crate::models::{
    EscrowEntry, EscrowRecord, EscrowStatus, EscrowVariant, MultiSigState, SignatureRecord,
    VariantState,
};

/// Proposal creation request
#[derive(Debug, Clone)]
pub struct CreateProposalRequest {
    pub sender: String,
    pub id: String,
    pub recipient: String,
    pub amount: u64,
    pub required_signatures: u32,
    pub authorized_signers: Vec<String>,
    pub funding: u64,
    pub deadline: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl EscrowEngine {
    /// Create a release proposal. If the creator is an authorized signer
    /// their approval is recorded as part of creation, and a quorum of one
    /// executes immediately.
    pub async fn create_proposal(
        &self,
        request: CreateProposalRequest,
    ) -> EscrowResult<EscrowRecord> {
        info!(
            id = %request.id,
            required = request.required_signatures,
            signers = request.authorized_signers.len(),
            "creating release proposal"
        );

        self.validate_amount(request.amount)?;
        self.validate_funding(request.amount, request.funding)?;
        if request.sender.trim().is_empty() || request.recipient.trim().is_empty() {
            return Err(EscrowError::invalid_input("sender and recipient are required"));
        }
        if request.id.trim().is_empty() {
            return Err(EscrowError::invalid_input("proposal id is required"));
        }
        if request.authorized_signers.is_empty() {
            return Err(EscrowError::invalid_input("authorized signer list is empty"));
        }
        let mut seen = HashSet::new();
        for signer in &request.authorized_signers {
            if signer.trim().is_empty() {
                return Err(EscrowError::invalid_input("signer names must be non-empty"));
            }
            if !seen.insert(signer.as_str()) {
                return Err(EscrowError::invalid_input(format!(
                    "duplicate signer: {signer}"
                )));
            }
        }
        if request.required_signatures == 0
            || request.required_signatures as usize > request.authorized_signers.len()
        {
            return Err(EscrowError::invalid_input(format!(
                "required signatures must be between 1 and {}",
                request.authorized_signers.len()
            )));
        }

        let now = self.now();
        let mut record = EscrowRecord::new(
            request.id.clone(),
            EscrowVariant::MultiSigApproval,
            request.sender.clone(),
            request.funding,
            request.deadline,
            now,
        );
        record.status = EscrowStatus::Active;
        record.message = request.message;

        let mut state = MultiSigState {
            recipient: request.recipient,
            amount: request.amount,
            required_signatures: request.required_signatures,
            authorized_signers: request.authorized_signers,
            signatures: Vec::new(),
            executed: false,
        };
        let creator_signed = state.is_authorized(&request.sender);
        if creator_signed {
            state.signatures.push(SignatureRecord {
                signer: request.sender.clone(),
                signed_at: now,
            });
        }
        let quorum_at_create = state.signature_count() >= state.required_signatures;

        self.ledger
            .insert(EscrowEntry {
                record: record.clone(),
                state: VariantState::MultiSig(state),
            })
            .await?;

        self.record_event(
            "proposal.created",
            &record.key,
            Some(&record.sender),
            Some(request.amount),
            None,
        )
        .await;
        if creator_signed {
            self.record_event("proposal.signed", &record.key, Some(&record.sender), None, None)
                .await;
        }

        if quorum_at_create {
            if let Err(err) = self.execute_proposal(&request.id, &request.sender).await {
                warn!(id = %request.id, %err, "immediate execution deferred");
            }
        }

        self.snapshot(&request.id).await.map(|entry| entry.record)
    }

    /// Record one signer's approval. When the quorum is reached the release
    /// executes inside the same critical section; a gateway failure there
    /// discards the just-recorded signature so the signer can retry.
    pub async fn sign(&self, id: &str, signer: &str) -> EscrowResult<EscrowRecord> {
        let handle = self.ledger.get(id).await?;
        let mut guard = handle.lock().await;
        let entry = &mut *guard;

        let now = self.now();
        check_open(entry, now)?;
        let VariantState::MultiSig(proposal) = &mut entry.state else {
            return Err(EscrowError::NotFound(id.to_string()));
        };
        if !proposal.is_authorized(signer) {
            return Err(EscrowError::NotAuthorizedSigner(signer.to_string()));
        }
        if proposal.has_signed(signer) {
            return Err(EscrowError::AlreadySigned(signer.to_string()));
        }

        proposal.signatures.push(SignatureRecord {
            signer: signer.to_string(),
            signed_at: now,
        });
        let quorum = proposal.signature_count() >= proposal.required_signatures;

        let mut executed_amount = None;
        if quorum {
            match self.release_approved(entry, now).await {
                Ok(receipt) => executed_amount = Some(receipt.amount),
                Err(err) => {
                    // Release failed: discard this signature so the retry
                    // path is a plain re-sign.
                    let VariantState::MultiSig(proposal) = &mut entry.state else {
                        return Err(EscrowError::internal("proposal state changed shape"));
                    };
                    proposal.signatures.pop();
                    return Err(err);
                }
            }
        }

        let snapshot = entry.record.clone();
        info!(id, signer, executed = executed_amount.is_some(), "proposal signed");
        // Recorded before the entry lock is released so event order matches
        // signature order for this proposal.
        self.record_event("proposal.signed", id, Some(signer), None, None)
            .await;
        if let Some(amount) = executed_amount {
            self.record_event("proposal.executed", id, Some(signer), Some(amount), None)
                .await;
        }
        drop(guard);

        Ok(snapshot)
    }

    /// Execute an approved proposal. Any authorized signer may call this;
    /// it fails with the current signature count while below quorum.
    pub async fn execute_proposal(&self, id: &str, caller: &str) -> EscrowResult<EscrowRecord> {
        let handle = self.ledger.get(id).await?;
        let mut guard = handle.lock().await;
        let entry = &mut *guard;

        let now = self.now();
        check_open(entry, now)?;
        let VariantState::MultiSig(proposal) = &mut entry.state else {
            return Err(EscrowError::NotFound(id.to_string()));
        };
        if !proposal.is_authorized(caller) {
            return Err(EscrowError::NotAuthorizedSigner(caller.to_string()));
        }
        if proposal.signature_count() < proposal.required_signatures {
            return Err(EscrowError::InsufficientSignatures {
                have: proposal.signature_count(),
                required: proposal.required_signatures,
            });
        }

        let receipt = self.release_approved(entry, now).await?;
        let snapshot = entry.record.clone();
        info!(id, caller, amount = receipt.amount, "proposal executed");
        self.record_event("proposal.executed", id, Some(caller), Some(receipt.amount), None)
            .await;
        drop(guard);

        Ok(snapshot)
    }

    /// Cancel an unexecuted proposal and refund the full funding. Creator
    /// only.
    pub async fn cancel_proposal(&self, id: &str, caller: &str) -> EscrowResult<EscrowRecord> {
        let handle = self.ledger.get(id).await?;
        let mut guard = handle.lock().await;
        let entry = &mut *guard;

        let VariantState::MultiSig(proposal) = &mut entry.state else {
            return Err(EscrowError::NotFound(id.to_string()));
        };
        if caller != entry.record.sender {
            return Err(EscrowError::Unauthorized(caller.to_string()));
        }
        if proposal.executed || entry.record.status == EscrowStatus::Completed {
            return Err(EscrowError::AlreadyExecuted);
        }
        if entry.record.status == EscrowStatus::Cancelled {
            return Err(EscrowError::ProposalCancelled);
        }
        if entry.record.status.is_terminal() {
            return Err(EscrowError::state_transition(
                format!("{:?}", entry.record.status),
                "Cancelled".to_string(),
            ));
        }

        let now = self.now();
        let sender = entry.record.sender.clone();
        let refund = entry.record.remaining_amount();
        if refund > 0 {
            self.pay(&mut entry.record, &sender, refund).await?;
        }
        entry.record.transition(EscrowStatus::Cancelled, now)?;

        let snapshot = entry.record.clone();
        info!(id, refund, "proposal cancelled");
        self.record_event("proposal.cancelled", id, Some(caller), Some(refund), None)
            .await;
        drop(guard);

        Ok(snapshot)
    }

    /// Pay the recipient and close the proposal. Callers have already
    /// verified quorum; callers roll back their own bookkeeping on Err.
    async fn release_approved(
        &self,
        entry: &mut EscrowEntry,
        now: DateTime<Utc>,
    ) -> EscrowResult<TransferReceipt> {
        let VariantState::MultiSig(proposal) = &mut entry.state else {
            return Err(EscrowError::internal("proposal state changed shape"));
        };
        let recipient = proposal.recipient.clone();
        let amount = proposal.amount;

        let receipt = self.pay(&mut entry.record, &recipient, amount).await?;
        proposal.executed = true;

        // Overfunding above the approved amount returns to the sender.
        let leftover = entry.record.remaining_amount();
        if leftover > 0 {
            let sender = entry.record.sender.clone();
            if let Err(err) = self.pay(&mut entry.record, &sender, leftover).await {
                warn!(key = %entry.record.key, %err, "overfund refund deferred");
            }
        }
        entry.record.transition(EscrowStatus::Completed, now)?;
        Ok(receipt)
    }
}

/// Lifecycle guards shared by sign and execute.
fn check_open(entry: &EscrowEntry, now: DateTime<Utc>) -> EscrowResult<()> {
    let VariantState::MultiSig(proposal) = &entry.state else {
        return Err(EscrowError::NotFound(entry.record.key.clone()));
    };
    if entry.record.status == EscrowStatus::Cancelled {
        return Err(EscrowError::ProposalCancelled);
    }
    if proposal.executed || entry.record.status == EscrowStatus::Completed {
        return Err(EscrowError::AlreadyExecuted);
    }
    if entry.record.status == EscrowStatus::Expired {
        return Err(EscrowError::Expired);
    }
    if entry.record.deadline.is_some_and(|deadline| now > deadline) {
        return Err(EscrowError::Expired);
    }
    Ok(())
}
