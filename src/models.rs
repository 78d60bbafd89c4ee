//! Core data models for the escrow engine
//!
//! This module contains the escrow records, the per-variant state machines,
//! and the owned sub-entities (tickets, contributions, signatures, schedule
//! entries). An [`EscrowEntry`] is the unit of storage: one record plus the
//! tagged variant state it exclusively owns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::EscrowResult;
use crate::conditions::ReleaseConditions;
use crate::error::EscrowError;

/// The five release condition families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowVariant {
    /// Single-recipient conditional release
    SingleConditional,
    /// Batch release with threshold-triggered cascade
    BatchThreshold,
    /// Crowd-funded target release
    CrowdTarget,
    /// Time-scheduled recurring release
    RecurringSchedule,
    /// Multi-party-approval release
    MultiSigApproval,
}

/// Escrow lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowStatus {
    /// Created and funded, awaiting its release condition
    Pending,
    /// Accepting claims/contributions/signatures/payments
    Active,
    /// All value released to recipients
    Completed,
    /// Cancelled by the creator, value refunded
    Cancelled,
    /// Deadline passed, unreleased value refunded
    Expired,
}

impl EscrowStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }

    /// Transitions are monotonic: terminal states are never revived and a
    /// status never transitions to itself.
    pub fn can_transition_to(&self, next: EscrowStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Active)
            | (Self::Pending, Self::Completed)
            | (Self::Pending, Self::Cancelled)
            | (Self::Pending, Self::Expired)
            | (Self::Active, Self::Completed)
            | (Self::Active, Self::Cancelled)
            | (Self::Active, Self::Expired) => true,
            _ => false,
        }
    }
}

/// One escrow: funds held on behalf of a sender pending release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub id: Uuid,
    /// External lookup key: claim code, campaign code, or caller-supplied id
    pub key: String,
    pub variant: EscrowVariant,
    pub sender: String,
    pub status: EscrowStatus,
    pub deadline: Option<DateTime<Utc>>,
    /// Total value reserved in custody
    pub total_amount: u64,
    /// Value that has left custody through the gateway
    pub released_amount: u64,
    pub message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscrowRecord {
    pub fn new(
        key: String,
        variant: EscrowVariant,
        sender: String,
        total_amount: u64,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            variant,
            sender,
            status: EscrowStatus::Pending,
            deadline,
            total_amount,
            released_amount: 0,
            message: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a validated status transition.
    pub fn transition(&mut self, to: EscrowStatus, now: DateTime<Utc>) -> EscrowResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(EscrowError::state_transition(
                format!("{:?}", self.status),
                format!("{to:?}"),
            ));
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Account for value leaving custody. Releases may never exceed the
    /// reserved total.
    pub fn record_release(&mut self, amount: u64) -> EscrowResult<()> {
        let next = self
            .released_amount
            .checked_add(amount)
            .ok_or_else(|| EscrowError::internal("released amount overflow"))?;
        if next > self.total_amount {
            return Err(EscrowError::internal(format!(
                "release of {amount} would exceed reserved total {} (already released {})",
                self.total_amount, self.released_amount
            )));
        }
        self.released_amount = next;
        Ok(())
    }

    /// Value still held in custody.
    pub fn remaining_amount(&self) -> u64 {
        self.total_amount - self.released_amount
    }
}

/// One recipient's entitlement within an escrow. The claim code is unique
/// within its escrow; `claimed` is write-once true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimTicket {
    pub recipient: String,
    pub amount: u64,
    pub claim_code: String,
    pub conditions: ReleaseConditions,
    pub claimed: bool,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl ClaimTicket {
    pub fn new(
        recipient: String,
        amount: u64,
        claim_code: String,
        conditions: ReleaseConditions,
    ) -> Self {
        Self {
            recipient,
            amount,
            claim_code,
            conditions,
            claimed: false,
            claimed_at: None,
        }
    }

    pub fn mark_claimed(&mut self, now: DateTime<Utc>) {
        self.claimed = true;
        self.claimed_at = Some(now);
    }
}

/// Batch campaign state: tickets plus the threshold cascade bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    pub threshold_percent: u8,
    /// Set when the cascade fires; guards the cascade to at most once
    pub threshold_fired: bool,
    pub tickets: Vec<ClaimTicket>,
}

impl BatchState {
    pub fn claimed_count(&self) -> u64 {
        self.tickets.iter().filter(|ticket| ticket.claimed).count() as u64
    }

    pub fn total_recipients(&self) -> u64 {
        self.tickets.len() as u64
    }

    pub fn all_claimed(&self) -> bool {
        self.tickets.iter().all(|ticket| ticket.claimed)
    }

    pub fn unclaimed_total(&self) -> u64 {
        self.tickets
            .iter()
            .filter(|ticket| !ticket.claimed)
            .map(|ticket| ticket.amount)
            .sum()
    }

    pub fn ticket_index(&self, claim_code: &str) -> Option<usize> {
        self.tickets
            .iter()
            .position(|ticket| ticket.claim_code == claim_code)
    }
}

/// One backer's contribution to a crowd pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub contributor: String,
    pub amount: u64,
    pub contributed_at: DateTime<Utc>,
    pub refunded: bool,
}

/// Crowd-funded pool state. The sum of non-refunded contributions always
/// equals `current_amount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrowdState {
    pub recipient: String,
    pub target_amount: u64,
    pub current_amount: u64,
    pub contributor_count: u32,
    pub distributed: bool,
    pub contributions: Vec<Contribution>,
}

impl CrowdState {
    pub fn has_contributed(&self, contributor: &str) -> bool {
        self.contributions
            .iter()
            .any(|contribution| contribution.contributor == contributor)
    }
}

/// Recurring payment schedule state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleState {
    pub recipient: String,
    pub amount_per_payment: u64,
    pub interval_seconds: u64,
    /// Advances by exactly one interval per executed payment, never reset
    pub next_due_at: DateTime<Utc>,
    pub payments_executed: u32,
    pub max_payments: Option<u32>,
    pub end_at: Option<DateTime<Utc>>,
    /// Prefunded balance still available for payments
    pub reserved: u64,
    pub cancelled: bool,
}

impl ScheduleState {
    pub fn max_reached(&self) -> bool {
        self.max_payments
            .is_some_and(|max| self.payments_executed >= max)
    }
}

/// One signer's approval of a proposal. At most one per (proposal, signer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub signer: String,
    pub signed_at: DateTime<Utc>,
}

/// Multi-signature proposal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiSigState {
    pub recipient: String,
    pub amount: u64,
    pub required_signatures: u32,
    pub authorized_signers: Vec<String>,
    pub signatures: Vec<SignatureRecord>,
    pub executed: bool,
}

impl MultiSigState {
    pub fn is_authorized(&self, signer: &str) -> bool {
        self.authorized_signers
            .iter()
            .any(|authorized| authorized == signer)
    }

    pub fn has_signed(&self, signer: &str) -> bool {
        self.signatures
            .iter()
            .any(|signature| signature.signer == signer)
    }

    pub fn signature_count(&self) -> u32 {
        self.signatures.len() as u32
    }
}

/// Tagged variant state: the five families share the record's state machine
/// and differ in trigger predicate and payout fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VariantState {
    Single(ClaimTicket),
    Batch(BatchState),
    Crowd(CrowdState),
    Recurring(ScheduleState),
    MultiSig(MultiSigState),
}

/// The unit of storage: one record plus the variant state it owns.
/// Destroyed together; sub-entities never outlive their record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowEntry {
    pub record: EscrowRecord,
    pub state: VariantState,
}

/// Append-only audit event, consumed read-only by notification and
/// dashboard collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowEvent {
    pub seq: u64,
    pub event_type: String,
    pub escrow_key: String,
    pub actor: Option<String>,
    pub amount: Option<u64>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
