//! Error types for the escrow engine
//!
//! Every distinct reportable condition maps to its own variant; nothing is
//! coalesced into a catch-all. [`ErrorKind`] groups variants into the broad
//! categories callers use to decide whether an operation is retryable.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Broad classification of an [`EscrowError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected before any mutation
    Validation,
    /// Conflicts with existing state (duplicates, replays), state untouched
    Conflict,
    /// A release condition is not (yet) satisfied; retryable once it changes
    ConditionNotMet,
    /// Unknown id, claim code, or signer
    NotFound,
    /// The injected transfer capability failed; the transition was rolled back
    Gateway,
    /// An operation not valid for the escrow's current lifecycle state
    State,
    /// An internal invariant was violated
    Internal,
}

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Amount is zero or exceeds the configured maximum
    #[error("invalid amount: {0}")]
    InvalidAmount(u64),

    /// Malformed input not covered by a more specific variant
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Batch creation with no recipients
    #[error("recipient list is empty")]
    RecipientListEmpty,

    /// Batch creation with recipient/amount/claim-code lists of unequal length
    #[error("recipient, amount, and claim code lists differ in length")]
    LengthMismatch,

    /// Attached funding does not cover the amount to reserve
    #[error("insufficient funding: required {required}, provided {provided}")]
    InsufficientFunding { required: u64, provided: u64 },

    /// Claim code collides with an existing escrow or campaign entry
    #[error("claim code already in use: {0}")]
    DuplicateClaimCode(String),

    /// Campaign code collides with an existing campaign
    #[error("campaign code already in use: {0}")]
    DuplicateCampaign(String),

    /// Caller-supplied escrow id collides with an existing escrow
    #[error("escrow id already in use: {0}")]
    DuplicateEscrow(String),

    /// Unknown escrow id, campaign code, or claim code
    #[error("not found: {0}")]
    NotFound(String),

    /// Signer is not on the proposal's authorized list
    #[error("{0} is not an authorized signer")]
    NotAuthorizedSigner(String),

    /// Caller is not permitted to perform this operation
    #[error("{0} is not permitted to perform this operation")]
    Unauthorized(String),

    /// Ticket was already claimed; the claimed flag is write-once
    #[error("ticket already claimed: {0}")]
    AlreadyClaimed(String),

    /// Signer already signed this proposal
    #[error("{0} has already signed")]
    AlreadySigned(String),

    /// Proposal was already executed
    #[error("proposal already executed")]
    AlreadyExecuted,

    /// Crowd pool was already distributed to its recipient
    #[error("pool already distributed")]
    AlreadyDistributed,

    /// Proposal was cancelled by its creator
    #[error("proposal has been cancelled")]
    ProposalCancelled,

    /// Time lock has not elapsed yet
    #[error("time-locked until {unlock_at}")]
    TimeLocked { unlock_at: DateTime<Utc> },

    /// Expiration deadline has passed
    #[error("escrow has expired")]
    Expired,

    /// Refund requested before the expiration deadline
    #[error("escrow has not expired yet")]
    NotExpired,

    /// Next scheduled payment is not due yet
    #[error("next payment not due until {next_due_at}")]
    NotDue { next_due_at: DateTime<Utc> },

    /// Schedule cannot execute payments in its current state
    #[error("schedule inactive: {0}")]
    ScheduleInactive(String),

    /// Campaign completion percentage below the declared threshold
    #[error("threshold not reached: {reached}% of required {required}%")]
    ThresholdNotReached { reached: u8, required: u8 },

    /// Proposal signature count below the required quorum
    #[error("insufficient signatures: {have} of {required}")]
    InsufficientSignatures { have: u32, required: u32 },

    /// Provided secret does not hash to the declared secret hash
    #[error("invalid secret")]
    InvalidSecret,

    /// Lifecycle transition not permitted from the current status
    #[error("invalid state transition: {from} -> {to}")]
    StateTransition { from: String, to: String },

    /// Transfer gateway failure; the attempted transition was rolled back
    #[error("transfer gateway failure: {0}")]
    Gateway(String),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl EscrowError {
    /// Classify this error into its broad [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAmount(_)
            | Self::InvalidInput(_)
            | Self::RecipientListEmpty
            | Self::LengthMismatch
            | Self::InsufficientFunding { .. }
            | Self::Unauthorized(_) => ErrorKind::Validation,

            Self::DuplicateClaimCode(_)
            | Self::DuplicateCampaign(_)
            | Self::DuplicateEscrow(_)
            | Self::AlreadyClaimed(_)
            | Self::AlreadySigned(_)
            | Self::AlreadyExecuted
            | Self::AlreadyDistributed => ErrorKind::Conflict,

            Self::TimeLocked { .. }
            | Self::NotDue { .. }
            | Self::NotExpired
            | Self::ThresholdNotReached { .. }
            | Self::InsufficientSignatures { .. }
            | Self::InvalidSecret => ErrorKind::ConditionNotMet,

            Self::NotFound(_) | Self::NotAuthorizedSigner(_) => ErrorKind::NotFound,

            Self::Gateway(_) => ErrorKind::Gateway,

            Self::Expired
            | Self::ProposalCancelled
            | Self::ScheduleInactive(_)
            | Self::StateTransition { .. } => ErrorKind::State,

            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same call later can succeed without other input.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ConditionNotMet | ErrorKind::Gateway)
    }

    /// Create an invalid-input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a gateway error
    pub fn gateway<S: Into<String>>(msg: S) -> Self {
        Self::Gateway(msg.into())
    }

    /// Create a schedule-inactive error
    pub fn schedule_inactive<S: Into<String>>(msg: S) -> Self {
        Self::ScheduleInactive(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(from: S, to: S) -> Self {
        Self::StateTransition {
            from: from.into(),
            to: to.into(),
        }
    }
}
