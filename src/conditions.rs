//! Condition evaluator: stateless release predicates
//!
//! Each predicate is a pure function returning allow/deny plus a typed
//! reason. Conditions declared on an escrow combine by conjunction; an
//! undeclared axis is always-allow. [`ReleaseConditions`] bundles the
//! per-ticket axes (time lock, expiration, secret).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::EscrowError;

/// Outcome of a single predicate or a conjunction of predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOutcome {
    Allow,
    Deny(DenyReason),
}

impl ConditionOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Typed reason a predicate denied release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    TimeLocked { unlock_at: DateTime<Utc> },
    Expired,
    InvalidSecret,
    ThresholdNotReached { reached: u8, required: u8 },
}

impl From<DenyReason> for EscrowError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::TimeLocked { unlock_at } => EscrowError::TimeLocked { unlock_at },
            DenyReason::Expired => EscrowError::Expired,
            DenyReason::InvalidSecret => EscrowError::InvalidSecret,
            DenyReason::ThresholdNotReached { reached, required } => {
                EscrowError::ThresholdNotReached { reached, required }
            }
        }
    }
}

/// Allow iff `now >= unlock_at`. No time lock declared is always-allow.
pub fn time_lock(now: DateTime<Utc>, unlock_at: Option<DateTime<Utc>>) -> ConditionOutcome {
    match unlock_at {
        Some(unlock_at) if now < unlock_at => {
            ConditionOutcome::Deny(DenyReason::TimeLocked { unlock_at })
        }
        _ => ConditionOutcome::Allow,
    }
}

/// Allow iff no expiry is declared or `now <= expires_at`.
pub fn expiration(now: DateTime<Utc>, expires_at: Option<DateTime<Utc>>) -> ConditionOutcome {
    match expires_at {
        Some(expires_at) if now > expires_at => ConditionOutcome::Deny(DenyReason::Expired),
        _ => ConditionOutcome::Allow,
    }
}

/// Allow iff `pct == 0` or `floor(claimed * 100 / total) >= pct`.
///
/// The integer truncation is deliberate: 2 of 3 is 66%, not 67%, and the
/// truncated value decides exactly which claim crosses the threshold.
pub fn threshold_reached(claimed: u64, total: u64, pct: u8) -> ConditionOutcome {
    if pct == 0 {
        return ConditionOutcome::Allow;
    }
    let reached = if total == 0 {
        0
    } else {
        (claimed * 100 / total).min(100) as u8
    };
    if reached >= pct {
        ConditionOutcome::Allow
    } else {
        ConditionOutcome::Deny(DenyReason::ThresholdNotReached {
            reached,
            required: pct,
        })
    }
}

/// Hash a claim secret the way escrows store it.
pub fn hash_secret(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    digest.into()
}

/// Constant-time comparison of `sha256(provided)` against the stored hash.
pub fn secret_matches(expected: &[u8; 32], provided: &str) -> bool {
    constant_time_eq(expected, &hash_secret(provided))
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// The per-ticket release condition axes. Unset axes are always-allow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseConditions {
    pub unlock_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub secret_hash: Option<[u8; 32]>,
}

impl ReleaseConditions {
    /// Full conjunction: Expiration ∧ TimeLock ∧ SecretRequired.
    ///
    /// Denial order matches the reporting order of claim operations:
    /// expired escrows report Expired before TimeLocked before InvalidSecret.
    pub fn evaluate(&self, now: DateTime<Utc>, provided_secret: Option<&str>) -> ConditionOutcome {
        if let ConditionOutcome::Deny(reason) = expiration(now, self.expires_at) {
            return ConditionOutcome::Deny(reason);
        }
        if let ConditionOutcome::Deny(reason) = time_lock(now, self.unlock_at) {
            return ConditionOutcome::Deny(reason);
        }
        if let Some(expected) = &self.secret_hash {
            let matched = provided_secret
                .map(|secret| secret_matches(expected, secret))
                .unwrap_or(false);
            if !matched {
                return ConditionOutcome::Deny(DenyReason::InvalidSecret);
            }
        }
        ConditionOutcome::Allow
    }

    /// Read-only preview: TimeLock ∧ Expiration, ignoring the secret axis.
    pub fn preview(&self, now: DateTime<Utc>) -> ConditionOutcome {
        if let ConditionOutcome::Deny(reason) = expiration(now, self.expires_at) {
            return ConditionOutcome::Deny(reason);
        }
        time_lock(now, self.unlock_at)
    }

    /// Whether the escrow's expiry has passed (refund eligibility).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(
            expiration(now, self.expires_at),
            ConditionOutcome::Deny(DenyReason::Expired)
        )
    }
}
