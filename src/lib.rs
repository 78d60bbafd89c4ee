//! # Escrow Core
//!
//! A programmable value-escrow engine. Funds are reserved in custody on
//! behalf of a sender and released to recipients when a programmable
//! condition is met. Five release families are supported:
//!
//! - **SingleConditional**: one recipient, claim code plus optional time
//!   lock, expiration, and secret hash
//! - **BatchThreshold**: many recipients with individual claim codes; once
//!   a claimed percentage crosses the campaign threshold the remaining
//!   legs cascade automatically
//! - **CrowdTarget**: many contributors fund a pool that pays out to one
//!   recipient the moment the target is reached
//! - **RecurringSchedule**: a prefunded schedule paying a fixed amount per
//!   interval, driven by an external scheduler
//! - **MultiSigApproval**: a proposal that releases once a quorum of
//!   authorized signers approves
//!
//! The engine is storage- and transport-agnostic: money movement goes
//! through the injected [`gateway::TransferGateway`] and time through the
//! injected [`clock::Clock`]. Releases are at-most-once; a gateway failure
//! rolls the attempted transition back so the caller can retry.

pub mod clock;
pub mod conditions;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod models;

pub mod batch;
pub mod crowd;
pub mod multisig;
pub mod recurring;
pub mod single;

pub use engine::{EngineConfig, EscrowEngine};
pub use error::{ErrorKind, EscrowError};

/// Result type used throughout the crate
pub type EscrowResult<T> = Result<T, EscrowError>;
