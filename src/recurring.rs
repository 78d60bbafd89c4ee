//! RecurringSchedule: time-scheduled recurring release
//!
//! A prefunded schedule pays a fixed amount per interval. An external
//! scheduler calls `execute_pending` at any cadence it likes: due dates
//! advance by exactly one interval per executed payment, so missed
//! intervals never compound extra payments and at most one payment
//! executes per call.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::EscrowResult;
use crate::engine::EscrowEngine;
use crate::error::EscrowError;
use crate::models::{
    EscrowEntry, EscrowRecord, EscrowStatus, EscrowVariant, ScheduleState, VariantState,
};

/// Schedule creation request
#[derive(Debug, Clone)]
pub struct CreateScheduleRequest {
    pub sender: String,
    pub id: String,
    pub recipient: String,
    pub amount_per_payment: u64,
    pub interval_seconds: u64,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub max_payments: Option<u32>,
    /// Reserved balance payments draw from; can be topped up later
    pub prefund: u64,
}

/// Summary of one executed scheduled payment
#[derive(Debug, Clone)]
pub struct SchedulePayment {
    pub payment_number: u32,
    pub amount: u64,
    pub next_due_at: DateTime<Utc>,
    pub remaining_reserved: u64,
}

impl EscrowEngine {
    /// Create a recurring schedule. If `start_at` is not in the future the
    /// first payment executes as part of creation; a shortfall there is
    /// logged and the schedule stays active pending top-up.
    pub async fn create_schedule(
        &self,
        request: CreateScheduleRequest,
    ) -> EscrowResult<EscrowRecord> {
        info!(id = %request.id, interval = request.interval_seconds, "creating payment schedule");

        self.validate_amount(request.amount_per_payment)?;
        if request.interval_seconds < self.config.min_interval_seconds {
            return Err(EscrowError::invalid_input(format!(
                "interval must be at least {} seconds",
                self.config.min_interval_seconds
            )));
        }
        if i64::try_from(request.interval_seconds).is_err() {
            return Err(EscrowError::invalid_input("interval exceeds representable range"));
        }
        if request.sender.trim().is_empty() || request.recipient.trim().is_empty() {
            return Err(EscrowError::invalid_input("sender and recipient are required"));
        }
        if request.id.trim().is_empty() {
            return Err(EscrowError::invalid_input("schedule id is required"));
        }
        if request.max_payments == Some(0) {
            return Err(EscrowError::invalid_input("max payments must be at least 1"));
        }
        if let Some(end_at) = request.end_at {
            if end_at <= request.start_at {
                return Err(EscrowError::invalid_input("end must be after start"));
            }
        }

        let now = self.now();
        let mut record = EscrowRecord::new(
            request.id.clone(),
            EscrowVariant::RecurringSchedule,
            request.sender,
            request.prefund,
            request.end_at,
            now,
        );
        record.status = EscrowStatus::Active;

        let entry = EscrowEntry {
            record: record.clone(),
            state: VariantState::Recurring(ScheduleState {
                recipient: request.recipient,
                amount_per_payment: request.amount_per_payment,
                interval_seconds: request.interval_seconds,
                next_due_at: request.start_at,
                payments_executed: 0,
                max_payments: request.max_payments,
                end_at: request.end_at,
                reserved: request.prefund,
                cancelled: false,
            }),
        };
        self.ledger.insert(entry).await?;

        self.record_event(
            "schedule.created",
            &record.key,
            Some(&record.sender),
            Some(request.prefund),
            None,
        )
        .await;

        if request.start_at <= now {
            if let Err(err) = self.execute_pending(&request.id).await {
                warn!(id = %request.id, %err, "first scheduled payment deferred");
            }
        }

        self.snapshot(&request.id).await.map(|entry| entry.record)
    }

    /// Execute the next due payment, if any. At most one payment per call;
    /// the due date advances by exactly one interval, never resets to now.
    pub async fn execute_pending(&self, id: &str) -> EscrowResult<SchedulePayment> {
        let handle = self.ledger.get(id).await?;
        let mut guard = handle.lock().await;
        let entry = &mut *guard;

        let VariantState::Recurring(schedule) = &mut entry.state else {
            return Err(EscrowError::NotFound(id.to_string()));
        };
        if schedule.cancelled || entry.record.status == EscrowStatus::Cancelled {
            return Err(EscrowError::schedule_inactive("schedule cancelled"));
        }
        if entry.record.status.is_terminal() {
            return Err(EscrowError::schedule_inactive("schedule has ended"));
        }
        if schedule.max_reached() {
            return Err(EscrowError::schedule_inactive("maximum payments reached"));
        }

        let now = self.now();
        if schedule.end_at.is_some_and(|end_at| now > end_at) {
            // Past its end: return the unexecuted reserve and close out.
            let sender = entry.record.sender.clone();
            let leftover = schedule.reserved;
            if leftover > 0 {
                self.pay(&mut entry.record, &sender, leftover).await?;
                schedule.reserved = 0;
            }
            entry.record.transition(EscrowStatus::Completed, now)?;
            self.record_event("schedule.ended", id, None, Some(leftover), None)
                .await;
            return Err(EscrowError::schedule_inactive("schedule has ended"));
        }

        if now < schedule.next_due_at {
            return Err(EscrowError::NotDue {
                next_due_at: schedule.next_due_at,
            });
        }
        if schedule.reserved < schedule.amount_per_payment {
            // Reported, not fatal: the schedule stays active pending top-up.
            return Err(EscrowError::schedule_inactive(
                "insufficient reserved balance",
            ));
        }

        let recipient = schedule.recipient.clone();
        let amount = schedule.amount_per_payment;
        self.pay(&mut entry.record, &recipient, amount).await?;
        schedule.reserved -= amount;
        schedule.payments_executed += 1;
        schedule.next_due_at += Duration::seconds(schedule.interval_seconds as i64);

        if schedule.max_reached() {
            entry.record.transition(EscrowStatus::Completed, now)?;
        }

        let payment = SchedulePayment {
            payment_number: schedule.payments_executed,
            amount,
            next_due_at: schedule.next_due_at,
            remaining_reserved: schedule.reserved,
        };
        info!(id, payment_number = payment.payment_number, amount, "scheduled payment executed");
        // Recorded before the entry lock is released so event order matches
        // payment order for this schedule.
        self.record_event("schedule.payment", id, Some(&recipient), Some(amount), None)
            .await;
        drop(guard);

        Ok(payment)
    }

    /// Add to the reserved balance of an active schedule. Creator only.
    pub async fn top_up(&self, id: &str, caller: &str, amount: u64) -> EscrowResult<EscrowRecord> {
        let handle = self.ledger.get(id).await?;
        let mut guard = handle.lock().await;
        let entry = &mut *guard;

        let VariantState::Recurring(schedule) = &mut entry.state else {
            return Err(EscrowError::NotFound(id.to_string()));
        };
        if caller != entry.record.sender {
            return Err(EscrowError::Unauthorized(caller.to_string()));
        }
        if schedule.cancelled || entry.record.status.is_terminal() {
            return Err(EscrowError::schedule_inactive("schedule has ended"));
        }
        self.validate_amount(amount)?;

        schedule.reserved = schedule
            .reserved
            .checked_add(amount)
            .ok_or_else(|| EscrowError::invalid_input("top-up overflows reserve"))?;
        entry.record.total_amount = entry
            .record
            .total_amount
            .checked_add(amount)
            .ok_or_else(|| EscrowError::invalid_input("top-up overflows reserve"))?;
        entry.record.updated_at = self.now();

        let snapshot = entry.record.clone();
        info!(id, amount, "schedule topped up");
        self.record_event("schedule.topped_up", id, Some(caller), Some(amount), None)
            .await;
        drop(guard);

        Ok(snapshot)
    }

    /// Cancel a schedule and refund the unexecuted reserve. Creator only.
    pub async fn cancel_schedule(&self, id: &str, caller: &str) -> EscrowResult<EscrowRecord> {
        let handle = self.ledger.get(id).await?;
        let mut guard = handle.lock().await;
        let entry = &mut *guard;

        let VariantState::Recurring(schedule) = &mut entry.state else {
            return Err(EscrowError::NotFound(id.to_string()));
        };
        if caller != entry.record.sender {
            return Err(EscrowError::Unauthorized(caller.to_string()));
        }
        if entry.record.status.is_terminal() {
            return Err(EscrowError::state_transition(
                format!("{:?}", entry.record.status),
                "Cancelled".to_string(),
            ));
        }

        let now = self.now();
        let sender = entry.record.sender.clone();
        let leftover = schedule.reserved;
        if leftover > 0 {
            self.pay(&mut entry.record, &sender, leftover).await?;
            schedule.reserved = 0;
        }
        schedule.cancelled = true;
        entry.record.transition(EscrowStatus::Cancelled, now)?;

        let snapshot = entry.record.clone();
        info!(id, leftover, "schedule cancelled");
        self.record_event("schedule.cancelled", id, Some(caller), Some(leftover), None)
            .await;
        drop(guard);

        Ok(snapshot)
    }
}
