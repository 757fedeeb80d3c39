//! Collaborator contracts consumed by the workflow services.
//!
//! Wallet, escrow, and schedule generation take the storage session so their
//! effects enlist in the caller's atomic unit. Identity resolution is
//! read-only and runs before any write. Notification delivery is the one
//! best-effort collaborator: transactional code only *collects*
//! [`PendingNotification`] descriptors and [`dispatch_notifications`]
//! delivers them after commit, logging and swallowing failures.

use chrono::{DateTime, Datelike, Duration, Utc};

use super::domain::{
    ActorRole, ClassId, EntryId, Escrow, EscrowId, EscrowRefund, EscrowStatus, Lesson, LessonId,
    NotificationId, ScheduleEntry, StudentId, TransactionKind, TransactionStatus, TutorId, TxnId,
    UserId, WalletTransaction, WeeklyInterval,
};
use super::error::WorkflowError;
use super::store::StoreState;

/// Read-only profile and relationship lookups backed by the identity system.
pub trait IdentityResolver: Send + Sync {
    fn student_profile_for_user(&self, user: &UserId) -> Option<StudentId>;
    fn tutor_profile_for_user(&self, user: &UserId) -> Option<TutorId>;
    fn parent_child_link_exists(&self, parent: &UserId, student: &StudentId) -> bool;
    fn children_of(&self, parent: &UserId) -> Vec<StudentId>;
    fn user_for_student(&self, student: &StudentId) -> Option<UserId>;
    fn user_for_tutor(&self, tutor: &TutorId) -> Option<UserId>;
}

/// Resolves the student a demand-side operation targets: the actor's own
/// profile for a student, a verified linked child for a parent.
pub(crate) fn resolve_target_student(
    identity: &dyn IdentityResolver,
    actor: &UserId,
    role: ActorRole,
    student: Option<&StudentId>,
) -> Result<StudentId, WorkflowError> {
    match role {
        ActorRole::Student => identity
            .student_profile_for_user(actor)
            .ok_or(WorkflowError::NotFound("student profile")),
        ActorRole::Parent => {
            let child = student.ok_or_else(|| {
                WorkflowError::Validation("a parent must name the target student".to_string())
            })?;
            if identity.parent_child_link_exists(actor, child) {
                Ok(child.clone())
            } else {
                Err(WorkflowError::Unauthorized(
                    "you are not linked to this student",
                ))
            }
        }
        _ => Err(WorkflowError::Unauthorized(
            "only students and parents can act for a student",
        )),
    }
}

pub(crate) fn require_tutor(
    identity: &dyn IdentityResolver,
    actor: &UserId,
) -> Result<TutorId, WorkflowError> {
    identity
        .tutor_profile_for_user(actor)
        .ok_or(WorkflowError::Unauthorized("no tutor profile for this user"))
}

/// Notification categories emitted by the matching workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ClassRequestReceived,
    ClassRequestAccepted,
    ClassRequestRejected,
    ClassCreatedFromRequest,
    TutorApplicationReceived,
    TutorApplicationAccepted,
    TutorApplicationRejected,
    EscrowPaid,
    ClassEnrollmentSuccess,
}

/// A notification decided inside a transaction but delivered after commit.
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub user: UserId,
    pub kind: NotificationKind,
    pub message: String,
    pub related_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification transport unavailable: {0}")]
    Transport(String),
}

/// Best-effort delivery channel. Failures here must never surface to the
/// caller of a committed workflow.
pub trait NotificationSink: Send + Sync {
    fn notify(
        &self,
        user: &UserId,
        kind: NotificationKind,
        message: &str,
        related_id: &str,
    ) -> Result<NotificationId, NotificationError>;

    fn push_realtime(
        &self,
        user: &UserId,
        notification: &NotificationId,
    ) -> Result<(), NotificationError>;
}

/// Delivers collected notifications post-commit, logging failures and
/// continuing with the rest.
pub fn dispatch_notifications(sink: &dyn NotificationSink, pending: Vec<PendingNotification>) {
    for note in pending {
        match sink.notify(&note.user, note.kind, &note.message, &note.related_id) {
            Ok(id) => {
                if let Err(err) = sink.push_realtime(&note.user, &id) {
                    tracing::warn!(user = %note.user, error = %err, "realtime push failed");
                }
            }
            Err(err) => {
                tracing::warn!(user = %note.user, error = %err, "failed to deliver notification");
            }
        }
    }
}

/// Wallet operations enlisted in the caller's transaction via the session.
pub trait WalletGateway: Send + Sync {
    fn balance(&self, state: &StoreState, user: &UserId) -> Result<u64, WorkflowError>;

    /// Atomic check-and-debit: fails with `InsufficientFunds` without
    /// touching the balance, otherwise subtracts and appends a signed ledger
    /// row.
    fn debit(
        &self,
        state: &mut StoreState,
        user: &UserId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<TxnId, WorkflowError>;
}

/// Default wallet gateway over the store's own wallet tables.
#[derive(Debug, Default)]
pub struct LedgerWalletGateway;

impl WalletGateway for LedgerWalletGateway {
    fn balance(&self, state: &StoreState, user: &UserId) -> Result<u64, WorkflowError> {
        Ok(state.wallet(user).map(|w| w.balance).unwrap_or(0))
    }

    fn debit(
        &self,
        state: &mut StoreState,
        user: &UserId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<TxnId, WorkflowError> {
        let available = state.wallet(user).map(|w| w.balance).unwrap_or(0);
        if available < amount {
            return Err(WorkflowError::InsufficientFunds {
                required: amount,
                available,
            });
        }
        let wallet = state
            .wallet_mut(user)
            .expect("wallet exists after balance check");
        wallet.balance -= amount;

        let txn = WalletTransaction {
            id: TxnId::generate(),
            user_id: user.clone(),
            kind: TransactionKind::Debit,
            amount: -(amount as i64),
            status: TransactionStatus::Succeeded,
            created_at: now,
        };
        let id = txn.id.clone();
        state.record_wallet_transaction(txn);
        Ok(id)
    }
}

/// Escrow refund operations enlisted in the caller's transaction.
pub trait EscrowGateway: Send + Sync {
    /// Refunds everything still held by the escrow and closes it.
    fn refund(
        &self,
        state: &mut StoreState,
        escrow: &EscrowId,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError>;

    /// Refunds `fraction` of the gross amount; `fraction` must lie in
    /// `(0, 1]`.
    fn partial_refund(
        &self,
        state: &mut StoreState,
        escrow: &EscrowId,
        fraction: f64,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError>;
}

/// Default escrow gateway over the store's escrow table, recording an audit
/// row per refund.
#[derive(Debug, Default)]
pub struct LedgerEscrowGateway;

impl LedgerEscrowGateway {
    fn apply_refund(
        state: &mut StoreState,
        escrow_id: &EscrowId,
        fraction: f64,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        let escrow = state
            .escrow_mut(escrow_id)
            .ok_or(WorkflowError::NotFound("escrow"))?;
        let amount = refund_amount(escrow, fraction);
        escrow.status = EscrowStatus::Refunded;
        state.record_escrow_refund(EscrowRefund {
            escrow_id: escrow_id.clone(),
            amount,
            fraction,
            refunded_at: now,
        });
        Ok(())
    }
}

/// Rounds `gross * fraction`, capped at what the escrow still holds. For the
/// remaining-fraction refunds the withdrawal path issues, this reproduces
/// `gross - released` exactly.
fn refund_amount(escrow: &Escrow, fraction: f64) -> u64 {
    let refundable = escrow.gross_amount - escrow.released_amount;
    let amount = (escrow.gross_amount as f64 * fraction).round() as u64;
    amount.min(refundable)
}

impl EscrowGateway for LedgerEscrowGateway {
    fn refund(
        &self,
        state: &mut StoreState,
        escrow: &EscrowId,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        Self::apply_refund(state, escrow, 1.0, now)
    }

    fn partial_refund(
        &self,
        state: &mut StoreState,
        escrow: &EscrowId,
        fraction: f64,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(WorkflowError::Validation(format!(
                "refund fraction {fraction} is outside (0, 1]"
            )));
        }
        Self::apply_refund(state, escrow, fraction, now)
    }
}

/// Materializes concrete lesson occurrences from weekly rules inside the
/// caller's transaction.
pub trait ScheduleGenerator: Send + Sync {
    fn generate_from_weekly_rules(
        &self,
        state: &mut StoreState,
        class: &ClassId,
        tutor: &TutorId,
        start: DateTime<Utc>,
        rules: &[WeeklyInterval],
    ) -> Result<usize, WorkflowError>;
}

/// Default planner: one lesson and one dated entry per occurrence, covering
/// a fixed number of weeks from the start date.
#[derive(Debug, Clone, Copy)]
pub struct WeeklyOccurrencePlanner {
    pub horizon_weeks: u32,
}

impl Default for WeeklyOccurrencePlanner {
    fn default() -> Self {
        Self { horizon_weeks: 4 }
    }
}

impl ScheduleGenerator for WeeklyOccurrencePlanner {
    fn generate_from_weekly_rules(
        &self,
        state: &mut StoreState,
        class: &ClassId,
        tutor: &TutorId,
        start: DateTime<Utc>,
        rules: &[WeeklyInterval],
    ) -> Result<usize, WorkflowError> {
        let start_date = start.date_naive();
        let mut created = 0usize;

        for rule in rules {
            let offset = (rule.day.num_days_from_monday() as i64
                - start_date.weekday().num_days_from_monday() as i64)
                .rem_euclid(7);
            let first = start_date + Duration::days(offset);

            for week in 0..self.horizon_weeks {
                let date = first + Duration::weeks(week as i64);
                let lesson = Lesson {
                    id: LessonId::generate(),
                    class_id: class.clone(),
                    tutor_id: tutor.clone(),
                };
                let entry = ScheduleEntry {
                    id: EntryId::generate(),
                    lesson_id: lesson.id.clone(),
                    start_time: date.and_time(rule.start).and_utc(),
                    end_time: date.and_time(rule.end).and_utc(),
                };
                state.insert_lesson(lesson);
                state.insert_entry(entry);
                created += 1;
            }
        }

        Ok(created)
    }
}
