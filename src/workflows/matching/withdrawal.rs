//! The withdrawal compensator: unwinds an enrollment and its money.
//!
//! Refunds whatever the escrows still hold, removes the enrollment,
//! decrements class occupancy, and cancels an emptied class together with
//! its not-yet-started occurrences. One atomic unit; any failure unwinds
//! everything.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::MatchingConfig;

use super::domain::{ActorRole, ClassId, ClassStatus, EscrowStatus, PaymentStatus, StudentId, UserId};
use super::error::WorkflowError;
use super::gateways::{resolve_target_student, EscrowGateway, IdentityResolver};
use super::store::{run_transaction, WorkflowStore};

pub struct WithdrawalCompensator<S> {
    store: Arc<S>,
    identity: Arc<dyn IdentityResolver>,
    escrow: Arc<dyn EscrowGateway>,
    config: MatchingConfig,
}

impl<S: WorkflowStore> WithdrawalCompensator<S> {
    pub fn new(
        store: Arc<S>,
        identity: Arc<dyn IdentityResolver>,
        escrow: Arc<dyn EscrowGateway>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            store,
            identity,
            escrow,
            config,
        }
    }

    /// Withdraws the target student from a class.
    ///
    /// Escrows still `Held` refund in full; `PartiallyReleased` escrows
    /// refund exactly their remaining fraction; settled escrows are left
    /// alone. When the last student leaves, the class is cancelled and its
    /// future occurrences are purged, entries before lessons.
    pub fn withdraw(
        &self,
        actor: &UserId,
        role: ActorRole,
        class_id: &ClassId,
        student: Option<&StudentId>,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        let student = resolve_target_student(self.identity.as_ref(), actor, role, student)?;

        run_transaction(
            self.store.as_ref(),
            self.config.transaction_attempts,
            |state| {
                let assign = state
                    .assign_for(class_id, &student)
                    .ok_or(WorkflowError::NotFound("enrollment for this class"))?
                    .clone();
                let class = state
                    .class(class_id)
                    .ok_or(WorkflowError::NotFound("class"))?;
                if matches!(class.status, ClassStatus::Completed | ClassStatus::Cancelled) {
                    return Err(WorkflowError::InvalidState {
                        status: class.status.label(),
                    });
                }

                for escrow_id in state.escrow_ids_for_assign(&assign.id) {
                    let escrow = state
                        .escrow(&escrow_id)
                        .expect("escrow listed by the session")
                        .clone();
                    match escrow.status {
                        EscrowStatus::Held => {
                            self.escrow.refund(state, &escrow_id, now)?;
                        }
                        EscrowStatus::PartiallyReleased => {
                            let remaining = escrow.remaining_fraction();
                            if remaining > 0.0 {
                                self.escrow.partial_refund(state, &escrow_id, remaining, now)?;
                            }
                        }
                        EscrowStatus::Refunded | EscrowStatus::Released => {}
                    }
                }

                state
                    .assign_mut(&assign.id)
                    .expect("enrollment loaded earlier in this unit")
                    .payment_status = PaymentStatus::Refunded;
                state.remove_assign(&assign.id);

                let class = state
                    .class_mut(class_id)
                    .expect("class loaded earlier in this unit");
                class.current_student_count = class.current_student_count.saturating_sub(1);
                let emptied = class.current_student_count == 0;
                if emptied {
                    class.status = ClassStatus::Cancelled;
                }

                if emptied {
                    let future = state.future_entries_for_class(class_id, now);
                    let mut lesson_ids: Vec<_> =
                        future.iter().map(|(_, lesson)| lesson.clone()).collect();
                    lesson_ids.sort();
                    lesson_ids.dedup();

                    // Entries reference lessons, so they go first.
                    for (entry_id, _) in &future {
                        state.remove_entry(entry_id);
                    }
                    for lesson_id in &lesson_ids {
                        state.remove_lesson(lesson_id);
                    }
                }

                Ok(())
            },
        )
    }
}
