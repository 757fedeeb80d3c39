//! Duplicate-class detection.
//!
//! A proposed class conflicts with an existing one when the same tutor
//! already runs a live class for the same subject, level, and mode, at a
//! price within ten percent of the proposal, with at least one overlapping
//! weekly slot. Pure reads; the first hit wins.

use super::domain::{ClassMode, ClassStatus, TutorId, WeeklyInterval};
use super::error::WorkflowError;
use super::store::StoreState;

/// The would-be class, as derived from a request or an authoring draft.
#[derive(Debug, Clone)]
pub struct ProposedClass<'a> {
    pub tutor_id: &'a TutorId,
    pub subject: &'a str,
    pub education_level: &'a str,
    pub mode: ClassMode,
    pub price: Option<u64>,
    pub intervals: &'a [WeeklyInterval],
}

const LIVE_STATUSES: [ClassStatus; 3] =
    [ClassStatus::Pending, ClassStatus::Active, ClassStatus::Ongoing];

fn price_within_tolerance(candidate: Option<u64>, proposed: u64) -> bool {
    // Ten percent either way, endpoints included.
    candidate.is_some_and(|price| price.abs_diff(proposed) * 10 <= proposed)
}

/// Checks the proposal against the tutor's live classes, returning the first
/// offending overlap as a `Conflict`.
pub fn detect_duplicate_class(
    state: &StoreState,
    proposal: &ProposedClass<'_>,
) -> Result<(), WorkflowError> {
    let candidates = state.classes().filter(|class| {
        &class.tutor_id == proposal.tutor_id
            && class.subject == proposal.subject
            && class.education_level == proposal.education_level
            && class.mode == proposal.mode
            && class.deleted_at.is_none()
            && LIVE_STATUSES.contains(&class.status)
    });

    for candidate in candidates {
        if let Some(proposed_price) = proposal.price {
            if !price_within_tolerance(candidate.price, proposed_price) {
                continue;
            }
        }

        for existing in state.class_schedule(&candidate.id) {
            for proposed in proposal.intervals {
                if proposed.overlaps(existing) {
                    return Err(WorkflowError::Conflict {
                        class_id: candidate.id.0.clone(),
                        day: proposed.day,
                        start: proposed.start,
                        end: proposed.end,
                    });
                }
            }
        }
    }

    Ok(())
}
