use chrono::{NaiveTime, Weekday};

use super::store::StoreError;

/// Closed failure taxonomy shared by every workflow service.
///
/// Validation and authorization failures are raised before any write; once a
/// storage unit is entered, any error rolls the whole unit back and is
/// returned to the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("not authorized: {0}")]
    Unauthorized(&'static str),

    #[error("operation not allowed in current status '{status}'")]
    InvalidState { status: &'static str },

    #[error("duplicate: {0}")]
    Duplicate(&'static str),

    #[error(
        "an equivalent class '{class_id}' already covers {day} {start} to {end}"
    )]
    Conflict {
        class_id: String,
        day: Weekday,
        start: NaiveTime,
        end: NaiveTime,
    },

    #[error("wallet balance {available} cannot cover {required}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("class has reached its student limit")]
    Capacity,

    #[error("invalid input: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
