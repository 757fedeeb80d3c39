use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::error::WorkflowError;

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_sequence() -> u64 {
    ID_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

macro_rules! declare_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{:06}"), next_sequence()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

declare_id!(
    /// Account identifier issued by the identity provider.
    UserId, "usr"
);
declare_id!(
    /// Student profile identifier, distinct from the owning user account.
    StudentId, "stu"
);
declare_id!(
    /// Tutor profile identifier, distinct from the owning user account.
    TutorId, "tut"
);
declare_id!(RequestId, "req");
declare_id!(ApplicationId, "app");
declare_id!(ClassId, "cls");
declare_id!(AssignId, "asg");
declare_id!(EscrowId, "esc");
declare_id!(LessonId, "les");
declare_id!(EntryId, "ent");
declare_id!(TxnId, "txn");
declare_id!(NotificationId, "ntf");

/// Caller role attached to every demand-side operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Student,
    Parent,
    Tutor,
    Admin,
}

impl ActorRole {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Parent => "parent",
            Self::Tutor => "tutor",
            Self::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Active,
    Matched,
    Rejected,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Matched => "matched",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Terminal states admit no further demand-side transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Matched | Self::Rejected | Self::Cancelled | Self::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ApplicationStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassStatus {
    Pending,
    Active,
    Ongoing,
    Completed,
    Cancelled,
}

impl ClassStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Ongoing => "ongoing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassMode {
    Online,
    Offline,
}

impl ClassMode {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

impl PaymentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Refunded => "refunded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Held,
    PartiallyReleased,
    Refunded,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Debit,
    Credit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One weekly recurrence slot: a day of week and a half-open time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyInterval {
    pub day: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WeeklyInterval {
    pub fn new(day: Weekday, start: NaiveTime, end: NaiveTime) -> Self {
        Self { day, start, end }
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.end <= self.start {
            return Err(WorkflowError::Validation(format!(
                "{} slot ends at {} which is not after its {} start",
                self.day, self.end, self.start
            )));
        }
        Ok(())
    }

    /// Half-open overlap on the same weekday; touching endpoints do not
    /// overlap.
    pub fn overlaps(&self, other: &WeeklyInterval) -> bool {
        self.day == other.day && self.start < other.end && other.start < self.end
    }
}

/// A demand posting from a student or parent, either addressed to one tutor
/// (direct) or open to the marketplace (`tutor_id == None`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRequest {
    pub id: RequestId,
    pub student_id: StudentId,
    pub tutor_id: Option<TutorId>,
    pub subject: String,
    pub education_level: String,
    pub mode: ClassMode,
    pub budget: Option<u64>,
    pub location: Option<String>,
    pub description: String,
    pub special_requirements: Option<String>,
    pub class_start_date: Option<DateTime<Utc>>,
    pub online_link: Option<String>,
    pub status: RequestStatus,
    pub expiry_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A tutor's offer to fulfil one open class request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TutorApplication {
    pub id: ApplicationId,
    pub tutor_id: TutorId,
    pub class_request_id: RequestId,
    pub status: ApplicationStatus,
    pub meeting_link: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub id: ClassId,
    pub tutor_id: TutorId,
    pub title: String,
    pub description: Option<String>,
    pub subject: String,
    pub education_level: String,
    pub mode: ClassMode,
    pub price: Option<u64>,
    pub status: ClassStatus,
    pub student_limit: u32,
    pub current_student_count: u32,
    pub location: Option<String>,
    pub online_link: Option<String>,
    pub class_start_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// The enrollment record binding one student to one class. At most one row
/// may exist per `(class_id, student_id)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassAssign {
    pub id: AssignId,
    pub class_id: ClassId,
    pub student_id: StudentId,
    pub approval_status: ApprovalStatus,
    pub payment_status: PaymentStatus,
    pub enrolled_at: DateTime<Utc>,
}

/// One teaching unit of a class; concrete dated occurrences reference it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: LessonId,
    pub class_id: ClassId,
    pub tutor_id: TutorId,
}

/// One concrete dated occurrence generated from a weekly rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: EntryId,
    pub lesson_id: LessonId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: UserId,
    pub balance: u64,
}

/// Append-only signed ledger row behind a wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: TxnId,
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub amount: i64,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

/// A held payment tied to one enrollment. `released_amount <= gross_amount`
/// always; the remaining refundable fraction is
/// `1 - released_amount / gross_amount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    pub id: EscrowId,
    pub class_assign_id: AssignId,
    pub gross_amount: u64,
    pub released_amount: u64,
    pub status: EscrowStatus,
}

impl Escrow {
    pub fn remaining_fraction(&self) -> f64 {
        if self.gross_amount == 0 {
            return 0.0;
        }
        1.0 - self.released_amount as f64 / self.gross_amount as f64
    }
}

/// Audit row recorded for every refund issued against an escrow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowRefund {
    pub escrow_id: EscrowId,
    pub amount: u64,
    pub fraction: f64,
    pub refunded_at: DateTime<Utc>,
}
