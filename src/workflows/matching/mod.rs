//! Enrollment matching and escrow settlement.
//!
//! Four loosely-coupled aggregates move through this module: a class request
//! (demand), a tutor application (supply), a class enrollment, and the
//! escrow-backed wallet ledger behind it. The services keep them consistent
//! by funnelling every multi-row write through one storage session and by
//! deferring best-effort side effects (notifications) until after commit.

pub mod applications;
pub mod classes;
pub mod conflict;
pub mod domain;
pub mod enrollment;
pub mod error;
pub mod gateways;
pub mod requests;
pub mod store;
pub mod withdrawal;

#[cfg(test)]
mod tests;

pub use applications::{ApplicationLedger, ApplicationOffer, TutorApplicationView};
pub use classes::{ClassCatalog, ClassView, RecurringClassDraft, StudentEnrollmentView};
pub use conflict::{detect_duplicate_class, ProposedClass};
pub use domain::{
    ActorRole, ApplicationStatus, ApprovalStatus, Class, ClassAssign, ClassMode, ClassRequest,
    ClassStatus, EscrowStatus, PaymentStatus, RequestStatus, WeeklyInterval,
};
pub use enrollment::{EnrolledClassView, EnrollmentTransactor, EnrollmentView};
pub use error::WorkflowError;
pub use gateways::{
    dispatch_notifications, EscrowGateway, IdentityResolver, LedgerEscrowGateway,
    LedgerWalletGateway, NotificationKind, NotificationSink, PendingNotification,
    ScheduleGenerator, WalletGateway, WeeklyOccurrencePlanner,
};
pub use requests::{ClassRequestDraft, ClassRequestPatch, ClassRequestView, MarketplaceFilter, RequestLedger};
pub use store::{run_transaction, MemoryStore, StoreError, StoreState, WorkflowStore};
pub use withdrawal::WithdrawalCompensator;
