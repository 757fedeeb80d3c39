//! Storage session and transaction discipline.
//!
//! Every multi-row write runs inside [`WorkflowStore::transaction`]: the
//! closure receives the mutable session state and either commits as a whole
//! or leaves no trace. There is no ambient change tracking; repositories are
//! plain methods on [`StoreState`] reached only through a session closure.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::domain::{
    ApplicationId, AssignId, Class, ClassAssign, ClassId, ClassRequest, EntryId, Escrow,
    EscrowId, EscrowRefund, Lesson, LessonId, RequestId, ScheduleEntry, StudentId,
    TutorApplication, TutorId, TxnId, UserId, Wallet, WalletTransaction, WeeklyInterval,
};
use super::error::WorkflowError;

/// Infrastructure-level storage failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient faults are safe to retry from a fresh snapshot.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// The full relational picture of the matching workflow, one typed table per
/// aggregate. Child schedule rows are keyed by their owning aggregate.
#[derive(Debug, Default, Clone)]
pub struct StoreState {
    requests: BTreeMap<RequestId, ClassRequest>,
    request_schedules: BTreeMap<RequestId, Vec<WeeklyInterval>>,
    applications: BTreeMap<ApplicationId, TutorApplication>,
    classes: BTreeMap<ClassId, Class>,
    class_schedules: BTreeMap<ClassId, Vec<WeeklyInterval>>,
    assigns: BTreeMap<AssignId, ClassAssign>,
    lessons: BTreeMap<LessonId, Lesson>,
    schedule_entries: BTreeMap<EntryId, ScheduleEntry>,
    wallets: BTreeMap<UserId, Wallet>,
    wallet_transactions: BTreeMap<TxnId, WalletTransaction>,
    escrows: BTreeMap<EscrowId, Escrow>,
    escrow_refunds: Vec<EscrowRefund>,
}

impl StoreState {
    // --- class requests ---

    pub fn insert_request(&mut self, request: ClassRequest) {
        self.requests.insert(request.id.clone(), request);
    }

    pub fn request(&self, id: &RequestId) -> Option<&ClassRequest> {
        self.requests.get(id)
    }

    pub fn request_mut(&mut self, id: &RequestId) -> Option<&mut ClassRequest> {
        self.requests.get_mut(id)
    }

    pub fn requests(&self) -> impl Iterator<Item = &ClassRequest> {
        self.requests.values()
    }

    /// Replaces the full preference set for a request as one unit.
    pub fn set_request_schedule(&mut self, id: &RequestId, intervals: Vec<WeeklyInterval>) {
        self.request_schedules.insert(id.clone(), intervals);
    }

    pub fn request_schedule(&self, id: &RequestId) -> &[WeeklyInterval] {
        self.request_schedules
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    // --- tutor applications ---

    pub fn insert_application(&mut self, application: TutorApplication) {
        self.applications.insert(application.id.clone(), application);
    }

    pub fn application(&self, id: &ApplicationId) -> Option<&TutorApplication> {
        self.applications.get(id)
    }

    pub fn application_mut(&mut self, id: &ApplicationId) -> Option<&mut TutorApplication> {
        self.applications.get_mut(id)
    }

    pub fn remove_application(&mut self, id: &ApplicationId) -> Option<TutorApplication> {
        self.applications.remove(id)
    }

    /// Any prior application by this tutor on this request, whatever its
    /// status, blocks a new submission.
    pub fn has_application(&self, tutor: &TutorId, request: &RequestId) -> bool {
        self.applications
            .values()
            .any(|a| &a.tutor_id == tutor && &a.class_request_id == request)
    }

    pub fn applications_for_request(&self, request: &RequestId) -> Vec<&TutorApplication> {
        self.applications
            .values()
            .filter(|a| &a.class_request_id == request)
            .collect()
    }

    pub fn applications_for_tutor(&self, tutor: &TutorId) -> Vec<&TutorApplication> {
        self.applications
            .values()
            .filter(|a| &a.tutor_id == tutor)
            .collect()
    }

    // --- classes ---

    pub fn insert_class(&mut self, class: Class) {
        self.classes.insert(class.id.clone(), class);
    }

    pub fn class(&self, id: &ClassId) -> Option<&Class> {
        self.classes.get(id)
    }

    pub fn class_mut(&mut self, id: &ClassId) -> Option<&mut Class> {
        self.classes.get_mut(id)
    }

    pub fn classes(&self) -> impl Iterator<Item = &Class> {
        self.classes.values()
    }

    pub fn set_class_schedule(&mut self, id: &ClassId, intervals: Vec<WeeklyInterval>) {
        self.class_schedules.insert(id.clone(), intervals);
    }

    pub fn class_schedule(&self, id: &ClassId) -> &[WeeklyInterval] {
        self.class_schedules
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    // --- enrollments ---

    /// Inserts an enrollment, enforcing the hard uniqueness invariant on
    /// `(class_id, student_id)`.
    pub fn insert_assign(&mut self, assign: ClassAssign) -> Result<(), WorkflowError> {
        if self
            .assign_for(&assign.class_id, &assign.student_id)
            .is_some()
        {
            return Err(WorkflowError::Duplicate(
                "student is already enrolled in this class",
            ));
        }
        self.assigns.insert(assign.id.clone(), assign);
        Ok(())
    }

    pub fn assign_for(&self, class: &ClassId, student: &StudentId) -> Option<&ClassAssign> {
        self.assigns
            .values()
            .find(|a| &a.class_id == class && &a.student_id == student)
    }

    pub fn assign_mut(&mut self, id: &AssignId) -> Option<&mut ClassAssign> {
        self.assigns.get_mut(id)
    }

    pub fn remove_assign(&mut self, id: &AssignId) -> Option<ClassAssign> {
        self.assigns.remove(id)
    }

    pub fn assigns_for_class(&self, class: &ClassId) -> Vec<&ClassAssign> {
        self.assigns
            .values()
            .filter(|a| &a.class_id == class)
            .collect()
    }

    pub fn assigns_for_student(&self, student: &StudentId) -> Vec<&ClassAssign> {
        self.assigns
            .values()
            .filter(|a| &a.student_id == student)
            .collect()
    }

    // --- lessons and schedule entries ---

    pub fn insert_lesson(&mut self, lesson: Lesson) {
        self.lessons.insert(lesson.id.clone(), lesson);
    }

    pub fn lesson(&self, id: &LessonId) -> Option<&Lesson> {
        self.lessons.get(id)
    }

    pub fn lessons_for_class(&self, class: &ClassId) -> Vec<&Lesson> {
        self.lessons
            .values()
            .filter(|l| &l.class_id == class)
            .collect()
    }

    pub fn remove_lesson(&mut self, id: &LessonId) -> Option<Lesson> {
        self.lessons.remove(id)
    }

    pub fn insert_entry(&mut self, entry: ScheduleEntry) {
        self.schedule_entries.insert(entry.id.clone(), entry);
    }

    pub fn remove_entry(&mut self, id: &EntryId) -> Option<ScheduleEntry> {
        self.schedule_entries.remove(id)
    }

    pub fn entries_for_class(&self, class: &ClassId) -> Vec<&ScheduleEntry> {
        self.schedule_entries
            .values()
            .filter(|e| {
                self.lessons
                    .get(&e.lesson_id)
                    .is_some_and(|l| &l.class_id == class)
            })
            .collect()
    }

    /// Not-yet-started occurrences of a class, paired with the lesson they
    /// reference (entries must be deleted before their lessons).
    pub fn future_entries_for_class(
        &self,
        class: &ClassId,
        now: DateTime<Utc>,
    ) -> Vec<(EntryId, LessonId)> {
        self.schedule_entries
            .values()
            .filter(|e| e.start_time > now)
            .filter(|e| {
                self.lessons
                    .get(&e.lesson_id)
                    .is_some_and(|l| &l.class_id == class)
            })
            .map(|e| (e.id.clone(), e.lesson_id.clone()))
            .collect()
    }

    // --- wallets and the signed ledger ---

    pub fn upsert_wallet(&mut self, wallet: Wallet) {
        self.wallets.insert(wallet.user_id.clone(), wallet);
    }

    pub fn wallet(&self, user: &UserId) -> Option<&Wallet> {
        self.wallets.get(user)
    }

    pub fn wallet_mut(&mut self, user: &UserId) -> Option<&mut Wallet> {
        self.wallets.get_mut(user)
    }

    pub fn record_wallet_transaction(&mut self, txn: WalletTransaction) {
        self.wallet_transactions.insert(txn.id.clone(), txn);
    }

    pub fn wallet_transactions_for(&self, user: &UserId) -> Vec<&WalletTransaction> {
        self.wallet_transactions
            .values()
            .filter(|t| &t.user_id == user)
            .collect()
    }

    // --- escrows ---

    pub fn insert_escrow(&mut self, escrow: Escrow) {
        self.escrows.insert(escrow.id.clone(), escrow);
    }

    pub fn escrow(&self, id: &EscrowId) -> Option<&Escrow> {
        self.escrows.get(id)
    }

    pub fn escrow_mut(&mut self, id: &EscrowId) -> Option<&mut Escrow> {
        self.escrows.get_mut(id)
    }

    pub fn escrow_ids_for_assign(&self, assign: &AssignId) -> Vec<EscrowId> {
        self.escrows
            .values()
            .filter(|e| &e.class_assign_id == assign)
            .map(|e| e.id.clone())
            .collect()
    }

    pub fn record_escrow_refund(&mut self, refund: EscrowRefund) {
        self.escrow_refunds.push(refund);
    }

    pub fn escrow_refunds(&self) -> &[EscrowRefund] {
        &self.escrow_refunds
    }
}

/// Storage seam for the workflow services.
///
/// `transaction` must be all-or-nothing: when the closure returns `Err`,
/// nothing it did may be observable afterwards. The closure is `FnMut` so a
/// retrying runner can re-enter it from scratch.
pub trait WorkflowStore: Send + Sync {
    fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&StoreState) -> T;

    fn transaction<T, F>(&self, f: &mut F) -> Result<T, WorkflowError>
    where
        F: FnMut(&mut StoreState) -> Result<T, WorkflowError>;
}

/// In-process store with commit-by-swap transactions: the closure mutates a
/// clone of the state, which replaces the original only on success.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: StoreState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl WorkflowStore for MemoryStore {
    fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&StoreState) -> T,
    {
        let state = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("state mutex poisoned".to_string()))?;
        Ok(f(&state))
    }

    fn transaction<T, F>(&self, f: &mut F) -> Result<T, WorkflowError>
    where
        F: FnMut(&mut StoreState) -> Result<T, WorkflowError>,
    {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("state mutex poisoned".to_string()))?;
        let mut working = guard.clone();
        let value = f(&mut working)?;
        *guard = working;
        Ok(value)
    }
}

/// Runs one atomic unit with automatic retry on transient storage faults.
///
/// Safe because each attempt re-enters the closure against a fresh snapshot;
/// nothing from a failed attempt is observable.
pub fn run_transaction<S, T, F>(store: &S, attempts: u32, mut f: F) -> Result<T, WorkflowError>
where
    S: WorkflowStore + ?Sized,
    F: FnMut(&mut StoreState) -> Result<T, WorkflowError>,
{
    let mut attempt = 1u32;
    loop {
        match store.transaction(&mut f) {
            Err(WorkflowError::Store(err)) if err.is_transient() && attempt < attempts.max(1) => {
                tracing::warn!(attempt, error = %err, "transient storage failure, retrying unit");
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}
