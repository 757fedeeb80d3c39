use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveTime, TimeZone, Utc, Weekday};

use crate::config::MatchingConfig;
use crate::workflows::matching::applications::ApplicationLedger;
use crate::workflows::matching::classes::{ClassCatalog, RecurringClassDraft};
use crate::workflows::matching::domain::{
    ClassMode, NotificationId, StudentId, TutorId, UserId, Wallet, WeeklyInterval,
};
use crate::workflows::matching::enrollment::EnrollmentTransactor;
use crate::workflows::matching::error::WorkflowError;
use crate::workflows::matching::gateways::{
    IdentityResolver, LedgerEscrowGateway, LedgerWalletGateway, NotificationError,
    NotificationKind, NotificationSink, ScheduleGenerator, WeeklyOccurrencePlanner,
};
use crate::workflows::matching::requests::{ClassRequestDraft, RequestLedger};
use crate::workflows::matching::store::{MemoryStore, StoreError, StoreState, WorkflowStore};
use crate::workflows::matching::withdrawal::WithdrawalCompensator;

/// A frozen Monday morning so weekday math in fixtures is predictable.
pub(super) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 3, 8, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
}

pub(super) fn slot(day: Weekday, from: NaiveTime, to: NaiveTime) -> WeeklyInterval {
    WeeklyInterval::new(day, from, to)
}

/// Fixed profile directory for tests.
#[derive(Default)]
pub(super) struct StaticIdentity {
    students: HashMap<UserId, StudentId>,
    tutors: HashMap<UserId, TutorId>,
    links: HashSet<(UserId, StudentId)>,
}

impl StaticIdentity {
    pub(super) fn with_student(mut self, user: &str, student: &str) -> Self {
        self.students
            .insert(UserId(user.to_string()), StudentId(student.to_string()));
        self
    }

    pub(super) fn with_tutor(mut self, user: &str, tutor: &str) -> Self {
        self.tutors
            .insert(UserId(user.to_string()), TutorId(tutor.to_string()));
        self
    }

    pub(super) fn with_link(mut self, parent: &str, student: &str) -> Self {
        self.links
            .insert((UserId(parent.to_string()), StudentId(student.to_string())));
        self
    }
}

impl IdentityResolver for StaticIdentity {
    fn student_profile_for_user(&self, user: &UserId) -> Option<StudentId> {
        self.students.get(user).cloned()
    }

    fn tutor_profile_for_user(&self, user: &UserId) -> Option<TutorId> {
        self.tutors.get(user).cloned()
    }

    fn parent_child_link_exists(&self, parent: &UserId, student: &StudentId) -> bool {
        self.links.contains(&(parent.clone(), student.clone()))
    }

    fn children_of(&self, parent: &UserId) -> Vec<StudentId> {
        self.links
            .iter()
            .filter(|(p, _)| p == parent)
            .map(|(_, s)| s.clone())
            .collect()
    }

    fn user_for_student(&self, student: &StudentId) -> Option<UserId> {
        self.students
            .iter()
            .find(|(_, s)| *s == student)
            .map(|(u, _)| u.clone())
    }

    fn user_for_tutor(&self, tutor: &TutorId) -> Option<UserId> {
        self.tutors
            .iter()
            .find(|(_, t)| *t == tutor)
            .map(|(u, _)| u.clone())
    }
}

#[derive(Debug, Clone)]
pub(super) struct SentNotification {
    pub user: UserId,
    pub kind: NotificationKind,
    pub message: String,
    pub related_id: String,
}

#[derive(Default)]
pub(super) struct RecordingSink {
    events: Mutex<Vec<SentNotification>>,
}

impl RecordingSink {
    pub(super) fn events(&self) -> Vec<SentNotification> {
        self.events.lock().expect("sink mutex poisoned").clone()
    }

    pub(super) fn kinds_for(&self, user: &str) -> Vec<NotificationKind> {
        self.events()
            .into_iter()
            .filter(|e| e.user.0 == user)
            .map(|e| e.kind)
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(
        &self,
        user: &UserId,
        kind: NotificationKind,
        message: &str,
        related_id: &str,
    ) -> Result<NotificationId, NotificationError> {
        self.events
            .lock()
            .expect("sink mutex poisoned")
            .push(SentNotification {
                user: user.clone(),
                kind,
                message: message.to_string(),
                related_id: related_id.to_string(),
            });
        Ok(NotificationId::generate())
    }

    fn push_realtime(
        &self,
        _user: &UserId,
        _notification: &NotificationId,
    ) -> Result<(), NotificationError> {
        Ok(())
    }
}

/// Sink whose transport always fails; committed workflows must shrug it off.
pub(super) struct FailingSink;

impl NotificationSink for FailingSink {
    fn notify(
        &self,
        _user: &UserId,
        _kind: NotificationKind,
        _message: &str,
        _related_id: &str,
    ) -> Result<NotificationId, NotificationError> {
        Err(NotificationError::Transport("push broker offline".to_string()))
    }

    fn push_realtime(
        &self,
        _user: &UserId,
        _notification: &NotificationId,
    ) -> Result<(), NotificationError> {
        Err(NotificationError::Transport("push broker offline".to_string()))
    }
}

/// Occurrence generator that always fails, to prove match units unwind.
pub(super) struct FailingScheduler;

impl ScheduleGenerator for FailingScheduler {
    fn generate_from_weekly_rules(
        &self,
        _state: &mut StoreState,
        _class: &crate::workflows::matching::domain::ClassId,
        _tutor: &TutorId,
        _start: DateTime<Utc>,
        _rules: &[WeeklyInterval],
    ) -> Result<usize, WorkflowError> {
        Err(StoreError::Unavailable("occurrence backend offline".to_string()).into())
    }
}

/// Store that reports a transient fault for the first N transactions.
pub(super) struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicU32,
}

impl FlakyStore {
    pub(super) fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicU32::new(0),
        }
    }

    /// Arms the next `times` transactions to fail transiently.
    pub(super) fn arm(&self, times: u32) {
        self.failures.store(times, Ordering::SeqCst);
    }
}

impl WorkflowStore for FlakyStore {
    fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&StoreState) -> T,
    {
        self.inner.read(f)
    }

    fn transaction<T, F>(&self, f: &mut F) -> Result<T, WorkflowError>
    where
        F: FnMut(&mut StoreState) -> Result<T, WorkflowError>,
    {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("connection reset".to_string()).into());
        }
        self.inner.transaction(f)
    }
}

pub(super) struct TestEnv {
    pub store: Arc<MemoryStore>,
    pub sink: Arc<RecordingSink>,
    pub requests: RequestLedger<MemoryStore>,
    pub applications: ApplicationLedger<MemoryStore>,
    pub catalog: ClassCatalog<MemoryStore>,
    pub transactor: Arc<EnrollmentTransactor<MemoryStore>>,
    pub withdrawal: WithdrawalCompensator<MemoryStore>,
}

pub(super) fn directory() -> StaticIdentity {
    StaticIdentity::default()
        .with_student("u-student", "stu-1")
        .with_student("u-student2", "stu-2")
        .with_tutor("u-tutor", "tut-1")
        .with_tutor("u-tutor2", "tut-2")
        .with_link("u-parent", "stu-1")
}

pub(super) fn build_env() -> TestEnv {
    build_env_with(directory(), MatchingConfig::default())
}

pub(super) fn build_env_with(identity: StaticIdentity, config: MatchingConfig) -> TestEnv {
    build_env_full(identity, config, Arc::new(WeeklyOccurrencePlanner::default()))
}

pub(super) fn build_env_full(
    identity: StaticIdentity,
    config: MatchingConfig,
    scheduler: Arc<dyn ScheduleGenerator>,
) -> TestEnv {
    let store = Arc::new(MemoryStore::new());
    let identity: Arc<dyn IdentityResolver> = Arc::new(identity);
    let sink = Arc::new(RecordingSink::default());

    let transactor = Arc::new(EnrollmentTransactor::new(
        Arc::clone(&store),
        Arc::clone(&identity),
        sink.clone(),
        Arc::new(LedgerWalletGateway),
        scheduler,
        config.clone(),
    ));

    TestEnv {
        requests: RequestLedger::new(
            Arc::clone(&store),
            Arc::clone(&identity),
            sink.clone(),
            config.clone(),
        ),
        applications: ApplicationLedger::new(
            Arc::clone(&store),
            Arc::clone(&identity),
            sink.clone(),
            Arc::clone(&transactor),
            config.clone(),
        ),
        catalog: ClassCatalog::new(Arc::clone(&store), Arc::clone(&identity), config.clone()),
        withdrawal: WithdrawalCompensator::new(
            Arc::clone(&store),
            Arc::clone(&identity),
            Arc::new(LedgerEscrowGateway),
            config,
        ),
        transactor,
        store,
        sink,
    }
}

/// Request draft with three weekly slots, the standard demand fixture.
pub(super) fn math_draft(tutor: Option<&str>) -> ClassRequestDraft {
    ClassRequestDraft {
        student_id: None,
        tutor_id: tutor.map(|t| TutorId(t.to_string())),
        subject: "Math".to_string(),
        education_level: "Grade 10".to_string(),
        mode: ClassMode::Online,
        budget: Some(500_000),
        location: None,
        description: "Algebra fundamentals, twice-weekly review".to_string(),
        special_requirements: Some("Needs exam-focused drills".to_string()),
        class_start_date: Some(now()),
        online_link: None,
        schedule: vec![
            slot(Weekday::Mon, t(9, 0), t(10, 0)),
            slot(Weekday::Wed, t(14, 0), t(15, 0)),
            slot(Weekday::Fri, t(18, 0), t(19, 0)),
        ],
    }
}

/// Tutor-authored open class, the standard supply fixture.
pub(super) fn open_class_draft() -> RecurringClassDraft {
    RecurringClassDraft {
        title: "Physics problem clinic".to_string(),
        description: None,
        subject: "Physics".to_string(),
        education_level: "Grade 11".to_string(),
        mode: ClassMode::Online,
        price: Some(500_000),
        location: None,
        student_limit: 1,
        class_start_date: Some(now()),
        online_link: Some("https://meet.example/physics".to_string()),
        schedule_rules: vec![slot(Weekday::Tue, t(19, 0), t(20, 0))],
    }
}

pub(super) fn seed_wallet<S: WorkflowStore>(store: &S, user: &str, balance: u64) {
    store
        .transaction(&mut |state: &mut StoreState| {
            state.upsert_wallet(Wallet {
                user_id: UserId(user.to_string()),
                balance,
            });
            Ok(())
        })
        .expect("wallet seeded");
}

pub(super) fn user(id: &str) -> UserId {
    UserId(id.to_string())
}

pub(super) fn student(id: &str) -> StudentId {
    StudentId(id.to_string())
}
