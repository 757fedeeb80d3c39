//! The enrollment transactor: converts a confirmed match or a marketplace
//! purchase into a binding enrollment inside one atomic unit.
//!
//! Two entry paths converge on one internal routine. Match-to-class (a tutor
//! accepting a direct request, or a student accepting an application) creates
//! the 1-1 class, the enrollment, the copied schedule, and the materialized
//! occurrences together, after the conflict detector has cleared the
//! proposal. The marketplace path debits the payer's wallet and creates the
//! enrollment in the same unit, so no run can leave a debited wallet without
//! an enrollment or the reverse.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MatchingConfig;

use super::conflict::{detect_duplicate_class, ProposedClass};
use super::domain::{
    ActorRole, ApplicationId, ApplicationStatus, ApprovalStatus, AssignId, Class, ClassAssign,
    ClassId, ClassMode, ClassStatus, PaymentStatus, RequestId, RequestStatus, StudentId, TutorId,
    UserId,
};
use super::error::WorkflowError;
use super::gateways::{
    dispatch_notifications, require_tutor, resolve_target_student, IdentityResolver,
    NotificationKind, NotificationSink, PendingNotification, ScheduleGenerator, WalletGateway,
};
use super::requests::ensure_request_ownership;
use super::store::{run_transaction, StoreState, WorkflowStore};

/// An enrollment joined with its class, as exposed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentView {
    pub class_assign_id: AssignId,
    pub class_id: ClassId,
    pub class_title: String,
    pub class_subject: String,
    pub class_education_level: String,
    pub class_price: u64,
    pub class_status: ClassStatus,
    pub student_id: StudentId,
    pub approval_status: ApprovalStatus,
    pub payment_status: PaymentStatus,
    pub enrolled_at: DateTime<Utc>,
}

impl EnrollmentView {
    fn from_parts(assign: &ClassAssign, class: &Class) -> Self {
        Self {
            class_assign_id: assign.id.clone(),
            class_id: assign.class_id.clone(),
            class_title: class.title.clone(),
            class_subject: class.subject.clone(),
            class_education_level: class.education_level.clone(),
            class_price: class.price.unwrap_or(0),
            class_status: class.status,
            student_id: assign.student_id.clone(),
            approval_status: assign.approval_status,
            payment_status: assign.payment_status,
            enrolled_at: assign.enrolled_at,
        }
    }
}

/// One row of a student's enrollment overview.
#[derive(Debug, Clone, Serialize)]
pub struct EnrolledClassView {
    pub class_id: ClassId,
    pub class_title: String,
    pub subject: String,
    pub education_level: String,
    pub price: u64,
    pub class_status: ClassStatus,
    pub approval_status: ApprovalStatus,
    pub payment_status: PaymentStatus,
    pub enrolled_at: DateTime<Utc>,
    pub location: Option<String>,
    pub mode: ClassMode,
    pub class_start_date: Option<DateTime<Utc>>,
}

pub struct EnrollmentTransactor<S> {
    store: Arc<S>,
    identity: Arc<dyn IdentityResolver>,
    notifier: Arc<dyn NotificationSink>,
    wallet: Arc<dyn WalletGateway>,
    scheduler: Arc<dyn ScheduleGenerator>,
    config: MatchingConfig,
}

impl<S: WorkflowStore> EnrollmentTransactor<S> {
    pub fn new(
        store: Arc<S>,
        identity: Arc<dyn IdentityResolver>,
        notifier: Arc<dyn NotificationSink>,
        wallet: Arc<dyn WalletGateway>,
        scheduler: Arc<dyn ScheduleGenerator>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            store,
            identity,
            notifier,
            wallet,
            scheduler,
            config,
        }
    }

    /// Match-to-class, shared by the direct-accept and application-accept
    /// paths. Runs inside the caller's session: conflict check first, then
    /// class, enrollment, copied schedule, status transitions, and
    /// occurrence generation. Any failure unwinds the whole unit.
    fn create_class_from_request(
        &self,
        state: &mut StoreState,
        tutor_id: &TutorId,
        request_id: &RequestId,
        meeting_link: Option<&str>,
        source_application: Option<&ApplicationId>,
        now: DateTime<Utc>,
    ) -> Result<ClassId, WorkflowError> {
        let request = state
            .request(request_id)
            .ok_or(WorkflowError::NotFound("class request"))?
            .clone();
        let schedule = state.request_schedule(request_id).to_vec();

        detect_duplicate_class(
            state,
            &ProposedClass {
                tutor_id,
                subject: &request.subject,
                education_level: &request.education_level,
                mode: request.mode,
                price: request.budget,
                intervals: &schedule,
            },
        )?;

        let description = match &request.special_requirements {
            Some(requirements) => format!(
                "{}\n\nSpecial requirements: {}",
                request.description, requirements
            ),
            None => request.description.clone(),
        };
        let online_link = meeting_link
            .filter(|link| !link.is_empty())
            .map(str::to_string)
            .or_else(|| request.online_link.clone());

        let class = Class {
            id: ClassId::generate(),
            tutor_id: tutor_id.clone(),
            title: format!("{} class (from request {})", request.subject, request.id),
            description: Some(description),
            subject: request.subject.clone(),
            education_level: request.education_level.clone(),
            mode: request.mode,
            price: request.budget,
            status: ClassStatus::Pending,
            student_limit: 1,
            current_student_count: 1,
            location: request.location.clone(),
            online_link,
            class_start_date: request.class_start_date,
            created_at: now,
            deleted_at: None,
        };
        let class_id = class.id.clone();
        state.insert_class(class);

        state.insert_assign(ClassAssign {
            id: AssignId::generate(),
            class_id: class_id.clone(),
            student_id: request.student_id.clone(),
            approval_status: ApprovalStatus::Approved,
            payment_status: PaymentStatus::Pending,
            enrolled_at: now,
        })?;

        state.set_class_schedule(&class_id, schedule.clone());

        state
            .request_mut(request_id)
            .expect("request loaded earlier in this unit")
            .status = RequestStatus::Matched;
        if let Some(application_id) = source_application {
            state
                .application_mut(application_id)
                .ok_or(WorkflowError::NotFound("tutor application"))?
                .status = ApplicationStatus::Accepted;
        }

        self.scheduler.generate_from_weekly_rules(
            state,
            &class_id,
            tutor_id,
            request.class_start_date.unwrap_or(now),
            &schedule,
        )?;

        Ok(class_id)
    }

    /// A tutor's answer to a direct request. Rejection flips the request and
    /// creates nothing; acceptance runs the full match-to-class unit.
    /// Returns the created class id on acceptance.
    pub fn respond_to_direct_request(
        &self,
        tutor_user: &UserId,
        request_id: &RequestId,
        accept: bool,
        meeting_link: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<ClassId>, WorkflowError> {
        let tutor = require_tutor(self.identity.as_ref(), tutor_user)?;

        if !accept {
            let student = run_transaction(
                self.store.as_ref(),
                self.config.transaction_attempts,
                |state| {
                    let request = state
                        .request(request_id)
                        .filter(|r| r.tutor_id.as_ref() == Some(&tutor))
                        .ok_or(WorkflowError::NotFound("class request"))?;
                    if request.status != RequestStatus::Pending {
                        return Err(WorkflowError::InvalidState {
                            status: request.status.label(),
                        });
                    }
                    let student = request.student_id.clone();
                    state
                        .request_mut(request_id)
                        .expect("request loaded earlier in this unit")
                        .status = RequestStatus::Rejected;
                    Ok(student)
                },
            )?;

            let mut pending = Vec::new();
            if let Some(student_user) = self.identity.user_for_student(&student) {
                pending.push(PendingNotification {
                    user: student_user,
                    kind: NotificationKind::ClassRequestRejected,
                    message: "The tutor declined your class request.".to_string(),
                    related_id: request_id.0.clone(),
                });
            }
            dispatch_notifications(self.notifier.as_ref(), pending);
            return Ok(None);
        }

        let (class_id, student) = run_transaction(
            self.store.as_ref(),
            self.config.transaction_attempts,
            |state| {
                let request = state
                    .request(request_id)
                    .filter(|r| r.tutor_id.as_ref() == Some(&tutor))
                    .ok_or(WorkflowError::NotFound("class request"))?;
                if request.status != RequestStatus::Pending {
                    return Err(WorkflowError::InvalidState {
                        status: request.status.label(),
                    });
                }
                let student = request.student_id.clone();
                let class_id = self.create_class_from_request(
                    state,
                    &tutor,
                    request_id,
                    meeting_link.as_deref(),
                    None,
                    now,
                )?;
                Ok((class_id, student))
            },
        )?;

        let mut pending = Vec::new();
        if let Some(student_user) = self.identity.user_for_student(&student) {
            pending.push(PendingNotification {
                user: student_user.clone(),
                kind: NotificationKind::ClassRequestAccepted,
                message: "The tutor accepted your class request.".to_string(),
                related_id: request_id.0.clone(),
            });
            pending.push(PendingNotification {
                user: student_user,
                kind: NotificationKind::ClassCreatedFromRequest,
                message: "A class was created from your request. Please pay to start learning."
                    .to_string(),
                related_id: class_id.0.clone(),
            });
        }
        dispatch_notifications(self.notifier.as_ref(), pending);

        Ok(Some(class_id))
    }

    /// The request owner accepts one tutor's application. Closes the request
    /// against every other pending application and runs the match-to-class
    /// unit for the chosen tutor.
    pub fn accept_application(
        &self,
        actor: &UserId,
        role: ActorRole,
        application_id: &ApplicationId,
        now: DateTime<Utc>,
    ) -> Result<ClassId, WorkflowError> {
        let (class_id, tutor, student) = run_transaction(
            self.store.as_ref(),
            self.config.transaction_attempts,
            |state| {
                let application = state
                    .application(application_id)
                    .ok_or(WorkflowError::NotFound("tutor application"))?
                    .clone();
                let request = state
                    .request(&application.class_request_id)
                    .ok_or(WorkflowError::NotFound("class request"))?;
                ensure_request_ownership(self.identity.as_ref(), actor, role, request)?;
                if request.status != RequestStatus::Pending {
                    return Err(WorkflowError::InvalidState {
                        status: request.status.label(),
                    });
                }
                if application.status != ApplicationStatus::Pending {
                    return Err(WorkflowError::InvalidState {
                        status: application.status.label(),
                    });
                }
                let student = request.student_id.clone();

                let class_id = self.create_class_from_request(
                    state,
                    &application.tutor_id,
                    &application.class_request_id,
                    application.meeting_link.as_deref(),
                    Some(application_id),
                    now,
                )?;
                Ok((class_id, application.tutor_id.clone(), student))
            },
        )?;

        let mut pending = Vec::new();
        if let Some(tutor_user) = self.identity.user_for_tutor(&tutor) {
            pending.push(PendingNotification {
                user: tutor_user,
                kind: NotificationKind::TutorApplicationAccepted,
                message: "Your application was accepted and the class has been created."
                    .to_string(),
                related_id: class_id.0.clone(),
            });
        }
        if let Some(student_user) = self.identity.user_for_student(&student) {
            pending.push(PendingNotification {
                user: student_user,
                kind: NotificationKind::ClassCreatedFromRequest,
                message: "A class was created from your request. Please pay to start learning."
                    .to_string(),
                related_id: class_id.0.clone(),
            });
        }
        dispatch_notifications(self.notifier.as_ref(), pending);

        Ok(class_id)
    }

    /// Marketplace self-serve purchase: wallet check-and-debit, signed
    /// ledger row, paid enrollment, and occupancy increment commit together
    /// or not at all.
    pub fn enroll(
        &self,
        actor: &UserId,
        role: ActorRole,
        class_id: &ClassId,
        student: Option<&StudentId>,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentView, WorkflowError> {
        let student = resolve_target_student(self.identity.as_ref(), actor, role, student)?;

        let (view, price) = run_transaction(
            self.store.as_ref(),
            self.config.transaction_attempts,
            |state| {
                let class = state
                    .class(class_id)
                    .ok_or(WorkflowError::NotFound("class"))?;
                if !matches!(class.status, ClassStatus::Pending | ClassStatus::Active) {
                    return Err(WorkflowError::InvalidState {
                        status: class.status.label(),
                    });
                }
                if class.current_student_count >= class.student_limit {
                    return Err(WorkflowError::Capacity);
                }
                if state.assign_for(class_id, &student).is_some() {
                    return Err(WorkflowError::Duplicate(
                        "student is already enrolled in this class",
                    ));
                }
                let price = class.price.unwrap_or(0);

                self.wallet.debit(state, actor, price, now)?;

                let assign = ClassAssign {
                    id: AssignId::generate(),
                    class_id: class_id.clone(),
                    student_id: student.clone(),
                    approval_status: ApprovalStatus::Approved,
                    payment_status: PaymentStatus::Paid,
                    enrolled_at: now,
                };
                let snapshot = assign.clone();
                state.insert_assign(assign)?;

                let class = state
                    .class_mut(class_id)
                    .expect("class loaded earlier in this unit");
                class.current_student_count += 1;
                let view = EnrollmentView::from_parts(&snapshot, class);
                Ok((view, price))
            },
        )?;

        let mut pending = vec![PendingNotification {
            user: actor.clone(),
            kind: NotificationKind::EscrowPaid,
            message: format!(
                "Payment of {} for class '{}' succeeded.",
                price, view.class_title
            ),
            related_id: class_id.0.clone(),
        }];
        if role == ActorRole::Parent {
            if let Some(student_user) = self.identity.user_for_student(&student) {
                pending.push(PendingNotification {
                    user: student_user,
                    kind: NotificationKind::ClassEnrollmentSuccess,
                    message: format!(
                        "A parent enrolled you in class '{}'.",
                        view.class_title
                    ),
                    related_id: class_id.0.clone(),
                });
            }
        }
        dispatch_notifications(self.notifier.as_ref(), pending);

        Ok(view)
    }

    /// Every class the target student is enrolled in, joined with class
    /// details.
    pub fn my_enrolled_classes(
        &self,
        actor: &UserId,
        role: ActorRole,
        student: Option<&StudentId>,
    ) -> Result<Vec<EnrolledClassView>, WorkflowError> {
        let student = resolve_target_student(self.identity.as_ref(), actor, role, student)?;
        Ok(self.store.read(|state| {
            state
                .assigns_for_student(&student)
                .into_iter()
                .filter_map(|assign| {
                    state.class(&assign.class_id).map(|class| EnrolledClassView {
                        class_id: class.id.clone(),
                        class_title: class.title.clone(),
                        subject: class.subject.clone(),
                        education_level: class.education_level.clone(),
                        price: class.price.unwrap_or(0),
                        class_status: class.status,
                        approval_status: assign.approval_status,
                        payment_status: assign.payment_status,
                        enrolled_at: assign.enrolled_at,
                        location: class.location.clone(),
                        mode: class.mode,
                        class_start_date: class.class_start_date,
                    })
                })
                .collect()
        })?)
    }

    /// Whether the target student holds an approved enrollment in the class.
    pub fn check_enrollment(
        &self,
        actor: &UserId,
        role: ActorRole,
        class_id: &ClassId,
        student: Option<&StudentId>,
    ) -> Result<bool, WorkflowError> {
        let student = resolve_target_student(self.identity.as_ref(), actor, role, student)?;
        Ok(self.store.read(|state| {
            state
                .assign_for(class_id, &student)
                .is_some_and(|a| a.approval_status == ApprovalStatus::Approved)
        })?)
    }

    /// The viewer's own enrollment in a class: their own row for a student,
    /// the first linked child's row for a parent.
    pub fn enrollment_detail(
        &self,
        actor: &UserId,
        class_id: &ClassId,
    ) -> Result<EnrollmentView, WorkflowError> {
        let identity = Arc::clone(&self.identity);
        self.store.read(move |state| {
            let assigns = state.assigns_for_class(class_id);
            if assigns.is_empty() {
                return Err(WorkflowError::NotFound("enrollment for this class"));
            }
            let target = match identity.student_profile_for_user(actor) {
                Some(profile) => assigns.iter().find(|a| a.student_id == profile).copied(),
                None => assigns
                    .iter()
                    .find(|a| identity.parent_child_link_exists(actor, &a.student_id))
                    .copied(),
            };
            let assign = target.ok_or(WorkflowError::Unauthorized(
                "you are not enrolled in this class and not linked to an enrolled student",
            ))?;
            let class = state
                .class(class_id)
                .ok_or(WorkflowError::NotFound("class"))?;
            Ok(EnrollmentView::from_parts(assign, class))
        })?
    }
}
