//! Supply-side class authoring and class reads.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MatchingConfig;

use super::domain::{
    ApprovalStatus, Class, ClassId, ClassMode, ClassStatus, PaymentStatus, StudentId, TutorId,
    UserId, WeeklyInterval,
};
use super::error::WorkflowError;
use super::gateways::{require_tutor, IdentityResolver};
use super::store::{run_transaction, WorkflowStore};

/// A tutor-authored recurring class template.
#[derive(Debug, Clone)]
pub struct RecurringClassDraft {
    pub title: String,
    pub description: Option<String>,
    pub subject: String,
    pub education_level: String,
    pub mode: ClassMode,
    pub price: Option<u64>,
    pub location: Option<String>,
    pub student_limit: u32,
    pub class_start_date: Option<DateTime<Utc>>,
    pub online_link: Option<String>,
    pub schedule_rules: Vec<WeeklyInterval>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassView {
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
    pub schedule_rules: Vec<WeeklyInterval>,
}

impl ClassView {
    fn from_parts(class: &Class, rules: &[WeeklyInterval]) -> Self {
        Self {
            id: class.id.clone(),
            tutor_id: class.tutor_id.clone(),
            title: class.title.clone(),
            description: class.description.clone(),
            subject: class.subject.clone(),
            education_level: class.education_level.clone(),
            mode: class.mode,
            price: class.price,
            status: class.status,
            student_limit: class.student_limit,
            current_student_count: class.current_student_count,
            location: class.location.clone(),
            online_link: class.online_link.clone(),
            class_start_date: class.class_start_date,
            schedule_rules: rules.to_vec(),
        }
    }
}

/// One enrolled student as seen by the class's tutor.
#[derive(Debug, Clone, Serialize)]
pub struct StudentEnrollmentView {
    pub student_id: StudentId,
    pub approval_status: ApprovalStatus,
    pub payment_status: PaymentStatus,
    pub enrolled_at: DateTime<Utc>,
}

pub struct ClassCatalog<S> {
    store: Arc<S>,
    identity: Arc<dyn IdentityResolver>,
    config: MatchingConfig,
}

impl<S: WorkflowStore> ClassCatalog<S> {
    pub fn new(
        store: Arc<S>,
        identity: Arc<dyn IdentityResolver>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            store,
            identity,
            config,
        }
    }

    /// Publishes a recurring class template: `Pending`, zero students, the
    /// class row and its schedule rules persisted as one unit.
    pub fn create_recurring_class(
        &self,
        tutor_user: &UserId,
        draft: RecurringClassDraft,
        now: DateTime<Utc>,
    ) -> Result<ClassView, WorkflowError> {
        let tutor = require_tutor(self.identity.as_ref(), tutor_user)?;
        for rule in &draft.schedule_rules {
            rule.validate()?;
        }

        let class = Class {
            id: ClassId::generate(),
            tutor_id: tutor,
            title: draft.title,
            description: draft.description,
            subject: draft.subject,
            education_level: draft.education_level,
            mode: draft.mode,
            price: draft.price,
            status: ClassStatus::Pending,
            student_limit: draft.student_limit,
            current_student_count: 0,
            location: draft.location,
            online_link: draft.online_link,
            class_start_date: draft.class_start_date,
            created_at: now,
            deleted_at: None,
        };

        run_transaction(
            self.store.as_ref(),
            self.config.transaction_attempts,
            |state| {
                state.insert_class(class.clone());
                state.set_class_schedule(&class.id, draft.schedule_rules.clone());
                Ok(ClassView::from_parts(&class, &draft.schedule_rules))
            },
        )
    }

    pub fn get_class(&self, class_id: &ClassId) -> Result<ClassView, WorkflowError> {
        self.store
            .read(|state| {
                state
                    .class(class_id)
                    .filter(|c| c.deleted_at.is_none())
                    .map(|c| ClassView::from_parts(c, state.class_schedule(class_id)))
            })?
            .ok_or(WorkflowError::NotFound("class"))
    }

    /// Enrollment roster of a class; only its tutor may look.
    pub fn students_in_class(
        &self,
        tutor_user: &UserId,
        class_id: &ClassId,
    ) -> Result<Vec<StudentEnrollmentView>, WorkflowError> {
        let tutor = require_tutor(self.identity.as_ref(), tutor_user)?;
        self.store.read(|state| {
            let class = state
                .class(class_id)
                .ok_or(WorkflowError::NotFound("class"))?;
            if class.tutor_id != tutor {
                return Err(WorkflowError::Unauthorized(
                    "you do not teach this class",
                ));
            }
            Ok(state
                .assigns_for_class(class_id)
                .into_iter()
                .map(|assign| StudentEnrollmentView {
                    student_id: assign.student_id.clone(),
                    approval_status: assign.approval_status,
                    payment_status: assign.payment_status,
                    enrolled_at: assign.enrolled_at,
                })
                .collect())
        })?
    }
}
