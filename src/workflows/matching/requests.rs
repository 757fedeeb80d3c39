//! The class-request ledger: creation, edits, cancellation, and the
//! periodic expiry sweep for demand postings.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::MatchingConfig;

use super::domain::{
    ActorRole, ClassMode, ClassRequest, RequestId, RequestStatus, StudentId, TutorId, UserId,
    WeeklyInterval,
};
use super::error::WorkflowError;
use super::gateways::{
    dispatch_notifications, resolve_target_student, IdentityResolver, NotificationKind,
    NotificationSink, PendingNotification,
};
use super::store::{run_transaction, WorkflowStore};

/// Fields a student or parent supplies when posting a request.
#[derive(Debug, Clone)]
pub struct ClassRequestDraft {
    /// Required when a parent acts for a child; ignored for students.
    pub student_id: Option<StudentId>,
    /// `None` posts to the marketplace; `Some` addresses one tutor.
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
    pub schedule: Vec<WeeklyInterval>,
}

/// Partial edit: absent fields keep their prior value.
#[derive(Debug, Clone, Default)]
pub struct ClassRequestPatch {
    pub description: Option<String>,
    pub location: Option<String>,
    pub special_requirements: Option<String>,
    pub budget: Option<u64>,
    pub online_link: Option<String>,
    pub mode: Option<ClassMode>,
    pub class_start_date: Option<DateTime<Utc>>,
}

/// Marketplace browse filter; unset fields match everything. Status defaults
/// to `Pending` so the storefront shows open demand.
#[derive(Debug, Clone, Default)]
pub struct MarketplaceFilter {
    pub status: Option<RequestStatus>,
    pub subject: Option<String>,
    pub education_level: Option<String>,
    pub mode: Option<ClassMode>,
    pub location: Option<String>,
}

/// A request with its schedule preferences, as exposed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ClassRequestView {
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
    pub schedule: Vec<WeeklyInterval>,
}

impl ClassRequestView {
    fn from_parts(request: &ClassRequest, schedule: &[WeeklyInterval]) -> Self {
        Self {
            id: request.id.clone(),
            student_id: request.student_id.clone(),
            tutor_id: request.tutor_id.clone(),
            subject: request.subject.clone(),
            education_level: request.education_level.clone(),
            mode: request.mode,
            budget: request.budget,
            location: request.location.clone(),
            description: request.description.clone(),
            special_requirements: request.special_requirements.clone(),
            class_start_date: request.class_start_date,
            online_link: request.online_link.clone(),
            status: request.status,
            expiry_date: request.expiry_date,
            created_at: request.created_at,
            schedule: schedule.to_vec(),
        }
    }
}

/// Verifies the actor may act on a request: students must own it, parents
/// must hold a verified link to the owning student.
pub(crate) fn ensure_request_ownership(
    identity: &dyn IdentityResolver,
    actor: &UserId,
    role: ActorRole,
    request: &ClassRequest,
) -> Result<(), WorkflowError> {
    match role {
        ActorRole::Student => {
            let owns = identity
                .student_profile_for_user(actor)
                .is_some_and(|profile| profile == request.student_id);
            if owns {
                Ok(())
            } else {
                Err(WorkflowError::Unauthorized(
                    "you do not own this class request",
                ))
            }
        }
        ActorRole::Parent => {
            if identity.parent_child_link_exists(actor, &request.student_id) {
                Ok(())
            } else {
                Err(WorkflowError::Unauthorized(
                    "you are not linked to the requesting student",
                ))
            }
        }
        _ => Err(WorkflowError::Unauthorized(
            "only students and parents manage class requests",
        )),
    }
}

pub struct RequestLedger<S> {
    store: Arc<S>,
    identity: Arc<dyn IdentityResolver>,
    notifier: Arc<dyn NotificationSink>,
    config: MatchingConfig,
}

impl<S: WorkflowStore> RequestLedger<S> {
    pub fn new(
        store: Arc<S>,
        identity: Arc<dyn IdentityResolver>,
        notifier: Arc<dyn NotificationSink>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            store,
            identity,
            notifier,
            config,
        }
    }

    /// Posts a new request with its schedule preferences as one unit and, for
    /// direct requests, notifies the addressed tutor after commit.
    pub fn create(
        &self,
        actor: &UserId,
        role: ActorRole,
        draft: ClassRequestDraft,
        now: DateTime<Utc>,
    ) -> Result<ClassRequestView, WorkflowError> {
        let student =
            resolve_target_student(self.identity.as_ref(), actor, role, draft.student_id.as_ref())?;
        for interval in &draft.schedule {
            interval.validate()?;
        }

        let request = ClassRequest {
            id: RequestId::generate(),
            student_id: student,
            tutor_id: draft.tutor_id.clone(),
            subject: draft.subject,
            education_level: draft.education_level,
            mode: draft.mode,
            budget: draft.budget,
            location: draft.location,
            description: draft.description,
            special_requirements: draft.special_requirements,
            class_start_date: draft.class_start_date,
            online_link: draft.online_link,
            status: RequestStatus::Pending,
            expiry_date: now + Duration::days(self.config.request_expiry_days),
            created_at: now,
            deleted_at: None,
        };

        let view = run_transaction(
            self.store.as_ref(),
            self.config.transaction_attempts,
            |state| {
                state.insert_request(request.clone());
                state.set_request_schedule(&request.id, draft.schedule.clone());
                Ok(ClassRequestView::from_parts(&request, &draft.schedule))
            },
        )?;

        let mut pending = Vec::new();
        if let Some(tutor_id) = &view.tutor_id {
            if let Some(tutor_user) = self.identity.user_for_tutor(tutor_id) {
                pending.push(PendingNotification {
                    user: tutor_user,
                    kind: NotificationKind::ClassRequestReceived,
                    message: format!(
                        "A student sent you a class request for {}. Please review and respond.",
                        view.subject
                    ),
                    related_id: view.id.0.clone(),
                });
            }
        }
        dispatch_notifications(self.notifier.as_ref(), pending);

        Ok(view)
    }

    /// Edits a pending request. Absent patch fields leave the prior value.
    pub fn update(
        &self,
        actor: &UserId,
        role: ActorRole,
        request_id: &RequestId,
        patch: ClassRequestPatch,
    ) -> Result<ClassRequestView, WorkflowError> {
        let identity = Arc::clone(&self.identity);
        run_transaction(
            self.store.as_ref(),
            self.config.transaction_attempts,
            move |state| {
                let request = state
                    .request(request_id)
                    .ok_or(WorkflowError::NotFound("class request"))?;
                ensure_request_ownership(identity.as_ref(), actor, role, request)?;
                if request.status != RequestStatus::Pending {
                    return Err(WorkflowError::InvalidState {
                        status: request.status.label(),
                    });
                }

                let request = state
                    .request_mut(request_id)
                    .expect("request present after ownership check");
                if let Some(description) = patch.description.clone() {
                    request.description = description;
                }
                if let Some(location) = patch.location.clone() {
                    request.location = Some(location);
                }
                if let Some(requirements) = patch.special_requirements.clone() {
                    request.special_requirements = Some(requirements);
                }
                if let Some(budget) = patch.budget {
                    request.budget = Some(budget);
                }
                if let Some(link) = patch.online_link.clone() {
                    request.online_link = Some(link);
                }
                if let Some(mode) = patch.mode {
                    request.mode = mode;
                }
                if let Some(start) = patch.class_start_date {
                    request.class_start_date = Some(start);
                }

                let request = request.clone();
                Ok(ClassRequestView::from_parts(
                    &request,
                    state.request_schedule(request_id),
                ))
            },
        )
    }

    /// Replaces the full schedule preference set of a pending request
    /// (delete-then-insert, one unit).
    pub fn update_schedule(
        &self,
        actor: &UserId,
        role: ActorRole,
        request_id: &RequestId,
        schedule: Vec<WeeklyInterval>,
    ) -> Result<(), WorkflowError> {
        for interval in &schedule {
            interval.validate()?;
        }
        let identity = Arc::clone(&self.identity);
        run_transaction(
            self.store.as_ref(),
            self.config.transaction_attempts,
            move |state| {
                let request = state
                    .request(request_id)
                    .ok_or(WorkflowError::NotFound("class request"))?;
                ensure_request_ownership(identity.as_ref(), actor, role, request)?;
                if request.status != RequestStatus::Pending {
                    return Err(WorkflowError::InvalidState {
                        status: request.status.label(),
                    });
                }
                state.set_request_schedule(request_id, schedule.clone());
                Ok(())
            },
        )
    }

    /// Cancels a pending request.
    pub fn cancel(
        &self,
        actor: &UserId,
        role: ActorRole,
        request_id: &RequestId,
    ) -> Result<(), WorkflowError> {
        let identity = Arc::clone(&self.identity);
        run_transaction(
            self.store.as_ref(),
            self.config.transaction_attempts,
            move |state| {
                let request = state
                    .request(request_id)
                    .ok_or(WorkflowError::NotFound("class request"))?;
                ensure_request_ownership(identity.as_ref(), actor, role, request)?;
                if request.status != RequestStatus::Pending {
                    return Err(WorkflowError::InvalidState {
                        status: request.status.label(),
                    });
                }
                state
                    .request_mut(request_id)
                    .expect("request present after ownership check")
                    .status = RequestStatus::Cancelled;
                Ok(())
            },
        )
    }

    /// Periodic sweep transitioning overdue requests to `Expired`.
    ///
    /// Matches `Active` requests, which `create` never produces; the
    /// `expire_pending_requests` flag opts into also sweeping `Pending`.
    /// Each row commits on its own so one failure cannot halt the sweep.
    pub fn expire(&self, now: DateTime<Utc>) -> Result<usize, WorkflowError> {
        let mut swept_statuses = vec![RequestStatus::Active];
        if self.config.expire_pending_requests {
            swept_statuses.push(RequestStatus::Pending);
        }

        let candidates: Vec<RequestId> = self.store.read(|state| {
            state
                .requests()
                .filter(|r| r.deleted_at.is_none())
                .filter(|r| swept_statuses.contains(&r.status))
                .filter(|r| r.expiry_date <= now)
                .map(|r| r.id.clone())
                .collect()
        })?;

        let mut expired = 0usize;
        for id in candidates {
            let outcome = run_transaction(
                self.store.as_ref(),
                self.config.transaction_attempts,
                |state| {
                    if let Some(request) = state.request_mut(&id) {
                        if swept_statuses.contains(&request.status) && request.expiry_date <= now {
                            request.status = RequestStatus::Expired;
                        }
                    }
                    Ok(())
                },
            );
            match outcome {
                Ok(()) => expired += 1,
                Err(err) => {
                    tracing::warn!(request = %id, error = %err, "expiry sweep item failed, continuing");
                }
            }
        }
        Ok(expired)
    }

    pub fn get(&self, request_id: &RequestId) -> Result<ClassRequestView, WorkflowError> {
        self.store
            .read(|state| {
                state.request(request_id).map(|request| {
                    ClassRequestView::from_parts(request, state.request_schedule(request_id))
                })
            })?
            .ok_or(WorkflowError::NotFound("class request"))
    }

    /// Requests owned by the actor's student profile, or by a parent's
    /// children (optionally narrowed to one child).
    pub fn my_requests(
        &self,
        actor: &UserId,
        role: ActorRole,
        child: Option<&StudentId>,
    ) -> Result<Vec<ClassRequestView>, WorkflowError> {
        let students: Vec<StudentId> = match role {
            ActorRole::Student => self
                .identity
                .student_profile_for_user(actor)
                .into_iter()
                .collect(),
            ActorRole::Parent => match child {
                Some(child) => {
                    if !self.identity.parent_child_link_exists(actor, child) {
                        return Err(WorkflowError::Unauthorized(
                            "you are not linked to this student",
                        ));
                    }
                    vec![child.clone()]
                }
                None => self.identity.children_of(actor),
            },
            _ => Vec::new(),
        };
        if students.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self.store.read(|state| {
            let mut views: Vec<ClassRequestView> = state
                .requests()
                .filter(|r| r.deleted_at.is_none())
                .filter(|r| students.contains(&r.student_id))
                .map(|r| ClassRequestView::from_parts(r, state.request_schedule(&r.id)))
                .collect();
            views.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            views
        })?)
    }

    /// Pending direct requests addressed to the acting tutor.
    pub fn direct_requests(&self, tutor_user: &UserId) -> Result<Vec<ClassRequestView>, WorkflowError> {
        let Some(tutor) = self.identity.tutor_profile_for_user(tutor_user) else {
            return Ok(Vec::new());
        };
        Ok(self.store.read(|state| {
            let mut views: Vec<ClassRequestView> = state
                .requests()
                .filter(|r| r.tutor_id.as_ref() == Some(&tutor))
                .filter(|r| r.status == RequestStatus::Pending)
                .map(|r| ClassRequestView::from_parts(r, state.request_schedule(&r.id)))
                .collect();
            views.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            views
        })?)
    }

    /// Open marketplace requests, filtered and paginated (1-based page).
    /// Returns the page and the total match count.
    pub fn marketplace_requests(
        &self,
        filter: &MarketplaceFilter,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<ClassRequestView>, usize), WorkflowError> {
        let status = filter.status.unwrap_or(RequestStatus::Pending);
        Ok(self.store.read(|state| {
            let mut matches: Vec<&ClassRequest> = state
                .requests()
                .filter(|r| r.deleted_at.is_none() && r.tutor_id.is_none())
                .filter(|r| r.status == status)
                .filter(|r| {
                    filter
                        .subject
                        .as_ref()
                        .map_or(true, |s| r.subject.contains(s.as_str()))
                })
                .filter(|r| {
                    filter
                        .education_level
                        .as_ref()
                        .map_or(true, |l| r.education_level.contains(l.as_str()))
                })
                .filter(|r| filter.mode.map_or(true, |m| r.mode == m))
                .filter(|r| {
                    filter.location.as_ref().map_or(true, |loc| {
                        r.location
                            .as_ref()
                            .is_some_and(|have| have.contains(loc.as_str()))
                    })
                })
                .collect();
            matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));

            let total = matches.len();
            let start = page.saturating_sub(1) * page_size;
            let views = matches
                .into_iter()
                .skip(start)
                .take(page_size)
                .map(|r| ClassRequestView::from_parts(r, state.request_schedule(&r.id)))
                .collect();
            (views, total)
        })?)
    }

    /// Administrative soft delete; the row stays for audit but leaves every
    /// listing.
    pub fn remove(&self, request_id: &RequestId, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        run_transaction(
            self.store.as_ref(),
            self.config.transaction_attempts,
            |state| {
                let request = state
                    .request_mut(request_id)
                    .ok_or(WorkflowError::NotFound("class request"))?;
                if request.deleted_at.is_some() {
                    return Err(WorkflowError::NotFound("class request"));
                }
                request.deleted_at = Some(now);
                Ok(())
            },
        )
    }
}
