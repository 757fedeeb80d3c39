//! The tutor-application ledger: offers against open class requests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MatchingConfig;

use super::domain::{
    ActorRole, ApplicationId, ApplicationStatus, ClassId, RequestId, TutorApplication, TutorId,
    UserId,
};
use super::enrollment::EnrollmentTransactor;
use super::error::WorkflowError;
use super::gateways::{
    dispatch_notifications, require_tutor, IdentityResolver, NotificationKind, NotificationSink,
    PendingNotification,
};
use super::requests::ensure_request_ownership;
use super::store::{run_transaction, WorkflowStore};

/// What a tutor attaches to an application.
#[derive(Debug, Clone, Default)]
pub struct ApplicationOffer {
    pub meeting_link: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TutorApplicationView {
    pub id: ApplicationId,
    pub class_request_id: RequestId,
    pub tutor_id: TutorId,
    pub status: ApplicationStatus,
    pub meeting_link: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&TutorApplication> for TutorApplicationView {
    fn from(application: &TutorApplication) -> Self {
        Self {
            id: application.id.clone(),
            class_request_id: application.class_request_id.clone(),
            tutor_id: application.tutor_id.clone(),
            status: application.status,
            meeting_link: application.meeting_link.clone(),
            created_at: application.created_at,
        }
    }
}

pub struct ApplicationLedger<S> {
    store: Arc<S>,
    identity: Arc<dyn IdentityResolver>,
    notifier: Arc<dyn NotificationSink>,
    transactor: Arc<EnrollmentTransactor<S>>,
    config: MatchingConfig,
}

impl<S: WorkflowStore> ApplicationLedger<S> {
    pub fn new(
        store: Arc<S>,
        identity: Arc<dyn IdentityResolver>,
        notifier: Arc<dyn NotificationSink>,
        transactor: Arc<EnrollmentTransactor<S>>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            store,
            identity,
            notifier,
            transactor,
            config,
        }
    }

    /// Submits a pending application. A tutor gets one application per
    /// request, whatever became of the previous one; only a withdrawn
    /// (deleted) application frees the slot. The request owner is notified
    /// after commit.
    pub fn submit(
        &self,
        tutor_user: &UserId,
        request_id: &RequestId,
        offer: ApplicationOffer,
        now: DateTime<Utc>,
    ) -> Result<TutorApplicationView, WorkflowError> {
        let tutor = require_tutor(self.identity.as_ref(), tutor_user)?;

        let application = TutorApplication {
            id: ApplicationId::generate(),
            tutor_id: tutor.clone(),
            class_request_id: request_id.clone(),
            status: ApplicationStatus::Pending,
            meeting_link: offer.meeting_link,
            created_at: now,
        };

        let (view, owner) = run_transaction(
            self.store.as_ref(),
            self.config.transaction_attempts,
            |state| {
                let request = state
                    .request(request_id)
                    .ok_or(WorkflowError::NotFound("class request"))?;
                let owner = request.student_id.clone();
                if state.has_application(&tutor, request_id) {
                    return Err(WorkflowError::Duplicate(
                        "tutor has already applied to this request",
                    ));
                }
                state.insert_application(application.clone());
                Ok((TutorApplicationView::from(&application), owner))
            },
        )?;

        let mut pending = Vec::new();
        if let Some(owner_user) = self.identity.user_for_student(&owner) {
            pending.push(PendingNotification {
                user: owner_user,
                kind: NotificationKind::TutorApplicationReceived,
                message: "A tutor applied to your class request. Please review and respond."
                    .to_string(),
                related_id: request_id.0.clone(),
            });
        }
        dispatch_notifications(self.notifier.as_ref(), pending);

        Ok(view)
    }

    /// Withdraws a pending application by deleting the row outright.
    pub fn withdraw(
        &self,
        tutor_user: &UserId,
        application_id: &ApplicationId,
    ) -> Result<(), WorkflowError> {
        let tutor = require_tutor(self.identity.as_ref(), tutor_user)?;
        run_transaction(
            self.store.as_ref(),
            self.config.transaction_attempts,
            |state| {
                let application = state
                    .application(application_id)
                    .filter(|a| a.tutor_id == tutor)
                    .ok_or(WorkflowError::NotFound("tutor application"))?;
                if application.status != ApplicationStatus::Pending {
                    return Err(WorkflowError::InvalidState {
                        status: application.status.label(),
                    });
                }
                state.remove_application(application_id);
                Ok(())
            },
        )
    }

    /// Rejects a pending application on behalf of the request owner and
    /// notifies the applying tutor after commit.
    pub fn reject(
        &self,
        actor: &UserId,
        role: ActorRole,
        application_id: &ApplicationId,
    ) -> Result<(), WorkflowError> {
        let identity = Arc::clone(&self.identity);
        let tutor = run_transaction(
            self.store.as_ref(),
            self.config.transaction_attempts,
            move |state| {
                let application = state
                    .application(application_id)
                    .ok_or(WorkflowError::NotFound("tutor application"))?;
                let request = state
                    .request(&application.class_request_id)
                    .ok_or(WorkflowError::NotFound("class request"))?;
                ensure_request_ownership(identity.as_ref(), actor, role, request)?;
                if application.status != ApplicationStatus::Pending {
                    return Err(WorkflowError::InvalidState {
                        status: application.status.label(),
                    });
                }

                let tutor = application.tutor_id.clone();
                state
                    .application_mut(application_id)
                    .expect("application present after ownership check")
                    .status = ApplicationStatus::Rejected;
                Ok(tutor)
            },
        )?;

        let mut pending = Vec::new();
        if let Some(tutor_user) = self.identity.user_for_tutor(&tutor) {
            pending.push(PendingNotification {
                user: tutor_user,
                kind: NotificationKind::TutorApplicationRejected,
                message: "Your application was declined.".to_string(),
                related_id: application_id.0.clone(),
            });
        }
        dispatch_notifications(self.notifier.as_ref(), pending);

        Ok(())
    }

    /// Accepts a pending application, handing the confirmed match to the
    /// enrollment transactor.
    pub fn accept(
        &self,
        actor: &UserId,
        role: ActorRole,
        application_id: &ApplicationId,
        now: DateTime<Utc>,
    ) -> Result<ClassId, WorkflowError> {
        self.transactor
            .accept_application(actor, role, application_id, now)
    }

    /// The acting tutor's applications, newest first. Empty when the account
    /// has no tutor profile.
    pub fn my_applications(
        &self,
        tutor_user: &UserId,
    ) -> Result<Vec<TutorApplicationView>, WorkflowError> {
        let Some(tutor) = self.identity.tutor_profile_for_user(tutor_user) else {
            return Ok(Vec::new());
        };
        Ok(self.store.read(|state| {
            let mut views: Vec<TutorApplicationView> = state
                .applications_for_tutor(&tutor)
                .into_iter()
                .map(TutorApplicationView::from)
                .collect();
            views.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            views
        })?)
    }

    /// Applications targeting one of the actor's requests, newest first.
    pub fn applications_for_request(
        &self,
        actor: &UserId,
        role: ActorRole,
        request_id: &RequestId,
    ) -> Result<Vec<TutorApplicationView>, WorkflowError> {
        let identity = Arc::clone(&self.identity);
        Ok(self.store.read(move |state| {
            let request = state
                .request(request_id)
                .ok_or(WorkflowError::NotFound("class request"))?;
            ensure_request_ownership(identity.as_ref(), actor, role, request)?;
            let mut views: Vec<TutorApplicationView> = state
                .applications_for_request(request_id)
                .into_iter()
                .map(TutorApplicationView::from)
                .collect();
            views.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok::<_, WorkflowError>(views)
        })??)
    }
}
