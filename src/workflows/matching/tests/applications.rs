use chrono::Duration;

use super::common::*;
use crate::workflows::matching::applications::ApplicationOffer;
use crate::workflows::matching::domain::{ActorRole, ApplicationStatus, RequestId};
use crate::workflows::matching::error::WorkflowError;
use crate::workflows::matching::gateways::NotificationKind;
use crate::workflows::matching::store::{StoreState, WorkflowStore};

fn open_request(env: &TestEnv) -> RequestId {
    env.requests
        .create(&user("u-student"), ActorRole::Student, math_draft(None), now())
        .expect("request created")
        .id
}

#[test]
fn submit_creates_a_pending_application_and_notifies_the_owner() {
    let env = build_env();
    let request = open_request(&env);

    let view = env
        .applications
        .submit(
            &user("u-tutor"),
            &request,
            ApplicationOffer {
                meeting_link: Some("https://meet.example/algebra".to_string()),
            },
            now(),
        )
        .expect("application submitted");

    assert_eq!(view.status, ApplicationStatus::Pending);
    assert_eq!(view.class_request_id, request);
    assert_eq!(
        env.sink.kinds_for("u-student"),
        vec![NotificationKind::TutorApplicationReceived]
    );
}

#[test]
fn submit_requires_an_existing_request() {
    let env = build_env();
    let outcome = env.applications.submit(
        &user("u-tutor"),
        &RequestId("req-missing".to_string()),
        ApplicationOffer::default(),
        now(),
    );
    assert!(matches!(outcome, Err(WorkflowError::NotFound("class request"))));
}

#[test]
fn submit_requires_a_tutor_profile() {
    let env = build_env();
    let request = open_request(&env);
    let outcome = env
        .applications
        .submit(&user("u-student"), &request, ApplicationOffer::default(), now());
    assert!(matches!(outcome, Err(WorkflowError::Unauthorized(_))));
}

#[test]
fn one_application_per_tutor_per_request_whatever_its_status() {
    let env = build_env();
    let request = open_request(&env);
    let first = env
        .applications
        .submit(&user("u-tutor"), &request, ApplicationOffer::default(), now())
        .expect("first application");

    let again = env
        .applications
        .submit(&user("u-tutor"), &request, ApplicationOffer::default(), now());
    assert!(matches!(again, Err(WorkflowError::Duplicate(_))));

    // Even a rejected application keeps the slot occupied.
    env.applications
        .reject(&user("u-student"), ActorRole::Student, &first.id)
        .expect("rejected");
    let after_reject = env
        .applications
        .submit(&user("u-tutor"), &request, ApplicationOffer::default(), now());
    assert!(matches!(after_reject, Err(WorkflowError::Duplicate(_))));
}

#[test]
fn withdrawing_deletes_the_row_and_frees_the_slot() {
    let env = build_env();
    let request = open_request(&env);
    let view = env
        .applications
        .submit(&user("u-tutor"), &request, ApplicationOffer::default(), now())
        .expect("application submitted");

    env.applications
        .withdraw(&user("u-tutor"), &view.id)
        .expect("withdrawn");

    let gone = env
        .store
        .read(|state| state.application(&view.id).is_none())
        .expect("read");
    assert!(gone, "withdraw hard-deletes the row");

    env.applications
        .submit(&user("u-tutor"), &request, ApplicationOffer::default(), now())
        .expect("slot is free again");
}

#[test]
fn withdraw_is_only_legal_while_pending() {
    let env = build_env();
    let request = open_request(&env);
    let view = env
        .applications
        .submit(&user("u-tutor"), &request, ApplicationOffer::default(), now())
        .expect("application submitted");

    env.store
        .transaction(&mut |state: &mut StoreState| {
            state.application_mut(&view.id).expect("present").status =
                ApplicationStatus::Accepted;
            Ok(())
        })
        .expect("seeded");

    let outcome = env.applications.withdraw(&user("u-tutor"), &view.id);
    assert!(matches!(
        outcome,
        Err(WorkflowError::InvalidState { status: "accepted" })
    ));
}

#[test]
fn a_tutor_cannot_withdraw_someone_elses_application() {
    let env = build_env();
    let request = open_request(&env);
    let view = env
        .applications
        .submit(&user("u-tutor"), &request, ApplicationOffer::default(), now())
        .expect("application submitted");

    let outcome = env.applications.withdraw(&user("u-tutor2"), &view.id);
    assert!(matches!(outcome, Err(WorkflowError::NotFound(_))));
}

#[test]
fn reject_requires_request_ownership_and_notifies_the_tutor() {
    let env = build_env();
    let request = open_request(&env);
    let view = env
        .applications
        .submit(&user("u-tutor"), &request, ApplicationOffer::default(), now())
        .expect("application submitted");

    let outcome = env
        .applications
        .reject(&user("u-student2"), ActorRole::Student, &view.id);
    assert!(matches!(outcome, Err(WorkflowError::Unauthorized(_))));

    env.applications
        .reject(&user("u-parent"), ActorRole::Parent, &view.id)
        .expect("linked parent may reject");

    let status = env
        .store
        .read(|state| state.application(&view.id).map(|a| a.status))
        .expect("read");
    assert_eq!(status, Some(ApplicationStatus::Rejected));
    assert_eq!(
        env.sink.kinds_for("u-tutor"),
        vec![NotificationKind::TutorApplicationRejected]
    );

    let again = env
        .applications
        .reject(&user("u-parent"), ActorRole::Parent, &view.id);
    assert!(matches!(again, Err(WorkflowError::InvalidState { .. })));
}

#[test]
fn my_applications_lists_newest_first() {
    let env = build_env();
    let first = open_request(&env);
    let second = env
        .requests
        .create(&user("u-student2"), ActorRole::Student, math_draft(None), now())
        .expect("request created")
        .id;

    env.applications
        .submit(&user("u-tutor"), &first, ApplicationOffer::default(), now())
        .expect("application submitted");
    env.applications
        .submit(
            &user("u-tutor"),
            &second,
            ApplicationOffer::default(),
            now() + Duration::hours(1),
        )
        .expect("application submitted");

    let mine = env
        .applications
        .my_applications(&user("u-tutor"))
        .expect("listing");
    assert_eq!(mine.len(), 2);
    assert_eq!(mine[0].class_request_id, second);

    assert!(env
        .applications
        .my_applications(&user("u-student"))
        .expect("listing")
        .is_empty());
}

#[test]
fn applications_for_request_is_owner_only() {
    let env = build_env();
    let request = open_request(&env);
    env.applications
        .submit(&user("u-tutor"), &request, ApplicationOffer::default(), now())
        .expect("application submitted");
    env.applications
        .submit(&user("u-tutor2"), &request, ApplicationOffer::default(), now())
        .expect("application submitted");

    let listed = env
        .applications
        .applications_for_request(&user("u-student"), ActorRole::Student, &request)
        .expect("owner lists");
    assert_eq!(listed.len(), 2);

    let outcome =
        env.applications
            .applications_for_request(&user("u-student2"), ActorRole::Student, &request);
    assert!(matches!(outcome, Err(WorkflowError::Unauthorized(_))));
}
