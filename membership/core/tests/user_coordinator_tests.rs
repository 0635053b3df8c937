// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! User-side membership coordination against a recording Company peer.
//!
//! Covers existence checks before commit, the abort/degrade policies,
//! deferred propagation after commit (and never after a rollback),
//! compensated reassociation and the eager/deferred deletion policies.

mod common;

use common::{next_report, FailingCommitUsers, RecordingCompanyPeer};
use membership_core::application::propagation::UserPropagationHandler;
use membership_core::application::user_service::{StandardUserService, UserService};
use membership_core::domain::errors::{MembershipError, MembershipWarning};
use membership_core::domain::membership::{AssociationState, CompanyId, UserId, UserMembershipEvent};
use membership_core::domain::peer::CompanyPeer;
use membership_core::domain::repository::{PageRequest, UserRepository};
use membership_core::domain::service_config::{DeletionUnlink, MembershipPolicy, UnavailablePolicy};
use membership_core::domain::user::UserDraft;
use membership_core::infrastructure::propagation_channel::{PropagationChannel, PropagationWorker};
use membership_core::infrastructure::repositories::InMemoryUserRepository;
use std::sync::Arc;

struct Harness {
    service: StandardUserService,
    users: Arc<dyn UserRepository>,
    peer: Arc<RecordingCompanyPeer>,
    channel: Option<PropagationChannel<UserMembershipEvent>>,
}

impl Harness {
    fn new(peer: RecordingCompanyPeer, policy: MembershipPolicy) -> Self {
        let channel = PropagationChannel::new("user-service", 16);
        let users: Arc<dyn UserRepository> = Arc::new(InMemoryUserRepository::new(channel.sender()));
        let peer = Arc::new(peer);
        let service = StandardUserService::new(users.clone(), peer.clone(), policy);
        Self {
            service,
            users,
            peer,
            channel: Some(channel),
        }
    }

    /// Start delivering queued events; returns the worker and its report stream
    fn start_worker(
        &mut self,
    ) -> (
        PropagationWorker,
        tokio::sync::broadcast::Receiver<membership_core::infrastructure::PropagationReport>,
    ) {
        let channel = self.channel.take().expect("worker already started");
        let reports = channel.subscribe();
        let companies: Arc<dyn CompanyPeer> = self.peer.clone();
        let handler = Arc::new(UserPropagationHandler::new(companies, self.users.clone()));
        (channel.spawn(handler), reports)
    }
}

fn draft(phone: &str, company: Option<i64>) -> UserDraft {
    UserDraft {
        first_name: "Ivan".to_string(),
        last_name: "Petrov".to_string(),
        phone_number: phone.to_string(),
        company_id: company.map(CompanyId),
    }
}

fn degrade() -> MembershipPolicy {
    MembershipPolicy {
        on_peer_unavailable: UnavailablePolicy::Degrade,
        ..MembershipPolicy::default()
    }
}

#[tokio::test]
async fn test_create_with_existing_company_checks_once_then_defers_add() {
    let mut h = Harness::new(RecordingCompanyPeer::with_companies(&[7]), MembershipPolicy::default());

    let outcome = h.service.create_user(draft("+1000", Some(7))).await.unwrap();
    assert!(outcome.is_clean());
    assert_eq!(outcome.value.id, UserId(1));
    assert_eq!(outcome.value.company_id, Some(CompanyId(7)));

    // Only the existence check happened inside the request.
    assert_eq!(h.peer.calls(), vec!["exists 7"]);

    let (worker, mut reports) = h.start_worker();
    let report = next_report(&mut reports).await;
    assert!(report.is_delivered());
    assert_eq!(report.event_kind, "user_joined");
    assert_eq!(h.peer.calls(), vec!["exists 7", "add 7 1"]);
    assert_eq!(h.peer.members(7), vec![1]);
    worker.shutdown().await;
}

#[tokio::test]
async fn test_create_with_unknown_company_is_rejected_without_row() {
    let mut h = Harness::new(RecordingCompanyPeer::with_companies(&[7]), MembershipPolicy::default());

    let err = h.service.create_user(draft("+1000", Some(999))).await.unwrap_err();
    assert!(matches!(err, MembershipError::CounterpartNotFound { entity: "company", .. }));

    let page = h.users.list(PageRequest::default()).await.unwrap();
    assert_eq!(page.total_elements, 0);

    let (worker, _reports) = h.start_worker();
    worker.shutdown().await;
    assert_eq!(h.peer.calls(), vec!["exists 999"]);
}

#[tokio::test]
async fn test_unavailable_company_aborts_by_default() {
    let h = Harness::new(RecordingCompanyPeer::with_companies(&[7]), MembershipPolicy::default());
    h.peer.set_down(true);

    let err = h.service.create_user(draft("+1000", Some(7))).await.unwrap_err();
    assert!(matches!(err, MembershipError::PeerUnavailable { .. }));
    assert!(!h.users.exists(UserId(1)).await.unwrap());
}

#[tokio::test]
async fn test_degrade_stores_unpropagated_and_worker_repairs_flag() {
    let mut h = Harness::new(RecordingCompanyPeer::with_companies(&[7]), degrade());
    h.peer.set_down(true);

    let outcome = h.service.create_user(draft("+1000", Some(7))).await.unwrap();
    assert_eq!(outcome.value.association, AssociationState::Unpropagated);
    assert!(matches!(
        outcome.warnings.as_slice(),
        [MembershipWarning::AssociationUnpropagated { .. }]
    ));

    h.peer.set_down(false);
    let (worker, mut reports) = h.start_worker();
    assert!(next_report(&mut reports).await.is_delivered());
    worker.shutdown().await;

    let stored = h.users.find_by_id(outcome.value.id).await.unwrap().unwrap();
    assert_eq!(stored.association, AssociationState::Propagated);
}

#[tokio::test]
async fn test_failed_propagation_flags_user_and_is_not_retried() {
    let peer = RecordingCompanyPeer::with_companies(&[7]);
    peer.fail_add_to(7);
    let mut h = Harness::new(peer, MembershipPolicy::default());

    let user = h.service.create_user(draft("+1000", Some(7))).await.unwrap().value;
    let (worker, mut reports) = h.start_worker();
    assert!(!next_report(&mut reports).await.is_delivered());
    worker.shutdown().await;

    let stored = h.users.find_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(stored.association, AssociationState::Unpropagated);
    let adds = h.peer.calls().iter().filter(|c| c.starts_with("add")).count();
    assert_eq!(adds, 1);
}

#[tokio::test]
async fn test_rolled_back_create_never_propagates() {
    let channel = PropagationChannel::<UserMembershipEvent>::new("user-service", 16);
    let inner = InMemoryUserRepository::new(channel.sender());
    let users: Arc<dyn UserRepository> = Arc::new(FailingCommitUsers { inner });
    let peer = Arc::new(RecordingCompanyPeer::with_companies(&[7]));
    let service = StandardUserService::new(users.clone(), peer.clone(), MembershipPolicy::default());

    let err = service.create_user(draft("+1000", Some(7))).await.unwrap_err();
    assert!(matches!(err, MembershipError::Persistence(_)));

    let mut reports = channel.subscribe();
    let worker = channel.spawn(Arc::new(UserPropagationHandler::new(peer.clone(), users)));
    worker.shutdown().await;

    assert!(reports.try_recv().is_err());
    assert_eq!(peer.calls(), vec!["exists 7"]);
}

#[tokio::test]
async fn test_duplicate_phone_is_conflict() {
    let h = Harness::new(RecordingCompanyPeer::default(), MembershipPolicy::default());
    h.service.create_user(draft("+79001234567", None)).await.unwrap();

    let err = h.service.create_user(draft("+79001234567", None)).await.unwrap_err();
    assert!(matches!(err, MembershipError::Conflict(_)));
    assert!(h.peer.calls().is_empty());
}

#[tokio::test]
async fn test_reassociation_failure_restores_previous_company() {
    let peer = RecordingCompanyPeer::with_companies(&[1, 2]);
    peer.link(1, 1);
    peer.fail_add_to(2);
    let h = Harness::new(peer, degrade());

    // Seed directly so no propagation is involved.
    let mut tx = h.users.begin().await.unwrap();
    let seeded = tx
        .insert(membership_core::domain::user::NewUser::from_draft(
            &draft("+1000", Some(1)),
            AssociationState::Propagated,
        ))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let err = h
        .service
        .update_user(seeded.id, draft("+1000", Some(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, MembershipError::PeerUnavailable { .. }));

    assert_eq!(
        h.peer.calls(),
        vec!["exists 2", "remove 1 1", "add 2 1", "add 1 1"]
    );
    assert_eq!(h.peer.members(1), vec![1]);
    let stored = h.users.find_by_id(seeded.id).await.unwrap().unwrap();
    assert_eq!(stored.company_id, Some(CompanyId(1)));
}

#[tokio::test]
async fn test_reassociation_to_vanished_company_keeps_previous_company() {
    let peer = RecordingCompanyPeer::with_companies(&[1, 2]);
    peer.vanish_on_add(2);
    let h = Harness::new(peer, MembershipPolicy::default());
    let user = h.service.create_user(draft("+1000", Some(1))).await.unwrap().value;
    h.peer.link(1, user.id.0);

    let err = h.service.update_user(user.id, draft("+1000", Some(2))).await.unwrap_err();
    assert!(matches!(err, MembershipError::CounterpartNotFound { .. }));

    let stored = h.users.find_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(stored.company_id, Some(CompanyId(1)));
    assert_eq!(h.peer.members(1), vec![1]);
}

#[tokio::test]
async fn test_reassociation_moves_user_between_companies() {
    let peer = RecordingCompanyPeer::with_companies(&[1, 2]);
    let mut h = Harness::new(peer, MembershipPolicy::default());
    let user = h.service.create_user(draft("+1000", Some(1))).await.unwrap().value;
    let (worker, mut reports) = h.start_worker();
    next_report(&mut reports).await;

    let mut renamed = draft("+1000", Some(2));
    renamed.first_name = "Pyotr".to_string();
    let updated = h.service.update_user(user.id, renamed).await.unwrap().value;
    worker.shutdown().await;

    assert_eq!(updated.company_id, Some(CompanyId(2)));
    assert_eq!(updated.first_name, "Pyotr");
    assert!(h.peer.members(1).is_empty());
    assert_eq!(h.peer.members(2), vec![1]);
}

#[tokio::test]
async fn test_phone_number_cannot_change() {
    let h = Harness::new(RecordingCompanyPeer::default(), MembershipPolicy::default());
    let user = h.service.create_user(draft("+1000", None)).await.unwrap().value;

    let err = h.service.update_user(user.id, draft("+2000", None)).await.unwrap_err();
    assert!(matches!(err, MembershipError::Validation(_)));
}

#[tokio::test]
async fn test_deferred_delete_unlinks_after_commit() {
    let peer = RecordingCompanyPeer::with_companies(&[7]);
    let mut h = Harness::new(peer, MembershipPolicy::default());
    let user = h.service.create_user(draft("+1000", Some(7))).await.unwrap().value;

    let outcome = h.service.delete_user(user.id).await.unwrap();
    assert!(outcome.is_clean());
    assert!(!h.users.exists(user.id).await.unwrap());
    assert_eq!(h.peer.calls(), vec!["exists 7"]);

    let (worker, mut reports) = h.start_worker();
    let joined = next_report(&mut reports).await;
    assert_eq!(joined.event_kind, "user_joined");
    assert!(joined.is_superseded());
    assert_eq!(next_report(&mut reports).await.event_kind, "user_left");
    worker.shutdown().await;
    assert!(h.peer.members(7).is_empty());
    assert!(!h.peer.calls().iter().any(|c| c.starts_with("add")));
}

#[tokio::test]
async fn test_queued_join_is_superseded_by_later_reassociation() {
    let peer = RecordingCompanyPeer::with_companies(&[7, 8]);
    let mut h = Harness::new(peer, MembershipPolicy::default());
    let user = h.service.create_user(draft("+1000", Some(7))).await.unwrap().value;

    // Moved before the join for company 7 is delivered.
    h.service.update_user(user.id, draft("+1000", Some(8))).await.unwrap();

    let (worker, mut reports) = h.start_worker();
    let report = next_report(&mut reports).await;
    assert_eq!(report.event_kind, "user_joined");
    assert!(report.is_superseded());
    worker.shutdown().await;

    assert!(h.peer.members(7).is_empty());
    assert_eq!(h.peer.members(8), vec![1]);
    assert_eq!(
        h.peer.calls(),
        vec!["exists 7", "exists 8", "remove 7 1", "add 8 1"]
    );
    let stored = h.users.find_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(stored.company_id, Some(CompanyId(8)));
    assert_eq!(stored.association, AssociationState::Propagated);
}

#[tokio::test]
async fn test_eager_delete_with_peer_down_warns_and_deletes() {
    let policy = MembershipPolicy {
        deletion_unlink: DeletionUnlink::Eager,
        ..MembershipPolicy::default()
    };
    let h = Harness::new(RecordingCompanyPeer::with_companies(&[7]), policy);
    let user = h.service.create_user(draft("+1000", Some(7))).await.unwrap().value;
    h.peer.set_down(true);

    let outcome = h.service.delete_user(user.id).await.unwrap();
    assert!(matches!(
        outcome.warnings.as_slice(),
        [MembershipWarning::RemoteUnlinkFailed { .. }]
    ));
    assert!(!h.users.exists(user.id).await.unwrap());
}

#[tokio::test]
async fn test_delete_unknown_user_is_not_found() {
    let h = Harness::new(RecordingCompanyPeer::default(), MembershipPolicy::default());
    let err = h.service.delete_user(UserId(42)).await.unwrap_err();
    assert!(matches!(err, MembershipError::NotFound { .. }));
}

#[tokio::test]
async fn test_reads_distinguish_missing_and_unavailable_company() {
    let h = Harness::new(RecordingCompanyPeer::with_companies(&[7]), MembershipPolicy::default());
    let user = h.service.create_user(draft("+1000", Some(7))).await.unwrap().value;

    let view = h.service.get_user(user.id).await.unwrap();
    assert_eq!(view.company.as_ref().map(|c| c.id), Some(CompanyId(7)));
    assert!(view.company_load_error.is_none());

    h.peer.set_down(true);
    let view = h.service.get_user(user.id).await.unwrap();
    assert!(view.company.is_none());
    let message = view.company_load_error.unwrap();
    assert!(message.starts_with("Failed to load data"), "{}", message);
}

#[tokio::test]
async fn test_list_fetches_each_company_once() {
    let h = Harness::new(RecordingCompanyPeer::with_companies(&[7]), MembershipPolicy::default());
    h.service.create_user(draft("+1000", Some(7))).await.unwrap();
    h.service.create_user(draft("+2000", Some(7))).await.unwrap();

    let page = h.service.list_users(PageRequest::new(0, 10)).await.unwrap();
    assert_eq!(page.total_elements, 2);
    let fetches = h.peer.calls().iter().filter(|c| c.starts_with("fetch")).count();
    assert_eq!(fetches, 1);
}

#[tokio::test]
async fn test_attach_reports_previous_company_without_calling_back() {
    let h = Harness::new(RecordingCompanyPeer::default(), MembershipPolicy::default());
    let user = h.service.create_user(draft("+1000", None)).await.unwrap().value;

    let ack = h.service.attach_company(CompanyId(3), user.id).await.unwrap();
    assert_eq!(ack.previous_company_id, None);
    let ack = h.service.attach_company(CompanyId(4), user.id).await.unwrap();
    assert_eq!(ack.previous_company_id, Some(CompanyId(3)));

    // Detaching from a company the user no longer belongs to is a no-op.
    h.service.detach_company(CompanyId(3), user.id).await.unwrap();
    let stored = h.users.find_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(stored.company_id, Some(CompanyId(4)));

    h.service.detach_company(CompanyId(4), user.id).await.unwrap();
    let stored = h.users.find_by_id(user.id).await.unwrap().unwrap();
    assert_eq!(stored.company_id, None);
    assert!(h.peer.calls().is_empty());
}
