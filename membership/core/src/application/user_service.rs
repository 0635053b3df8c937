// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # User Service (Membership Coordinator, user side)
//!
//! Runs every User mutation that touches a membership:
//!
//! | Operation | Remote calls | Timing |
//! |-----------|--------------|--------|
//! | `create_user` | `exists(company)` | before commit |
//! | | `add_membership(company, user)` | deferred, after commit |
//! | `update_user` (reassociation) | `exists(new)`, `remove(old)`, `add(new)` | before commit, compensated on failure |
//! | `delete_user` | `remove_membership(company, user)` | deferred, or eager before the delete |
//!
//! `attach_company` / `detach_company` are the passive side used by the
//! Company service: they only touch the local half and never call back.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::mutation::{CompensationLog, MutationTracker};
use crate::domain::errors::{MembershipError, MembershipWarning, MutationOutcome};
use crate::domain::membership::{
    AssociationState, CompanyId, CompanySnapshot, MembershipAck, PeerError, UserId,
    UserMembershipEvent, UserSnapshot,
};
use crate::domain::peer::CompanyPeer;
use crate::domain::repository::{Page, PageRequest, UserRepository};
use crate::domain::service_config::{DeletionUnlink, MembershipPolicy, UnavailablePolicy};
use crate::domain::user::{NewUser, User, UserDraft};

/// A user together with its company, as returned by reads
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserView {
    #[serde(flatten)]
    pub user: User,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<CompanySnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_load_error: Option<String>,
}

impl UserView {
    fn bare(user: User) -> Self {
        Self {
            user,
            company: None,
            company_load_error: None,
        }
    }
}

/// Describe a failed enrichment read; not-found and unavailable stay distinct
pub(crate) fn load_error(err: &PeerError) -> String {
    match err {
        PeerError::CounterpartNotFound { entity, id, .. } => {
            format!("{} not found with id: {}", capitalize(entity), id)
        }
        PeerError::PeerUnavailable { peer, reason } => {
            format!("Failed to load data: {} is unavailable ({})", peer, reason)
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
pub trait UserService: Send + Sync {
    async fn create_user(&self, draft: UserDraft) -> Result<MutationOutcome<User>, MembershipError>;

    async fn get_user(&self, id: UserId) -> Result<UserView, MembershipError>;

    async fn list_users(&self, page: PageRequest) -> Result<Page<UserView>, MembershipError>;

    /// Plain records for the given IDs, without enrichment; unknown IDs are skipped
    async fn users_batch(&self, ids: &[UserId]) -> Result<Vec<UserSnapshot>, MembershipError>;

    async fn user_exists(&self, id: UserId) -> Result<bool, MembershipError>;

    /// Rename and/or reassociate a user. The phone number cannot change.
    async fn update_user(
        &self,
        id: UserId,
        draft: UserDraft,
    ) -> Result<MutationOutcome<User>, MembershipError>;

    async fn delete_user(&self, id: UserId) -> Result<MutationOutcome<()>, MembershipError>;

    /// Peer-initiated: point the user at `company_id`; never calls back
    async fn attach_company(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<MembershipAck, MembershipError>;

    /// Peer-initiated: clear the user's company if it is `company_id`; never calls back
    async fn detach_company(&self, company_id: CompanyId, user_id: UserId) -> Result<(), MembershipError>;
}

pub struct StandardUserService {
    users: Arc<dyn UserRepository>,
    companies: Arc<dyn CompanyPeer>,
    policy: MembershipPolicy,
}

impl StandardUserService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        companies: Arc<dyn CompanyPeer>,
        policy: MembershipPolicy,
    ) -> Self {
        Self {
            users,
            companies,
            policy,
        }
    }

    async fn enrich(&self, user: User, cache: &mut HashMap<CompanyId, Result<CompanySnapshot, PeerError>>) -> UserView {
        let Some(company_id) = user.company_id else {
            return UserView::bare(user);
        };
        let result = match cache.get(&company_id) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = self.companies.fetch_snapshot(company_id).await;
                cache.insert(company_id, fetched.clone());
                fetched
            }
        };
        match result {
            Ok(company) => UserView {
                user,
                company: Some(company),
                company_load_error: None,
            },
            Err(e) => {
                warn!(user_id = %user.id, company_id = %company_id, error = %e, "Failed to load company for user");
                UserView {
                    user,
                    company: None,
                    company_load_error: Some(load_error(&e)),
                }
            }
        }
    }

    async fn create_inner(
        &self,
        draft: UserDraft,
        tracker: &mut MutationTracker,
    ) -> Result<MutationOutcome<User>, MembershipError> {
        draft.validate()?;

        let mut tx = self.users.begin().await?;
        if tx.phone_taken(draft.phone_number.trim()).await? {
            return Err(MembershipError::conflict(format!(
                "User with phone number {} already exists",
                draft.phone_number.trim()
            )));
        }

        let mut association = AssociationState::Propagated;
        let mut warnings = Vec::new();

        if let Some(company_id) = draft.company_id {
            match self.companies.exists(company_id).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(MembershipError::CounterpartNotFound {
                        entity: "company",
                        id: company_id.to_string(),
                    })
                }
                Err(e @ PeerError::CounterpartNotFound { .. }) => return Err(e.into()),
                Err(e @ PeerError::PeerUnavailable { .. }) => match self.policy.on_peer_unavailable {
                    UnavailablePolicy::Abort => return Err(e.into()),
                    UnavailablePolicy::Degrade => {
                        warn!(
                            company_id = %company_id,
                            error = %e,
                            "Company service unavailable; storing user with unpropagated association"
                        );
                        association = AssociationState::Unpropagated;
                        warnings.push(MembershipWarning::AssociationUnpropagated {
                            reason: e.to_string(),
                        });
                    }
                },
            }
        }

        let user = tx.insert(NewUser::from_draft(&draft, association)).await?;
        tracker.identify(user.id);
        if let Some(company_id) = user.company_id {
            tx.after_commit(UserMembershipEvent::joined(user.id, company_id));
        }
        tx.commit().await?;

        Ok(MutationOutcome::with_warnings(user, warnings))
    }

    async fn update_inner(
        &self,
        id: UserId,
        draft: UserDraft,
    ) -> Result<MutationOutcome<User>, MembershipError> {
        draft.validate()?;

        let mut tx = self.users.begin().await?;
        let mut user = tx
            .find_for_update(id)
            .await?
            .ok_or_else(|| MembershipError::not_found("User", id))?;
        user.ensure_same_phone(&draft)?;

        let old = user.company_id;
        let new = draft.company_id;
        let mut log = CompensationLog::new();

        if old != new {
            debug!(user_id = %id, ?old, ?new, "Reassociating user");

            if let Some(new_id) = new {
                match self.companies.exists(new_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(MembershipError::CounterpartNotFound {
                            entity: "company",
                            id: new_id.to_string(),
                        })
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if let Some(old_id) = old {
                match self.companies.remove_membership(old_id, id).await {
                    Ok(()) => log.unlinked(old_id, id),
                    Err(e) if e.is_not_found() => {
                        debug!(user_id = %id, company_id = %old_id, "Previous company already gone");
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if let Some(new_id) = new {
                if let Err(e) = self.companies.add_membership(new_id, id).await {
                    warn!(user_id = %id, company_id = %new_id, error = %e, "Reassociation add failed; compensating");
                    log.unwind(self.companies.as_ref()).await;
                    return Err(e.into());
                }
                log.linked(new_id, id);
            }

            user.company_id = new;
            user.association = AssociationState::Propagated;
        }

        user.rename(&draft);

        let persisted = match tx.update(&user).await {
            Ok(()) => tx.commit().await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            if !log.is_empty() {
                warn!(user_id = %id, error = %e, "Local update failed after remote reassociation; compensating");
                log.unwind(self.companies.as_ref()).await;
            }
            return Err(e.into());
        }

        Ok(MutationOutcome::clean(user))
    }

    async fn delete_inner(&self, id: UserId) -> Result<(MutationOutcome<()>, &'static str), MembershipError> {
        let mut tx = self.users.begin().await?;
        let user = tx
            .find_for_update(id)
            .await?
            .ok_or_else(|| MembershipError::not_found("User", id))?;

        let mut warnings = Vec::new();
        let mut log = CompensationLog::new();
        let mut how = "none";

        if let Some(company_id) = user.company_id {
            match self.policy.deletion_unlink {
                DeletionUnlink::Deferred => {
                    tx.after_commit(UserMembershipEvent::left(id, company_id));
                    how = "deferred";
                }
                DeletionUnlink::Eager => {
                    how = "eager";
                    match self.companies.remove_membership(company_id, id).await {
                        Ok(()) => log.unlinked(company_id, id),
                        Err(e) if e.is_not_found() => {
                            debug!(user_id = %id, company_id = %company_id, "Company already gone; nothing to unlink");
                        }
                        Err(e) => {
                            warn!(
                                user_id = %id,
                                company_id = %company_id,
                                error = %e,
                                "Could not unlink user from company; deleting locally anyway"
                            );
                            warnings.push(MembershipWarning::RemoteUnlinkFailed {
                                counterpart: format!("company {}", company_id),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        }

        let persisted = match tx.delete(id).await {
            Ok(()) => tx.commit().await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            log.unwind(self.companies.as_ref()).await;
            return Err(e.into());
        }

        Ok((MutationOutcome::with_warnings((), warnings), how))
    }
}

#[async_trait]
impl UserService for StandardUserService {
    async fn create_user(&self, draft: UserDraft) -> Result<MutationOutcome<User>, MembershipError> {
        let mut tracker = MutationTracker::begin("create_user", "new user");
        let outcome = self
            .create_inner(draft, &mut tracker)
            .await
            .map_err(|e| tracker.abort(e))?;

        let how = if outcome.value.company_id.is_some() { "deferred" } else { "none" };
        tracker.finish(how);
        info!(
            user_id = %outcome.value.id,
            company_id = ?outcome.value.company_id,
            association = outcome.value.association.as_str(),
            "User created"
        );
        Ok(outcome)
    }

    async fn get_user(&self, id: UserId) -> Result<UserView, MembershipError> {
        let user = self
            .users
            .find_by_id(id)
            .await?
            .ok_or_else(|| MembershipError::not_found("User", id))?;
        let mut cache = HashMap::new();
        Ok(self.enrich(user, &mut cache).await)
    }

    async fn list_users(&self, page: PageRequest) -> Result<Page<UserView>, MembershipError> {
        let page = self.users.list(page).await?;
        let mut cache = HashMap::new();
        let mut content = Vec::with_capacity(page.content.len());
        for user in page.content {
            content.push(self.enrich(user, &mut cache).await);
        }
        debug!(count = content.len(), total = page.total_elements, "Listed users");
        Ok(Page {
            content,
            page: page.page,
            size: page.size,
            total_elements: page.total_elements,
        })
    }

    async fn users_batch(&self, ids: &[UserId]) -> Result<Vec<UserSnapshot>, MembershipError> {
        let users = self.users.find_by_ids(ids).await?;
        Ok(users.iter().map(User::snapshot).collect())
    }

    async fn user_exists(&self, id: UserId) -> Result<bool, MembershipError> {
        Ok(self.users.exists(id).await?)
    }

    async fn update_user(
        &self,
        id: UserId,
        draft: UserDraft,
    ) -> Result<MutationOutcome<User>, MembershipError> {
        let mut tracker = MutationTracker::begin("update_user", id);
        let outcome = self
            .update_inner(id, draft)
            .await
            .map_err(|e| tracker.abort(e))?;

        tracker.finish("synchronous");
        info!(user_id = %id, company_id = ?outcome.value.company_id, "User updated");
        Ok(outcome)
    }

    async fn delete_user(&self, id: UserId) -> Result<MutationOutcome<()>, MembershipError> {
        let mut tracker = MutationTracker::begin("delete_user", id);
        let (outcome, how) = self.delete_inner(id).await.map_err(|e| tracker.abort(e))?;

        tracker.finish(how);
        info!(user_id = %id, warnings = outcome.warnings.len(), "User deleted");
        Ok(outcome)
    }

    async fn attach_company(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<MembershipAck, MembershipError> {
        let mut tx = self.users.begin().await?;
        let mut user = tx
            .find_for_update(user_id)
            .await?
            .ok_or_else(|| MembershipError::not_found("User", user_id))?;

        let previous = user.company_id;
        user.company_id = Some(company_id);
        user.association = AssociationState::Propagated;
        tx.update(&user).await?;
        tx.commit().await?;

        info!(user_id = %user_id, company_id = %company_id, previous = ?previous, "User attached to company by peer");
        Ok(MembershipAck {
            previous_company_id: previous.filter(|p| *p != company_id),
        })
    }

    async fn detach_company(&self, company_id: CompanyId, user_id: UserId) -> Result<(), MembershipError> {
        let mut tx = self.users.begin().await?;
        let mut user = tx
            .find_for_update(user_id)
            .await?
            .ok_or_else(|| MembershipError::not_found("User", user_id))?;

        if user.company_id != Some(company_id) {
            debug!(
                user_id = %user_id,
                company_id = %company_id,
                current = ?user.company_id,
                "User not attached to this company; detach is a no-op"
            );
            return Ok(());
        }

        user.company_id = None;
        user.association = AssociationState::Propagated;
        tx.update(&user).await?;
        tx.commit().await?;

        info!(user_id = %user_id, company_id = %company_id, "User detached from company by peer");
        Ok(())
    }
}
