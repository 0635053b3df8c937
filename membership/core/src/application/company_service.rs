// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Company Service (Membership Coordinator, company side)
//!
//! | Operation | Remote calls | Timing |
//! |-----------|--------------|--------|
//! | `create_company` | `exists(user)` per employee | before commit |
//! | | `add_membership` per employee | deferred, after commit |
//! | `update_company` (employee diff) | `remove` per dropped, `exists` + `add` per new | before commit, compensated on failure |
//! | `delete_company` | `remove_membership` per employee | deferred, or eager before the delete |
//! | `add_employee` | `exists(user)`, `add_membership` | before commit, compensated on failure |
//! | `remove_employee` | `remove_membership` | before commit |
//!
//! `add_member` / `remove_member` are the passive side used by the User
//! service and never call back.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::application::mutation::{CompensationLog, MutationTracker};
use crate::application::user_service::load_error;
use crate::domain::company::{Company, CompanyDraft, NewCompany};
use crate::domain::errors::{MembershipError, MembershipWarning, MutationOutcome};
use crate::domain::membership::{
    AssociationState, CompanyId, CompanyMembershipEvent, PeerError, UserId, UserSnapshot,
};
use crate::domain::peer::{UserPeer, USER_PEER};
use crate::domain::repository::{CompanyRepository, Page, PageRequest, RepositoryError};
use crate::domain::service_config::{DeletionUnlink, MembershipPolicy, UnavailablePolicy};

/// A company together with its employees, as returned by reads
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanyView {
    #[serde(flatten)]
    pub company: Company,
    pub employees: Vec<UserSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employees_load_error: Option<String>,
}

#[async_trait]
pub trait CompanyService: Send + Sync {
    async fn create_company(&self, draft: CompanyDraft) -> Result<MutationOutcome<Company>, MembershipError>;

    async fn get_company(&self, id: CompanyId) -> Result<CompanyView, MembershipError>;

    async fn list_companies(&self, page: PageRequest) -> Result<Page<CompanyView>, MembershipError>;

    async fn company_exists(&self, id: CompanyId) -> Result<bool, MembershipError>;

    /// Replace name and budget; when `employee_ids` is present, also reconcile the employee set
    async fn update_company(
        &self,
        id: CompanyId,
        draft: CompanyDraft,
    ) -> Result<MutationOutcome<Company>, MembershipError>;

    async fn delete_company(&self, id: CompanyId) -> Result<MutationOutcome<()>, MembershipError>;

    async fn add_employee(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<MutationOutcome<Company>, MembershipError>;

    async fn remove_employee(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<MutationOutcome<Company>, MembershipError>;

    /// Peer-initiated: list `user_id` as an employee; never calls back
    async fn add_member(&self, company_id: CompanyId, user_id: UserId) -> Result<(), MembershipError>;

    /// Peer-initiated: forget `user_id`; never calls back
    async fn remove_member(&self, company_id: CompanyId, user_id: UserId) -> Result<(), MembershipError>;
}

/// Remove `user_id` from a company that no longer owns them (local only).
/// Used after the User service reports the user's previous company.
pub(crate) async fn drop_stale_employee(
    companies: &dyn CompanyRepository,
    company_id: CompanyId,
    user_id: UserId,
) -> Result<bool, RepositoryError> {
    let mut tx = companies.begin().await?;
    let Some(mut company) = tx.find_for_update(company_id).await? else {
        return Ok(false);
    };
    if !company.remove_employee(user_id) {
        return Ok(false);
    }
    tx.update(&company).await?;
    tx.commit().await?;
    debug!(company_id = %company_id, user_id = %user_id, "Dropped stale employee from previous company");
    Ok(true)
}

pub struct StandardCompanyService {
    companies: Arc<dyn CompanyRepository>,
    users: Arc<dyn UserPeer>,
    policy: MembershipPolicy,
}

impl StandardCompanyService {
    pub fn new(
        companies: Arc<dyn CompanyRepository>,
        users: Arc<dyn UserPeer>,
        policy: MembershipPolicy,
    ) -> Self {
        Self {
            companies,
            users,
            policy,
        }
    }

    async fn enrich(&self, company: Company) -> CompanyView {
        if company.employee_ids.is_empty() {
            return CompanyView {
                company,
                employees: Vec::new(),
                employees_load_error: None,
            };
        }

        let ids: Vec<UserId> = company.employee_ids.iter().copied().collect();
        match self.users.fetch_batch(&ids).await {
            Ok(mut found) => {
                let missing: Vec<String> = ids
                    .iter()
                    .filter(|id| !found.contains_key(*id))
                    .map(|id| id.to_string())
                    .collect();
                let employees = ids.iter().filter_map(|id| found.remove(id)).collect();
                let employees_load_error = if missing.is_empty() {
                    None
                } else {
                    warn!(company_id = %company.id, missing = ?missing, "Employees unknown to user service");
                    Some(format!("Users not found with ids: {}", missing.join(", ")))
                };
                CompanyView {
                    company,
                    employees,
                    employees_load_error,
                }
            }
            Err(e) => {
                warn!(company_id = %company.id, error = %e, "Failed to load employees for company");
                CompanyView {
                    company,
                    employees: Vec::new(),
                    employees_load_error: Some(load_error(&e)),
                }
            }
        }
    }

    /// Confirm `user_id` exists remotely before the local write
    async fn require_user(&self, user_id: UserId) -> Result<(), PeerError> {
        match self.users.exists(user_id).await? {
            true => Ok(()),
            false => Err(PeerError::not_found(USER_PEER, "user", user_id)),
        }
    }

    /// Best-effort local cleanup after users moved here from other companies
    async fn drop_from_previous(&self, moved: Vec<(CompanyId, UserId)>) {
        for (previous, user_id) in moved {
            if let Err(e) = drop_stale_employee(self.companies.as_ref(), previous, user_id).await {
                error!(
                    company_id = %previous,
                    user_id = %user_id,
                    error = %e,
                    "Failed to drop moved employee from previous company"
                );
            }
        }
    }

    async fn create_inner(
        &self,
        draft: CompanyDraft,
        tracker: &mut MutationTracker,
    ) -> Result<(MutationOutcome<Company>, &'static str), MembershipError> {
        draft.validate()?;

        let mut tx = self.companies.begin().await?;
        if tx.name_taken(draft.name.trim(), None).await? {
            return Err(MembershipError::conflict(format!(
                "Company with name {} already exists",
                draft.name.trim()
            )));
        }

        let employees = draft.employees();
        let mut association = AssociationState::Propagated;
        let mut warnings = Vec::new();

        for user_id in &employees {
            match self.require_user(*user_id).await {
                Ok(()) => {}
                Err(e @ PeerError::CounterpartNotFound { .. }) => return Err(e.into()),
                Err(e @ PeerError::PeerUnavailable { .. }) => match self.policy.on_peer_unavailable {
                    UnavailablePolicy::Abort => return Err(e.into()),
                    UnavailablePolicy::Degrade => {
                        warn!(
                            user_id = %user_id,
                            error = %e,
                            "User service unavailable; storing company with unpropagated association"
                        );
                        association = AssociationState::Unpropagated;
                        warnings.push(MembershipWarning::AssociationUnpropagated {
                            reason: e.to_string(),
                        });
                        // One warning covers the rest of the set.
                        break;
                    }
                },
            }
        }

        let company = tx.insert(NewCompany::from_draft(&draft, association)).await?;
        tracker.identify(company.id);
        let how = if employees.is_empty() {
            "none"
        } else {
            tx.after_commit(CompanyMembershipEvent::formed(company.id, employees));
            "deferred"
        };
        tx.commit().await?;

        Ok((MutationOutcome::with_warnings(company, warnings), how))
    }

    async fn update_inner(
        &self,
        id: CompanyId,
        draft: CompanyDraft,
    ) -> Result<(Company, Vec<(CompanyId, UserId)>), MembershipError> {
        draft.validate()?;

        let mut tx = self.companies.begin().await?;
        let mut company = tx
            .find_for_update(id)
            .await?
            .ok_or_else(|| MembershipError::not_found("Company", id))?;

        if tx.name_taken(draft.name.trim(), Some(id)).await? {
            return Err(MembershipError::conflict(format!(
                "Company with name {} already exists",
                draft.name.trim()
            )));
        }

        let mut log = CompensationLog::new();
        let mut moved = Vec::new();

        if let Some(target) = &draft.employee_ids {
            let removed: BTreeSet<UserId> = company.employee_ids.difference(target).copied().collect();
            let added: BTreeSet<UserId> = target.difference(&company.employee_ids).copied().collect();
            debug!(company_id = %id, ?removed, ?added, "Reconciling employee set");

            let synced = self.sync_employee_diff(id, &removed, &added, &mut log, &mut moved).await;
            if let Err(e) = synced {
                warn!(company_id = %id, error = %e, "Employee reconciliation failed; compensating");
                log.unwind(self.users.as_ref()).await;
                return Err(e);
            }
            company.association = AssociationState::Propagated;
        }

        company.apply_draft(&draft);

        let persisted = match tx.update(&company).await {
            Ok(()) => tx.commit().await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            if !log.is_empty() {
                warn!(company_id = %id, error = %e, "Local update failed after remote changes; compensating");
                log.unwind(self.users.as_ref()).await;
            }
            return Err(e.into());
        }

        Ok((company, moved))
    }

    async fn sync_employee_diff(
        &self,
        company_id: CompanyId,
        removed: &BTreeSet<UserId>,
        added: &BTreeSet<UserId>,
        log: &mut CompensationLog,
        moved: &mut Vec<(CompanyId, UserId)>,
    ) -> Result<(), MembershipError> {
        for user_id in removed {
            match self.users.remove_membership(company_id, *user_id).await {
                Ok(()) => log.unlinked(company_id, *user_id),
                Err(e) if e.is_not_found() => {
                    debug!(user_id = %user_id, "Removed employee no longer exists remotely");
                }
                Err(e) => return Err(e.into()),
            }
        }

        for user_id in added {
            self.require_user(*user_id).await?;
            let previous = self.users.add_membership(company_id, *user_id).await?;
            log.linked(company_id, *user_id);
            if let Some(previous) = previous {
                moved.push((previous, *user_id));
            }
        }
        Ok(())
    }

    async fn delete_inner(
        &self,
        id: CompanyId,
    ) -> Result<(MutationOutcome<()>, &'static str), MembershipError> {
        let mut tx = self.companies.begin().await?;
        let company = tx
            .find_for_update(id)
            .await?
            .ok_or_else(|| MembershipError::not_found("Company", id))?;

        let mut warnings = Vec::new();
        let mut log = CompensationLog::new();
        let mut how = "none";

        if !company.employee_ids.is_empty() {
            match self.policy.deletion_unlink {
                DeletionUnlink::Deferred => {
                    tx.after_commit(CompanyMembershipEvent::dissolved(id, company.employee_ids.clone()));
                    how = "deferred";
                }
                DeletionUnlink::Eager => {
                    how = "eager";
                    for user_id in &company.employee_ids {
                        match self.users.remove_membership(id, *user_id).await {
                            Ok(()) => log.unlinked(id, *user_id),
                            Err(e) if e.is_not_found() => {
                                debug!(user_id = %user_id, "Employee already gone; nothing to unlink");
                            }
                            Err(e) => {
                                warn!(
                                    company_id = %id,
                                    user_id = %user_id,
                                    error = %e,
                                    "Could not detach employee; deleting company anyway"
                                );
                                warnings.push(MembershipWarning::RemoteUnlinkFailed {
                                    counterpart: format!("user {}", user_id),
                                    reason: e.to_string(),
                                });
                            }
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
            log.unwind(self.users.as_ref()).await;
            return Err(e.into());
        }

        Ok((MutationOutcome::with_warnings((), warnings), how))
    }

    async fn add_employee_inner(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<(Company, Option<CompanyId>), MembershipError> {
        let mut tx = self.companies.begin().await?;
        let mut company = tx
            .find_for_update(company_id)
            .await?
            .ok_or_else(|| MembershipError::not_found("Company", company_id))?;

        if company.has_employee(user_id) {
            return Err(MembershipError::conflict(format!(
                "Employee {} already exists in company {}",
                user_id, company_id
            )));
        }

        self.require_user(user_id).await?;
        let previous = self.users.add_membership(company_id, user_id).await?;
        let mut log = CompensationLog::new();
        log.linked(company_id, user_id);

        company.add_employee(user_id)?;
        let persisted = match tx.update(&company).await {
            Ok(()) => tx.commit().await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            warn!(company_id = %company_id, user_id = %user_id, error = %e, "Local add failed; compensating");
            log.unwind(self.users.as_ref()).await;
            return Err(e.into());
        }

        Ok((company, previous))
    }

    async fn remove_employee_inner(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<(Company, &'static str), MembershipError> {
        let mut tx = self.companies.begin().await?;
        let mut company = tx
            .find_for_update(company_id)
            .await?
            .ok_or_else(|| MembershipError::not_found("Company", company_id))?;

        if !company.has_employee(user_id) {
            warn!(company_id = %company_id, user_id = %user_id, "User is not an employee; nothing to remove");
            return Ok((company, "none"));
        }

        let mut log = CompensationLog::new();
        match self.users.remove_membership(company_id, user_id).await {
            Ok(()) => log.unlinked(company_id, user_id),
            Err(e) if e.is_not_found() => {
                debug!(user_id = %user_id, "Employee no longer exists remotely");
            }
            Err(e) => return Err(e.into()),
        }

        company.remove_employee(user_id);
        let persisted = match tx.update(&company).await {
            Ok(()) => tx.commit().await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            log.unwind(self.users.as_ref()).await;
            return Err(e.into());
        }

        Ok((company, "synchronous"))
    }
}

#[async_trait]
impl CompanyService for StandardCompanyService {
    async fn create_company(&self, draft: CompanyDraft) -> Result<MutationOutcome<Company>, MembershipError> {
        let mut tracker = MutationTracker::begin("create_company", "new company");
        let (outcome, how) = self
            .create_inner(draft, &mut tracker)
            .await
            .map_err(|e| tracker.abort(e))?;

        tracker.finish(how);
        info!(
            company_id = %outcome.value.id,
            employees = outcome.value.employee_ids.len(),
            association = outcome.value.association.as_str(),
            "Company created"
        );
        Ok(outcome)
    }

    async fn get_company(&self, id: CompanyId) -> Result<CompanyView, MembershipError> {
        let company = self
            .companies
            .find_by_id(id)
            .await?
            .ok_or_else(|| MembershipError::not_found("Company", id))?;
        Ok(self.enrich(company).await)
    }

    async fn list_companies(&self, page: PageRequest) -> Result<Page<CompanyView>, MembershipError> {
        let page = self.companies.list(page).await?;
        let mut content = Vec::with_capacity(page.content.len());
        for company in page.content {
            content.push(self.enrich(company).await);
        }
        Ok(Page {
            content,
            page: page.page,
            size: page.size,
            total_elements: page.total_elements,
        })
    }

    async fn company_exists(&self, id: CompanyId) -> Result<bool, MembershipError> {
        Ok(self.companies.exists(id).await?)
    }

    async fn update_company(
        &self,
        id: CompanyId,
        draft: CompanyDraft,
    ) -> Result<MutationOutcome<Company>, MembershipError> {
        let mut tracker = MutationTracker::begin("update_company", id);
        let (company, moved) = self.update_inner(id, draft).await.map_err(|e| tracker.abort(e))?;

        tracker.local_write_applied();
        self.drop_from_previous(moved).await;
        tracker.remote_sync_attempted("synchronous");
        tracker.done();
        info!(company_id = %id, employees = company.employee_ids.len(), "Company updated");
        Ok(MutationOutcome::clean(company))
    }

    async fn delete_company(&self, id: CompanyId) -> Result<MutationOutcome<()>, MembershipError> {
        let mut tracker = MutationTracker::begin("delete_company", id);
        let (outcome, how) = self.delete_inner(id).await.map_err(|e| tracker.abort(e))?;

        tracker.finish(how);
        info!(company_id = %id, warnings = outcome.warnings.len(), "Company deleted");
        Ok(outcome)
    }

    async fn add_employee(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<MutationOutcome<Company>, MembershipError> {
        let mut tracker = MutationTracker::begin("add_employee", company_id);
        let (company, previous) = self
            .add_employee_inner(company_id, user_id)
            .await
            .map_err(|e| tracker.abort(e))?;

        tracker.local_write_applied();
        if let Some(previous) = previous {
            self.drop_from_previous(vec![(previous, user_id)]).await;
        }
        tracker.remote_sync_attempted("synchronous");
        tracker.done();
        info!(company_id = %company_id, user_id = %user_id, "Employee added");
        Ok(MutationOutcome::clean(company))
    }

    async fn remove_employee(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<MutationOutcome<Company>, MembershipError> {
        let mut tracker = MutationTracker::begin("remove_employee", company_id);
        let (company, how) = self
            .remove_employee_inner(company_id, user_id)
            .await
            .map_err(|e| tracker.abort(e))?;

        tracker.finish(how);
        info!(company_id = %company_id, user_id = %user_id, "Employee removed");
        Ok(MutationOutcome::clean(company))
    }

    async fn add_member(&self, company_id: CompanyId, user_id: UserId) -> Result<(), MembershipError> {
        let mut tx = self.companies.begin().await?;
        let mut company = tx
            .find_for_update(company_id)
            .await?
            .ok_or_else(|| MembershipError::not_found("Company", company_id))?;

        company.add_employee(user_id)?;
        tx.update(&company).await?;
        tx.commit().await?;

        info!(company_id = %company_id, user_id = %user_id, "Employee added by peer");
        Ok(())
    }

    async fn remove_member(&self, company_id: CompanyId, user_id: UserId) -> Result<(), MembershipError> {
        let mut tx = self.companies.begin().await?;
        let mut company = tx
            .find_for_update(company_id)
            .await?
            .ok_or_else(|| MembershipError::not_found("Company", company_id))?;

        if !company.remove_employee(user_id) {
            debug!(company_id = %company_id, user_id = %user_id, "Peer removed a non-member; no-op");
            return Ok(());
        }
        tx.update(&company).await?;
        tx.commit().await?;

        info!(company_id = %company_id, user_id = %user_id, "Employee removed by peer");
        Ok(())
    }
}
