// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Deferred Propagation Handlers
//!
//! Run by the propagation worker after a local commit. Each handler performs
//! the remote membership call for one event and then repairs the local
//! association flag: a successful add clears `Unpropagated`, a failed add
//! sets it. Failures are returned to the worker, which logs and counts them;
//! nothing is retried.
//!
//! Adds are re-checked against the current local row first. A synchronous
//! reassociation or employee update may commit between the event's commit
//! and its delivery; sending the stale add would re-link the old pair, so
//! such events are reported as `Delivery::Superseded` instead.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::company_service::drop_stale_employee;
use crate::domain::membership::{
    AssociationState, CompanyId, CompanyMembershipEvent, UserId, UserMembershipEvent,
};
use crate::domain::peer::{CompanyPeer, UserPeer};
use crate::domain::repository::{CompanyRepository, RepositoryError, UserRepository};
use crate::infrastructure::propagation_channel::{Delivery, PropagationHandler};

/// Set the user's flag, but only while it still points at `company_id`
async fn mark_user(
    users: &dyn UserRepository,
    user_id: UserId,
    company_id: CompanyId,
    state: AssociationState,
) -> Result<(), RepositoryError> {
    let mut tx = users.begin().await?;
    let Some(mut user) = tx.find_for_update(user_id).await? else {
        return Ok(());
    };
    if user.company_id != Some(company_id) || user.association == state {
        return Ok(());
    }
    user.association = state;
    tx.update(&user).await?;
    tx.commit().await?;
    debug!(user_id = %user_id, state = state.as_str(), "User association flag updated");
    Ok(())
}

async fn mark_company(
    companies: &dyn CompanyRepository,
    company_id: CompanyId,
    state: AssociationState,
) -> Result<(), RepositoryError> {
    let mut tx = companies.begin().await?;
    let Some(mut company) = tx.find_for_update(company_id).await? else {
        return Ok(());
    };
    if company.association == state {
        return Ok(());
    }
    company.association = state;
    tx.update(&company).await?;
    tx.commit().await?;
    debug!(company_id = %company_id, state = state.as_str(), "Company association flag updated");
    Ok(())
}

// ============================================================================
// User service side
// ============================================================================

/// Delivers `UserMembershipEvent`s to the Company service
pub struct UserPropagationHandler {
    companies: Arc<dyn CompanyPeer>,
    users: Arc<dyn UserRepository>,
}

impl UserPropagationHandler {
    pub fn new(companies: Arc<dyn CompanyPeer>, users: Arc<dyn UserRepository>) -> Self {
        Self { companies, users }
    }

    /// Why a join event no longer matches the stored user, if it doesn't
    async fn stale_join(&self, user_id: UserId, company_id: CompanyId) -> anyhow::Result<Option<String>> {
        let current = self
            .users
            .find_by_id(user_id)
            .await
            .context("failed to re-read user before propagating")?;
        Ok(match current {
            None => Some(format!("user {} no longer exists", user_id)),
            Some(user) => match user.company_id {
                Some(current) if current == company_id => None,
                Some(current) => Some(format!(
                    "user {} moved from company {} to company {}",
                    user_id, company_id, current
                )),
                None => Some(format!("user {} left company {}", user_id, company_id)),
            },
        })
    }

    async fn join(&self, user_id: UserId, company_id: CompanyId) -> anyhow::Result<Delivery> {
        if let Some(reason) = self.stale_join(user_id, company_id).await? {
            return Ok(Delivery::Superseded(reason));
        }

        match self.companies.add_membership(company_id, user_id).await {
            Ok(()) => {
                info!(user_id = %user_id, company_id = %company_id, "User associated with company");
                mark_user(self.users.as_ref(), user_id, company_id, AssociationState::Propagated)
                    .await
                    .context("failed to clear unpropagated flag")?;
                Ok(Delivery::Applied)
            }
            Err(e) => {
                if let Err(mark_err) = mark_user(
                    self.users.as_ref(),
                    user_id,
                    company_id,
                    AssociationState::Unpropagated,
                )
                .await
                {
                    warn!(user_id = %user_id, error = %mark_err, "Could not flag user as unpropagated");
                }
                Err(anyhow!(e).context(format!(
                    "failed to associate user {} with company {}",
                    user_id, company_id
                )))
            }
        }
    }

    async fn leave(&self, user_id: UserId, company_id: CompanyId) -> anyhow::Result<Delivery> {
        match self.companies.remove_membership(company_id, user_id).await {
            Ok(()) => {
                info!(user_id = %user_id, company_id = %company_id, "User removed from company");
                Ok(Delivery::Applied)
            }
            Err(e) if e.is_not_found() => {
                debug!(company_id = %company_id, "Company already gone; nothing to unlink");
                Ok(Delivery::Applied)
            }
            Err(e) => Err(anyhow!(e).context(format!(
                "failed to remove user {} from company {}",
                user_id, company_id
            ))),
        }
    }
}

#[async_trait]
impl PropagationHandler<UserMembershipEvent> for UserPropagationHandler {
    async fn handle(&self, event: UserMembershipEvent) -> anyhow::Result<Delivery> {
        match event {
            UserMembershipEvent::UserJoined {
                user_id, company_id, ..
            } => self.join(user_id, company_id).await,
            UserMembershipEvent::UserLeft {
                user_id, company_id, ..
            } => self.leave(user_id, company_id).await,
        }
    }
}

// ============================================================================
// Company service side
// ============================================================================

/// Delivers `CompanyMembershipEvent`s to the User service
pub struct CompanyPropagationHandler {
    users: Arc<dyn UserPeer>,
    companies: Arc<dyn CompanyRepository>,
}

impl CompanyPropagationHandler {
    pub fn new(users: Arc<dyn UserPeer>, companies: Arc<dyn CompanyRepository>) -> Self {
        Self { users, companies }
    }

    async fn form(&self, company_id: CompanyId, employee_ids: BTreeSet<UserId>) -> anyhow::Result<Delivery> {
        // Only employees the company still lists are attached remotely.
        let current = self
            .companies
            .find_by_id(company_id)
            .await
            .context("failed to re-read company before propagating")?;
        let Some(company) = current else {
            return Ok(Delivery::Superseded(format!("company {} no longer exists", company_id)));
        };
        let (still_listed, dropped): (Vec<UserId>, Vec<UserId>) = employee_ids
            .iter()
            .copied()
            .partition(|id| company.has_employee(*id));
        if !dropped.is_empty() {
            warn!(
                company_id = %company_id,
                dropped = ?dropped,
                "Employees removed before delivery; not associating them"
            );
        }
        if still_listed.is_empty() && !employee_ids.is_empty() {
            return Ok(Delivery::Superseded(format!(
                "company {} no longer lists any of its founding employees",
                company_id
            )));
        }

        let mut failures = Vec::new();
        for user_id in &still_listed {
            match self.users.add_membership(company_id, *user_id).await {
                Ok(previous) => {
                    if let Some(previous) = previous {
                        drop_stale_employee(self.companies.as_ref(), previous, *user_id)
                            .await
                            .with_context(|| {
                                format!("failed to drop user {} from company {}", user_id, previous)
                            })?;
                    }
                }
                Err(e) => failures.push(format!("user {}: {}", user_id, e)),
            }
        }

        if failures.is_empty() {
            info!(company_id = %company_id, employees = still_listed.len(), "Company employees associated");
            mark_company(self.companies.as_ref(), company_id, AssociationState::Propagated)
                .await
                .context("failed to clear unpropagated flag")?;
            return Ok(Delivery::Applied);
        }

        if let Err(mark_err) =
            mark_company(self.companies.as_ref(), company_id, AssociationState::Unpropagated).await
        {
            warn!(company_id = %company_id, error = %mark_err, "Could not flag company as unpropagated");
        }
        Err(anyhow!(
            "{} of {} employees of company {} not associated: {}",
            failures.len(),
            still_listed.len(),
            company_id,
            failures.join("; ")
        ))
    }

    async fn dissolve(&self, company_id: CompanyId, employee_ids: BTreeSet<UserId>) -> anyhow::Result<Delivery> {
        let mut failures = Vec::new();
        for user_id in &employee_ids {
            match self.users.remove_membership(company_id, *user_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(user_id = %user_id, "Employee already gone; nothing to detach");
                }
                Err(e) => failures.push(format!("user {}: {}", user_id, e)),
            }
        }
        if failures.is_empty() {
            info!(company_id = %company_id, employees = employee_ids.len(), "Former employees detached");
            Ok(Delivery::Applied)
        } else {
            Err(anyhow!(
                "{} of {} employees of deleted company {} not detached: {}",
                failures.len(),
                employee_ids.len(),
                company_id,
                failures.join("; ")
            ))
        }
    }
}

#[async_trait]
impl PropagationHandler<CompanyMembershipEvent> for CompanyPropagationHandler {
    async fn handle(&self, event: CompanyMembershipEvent) -> anyhow::Result<Delivery> {
        match event {
            CompanyMembershipEvent::CompanyFormed {
                company_id,
                employee_ids,
                ..
            } => self.form(company_id, employee_ids).await,
            CompanyMembershipEvent::CompanyDissolved {
                company_id,
                employee_ids,
                ..
            } => self.dissolve(company_id, employee_ids).await,
        }
    }
}
