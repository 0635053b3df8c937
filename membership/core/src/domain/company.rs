// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Company Aggregate
//!
//! Owned by the Company service. `employee_ids` is the Company service's half
//! of every membership; the User service keeps the other half.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::errors::MembershipError;
use crate::domain::membership::{AssociationState, CompanyId, CompanySnapshot, UserId};

/// Largest budget any store can hold (PostgreSQL `BIGINT`).
pub const MAX_BUDGET: u64 = i64::MAX as u64;

/// Validated input for creating or replacing a company.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompanyDraft {
    pub name: String,
    pub budget: u64,
    #[serde(default)]
    pub employee_ids: Option<BTreeSet<UserId>>,
}

impl CompanyDraft {
    pub fn validate(&self) -> Result<(), MembershipError> {
        if self.name.trim().is_empty() {
            return Err(MembershipError::validation("Name is required"));
        }
        if self.budget > MAX_BUDGET {
            return Err(MembershipError::validation(format!(
                "Budget must not exceed {}",
                MAX_BUDGET
            )));
        }
        Ok(())
    }

    pub fn employees(&self) -> BTreeSet<UserId> {
        self.employee_ids.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    pub budget: u64,
    pub employee_ids: BTreeSet<UserId>,
    #[serde(default)]
    pub association: AssociationState,
}

/// A company that has not been assigned an identifier yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCompany {
    pub name: String,
    pub budget: u64,
    pub employee_ids: BTreeSet<UserId>,
    pub association: AssociationState,
}

impl NewCompany {
    pub fn from_draft(draft: &CompanyDraft, association: AssociationState) -> Self {
        Self {
            name: draft.name.trim().to_string(),
            budget: draft.budget,
            employee_ids: draft.employees(),
            association,
        }
    }

    pub fn into_company(self, id: CompanyId) -> Company {
        Company {
            id,
            name: self.name,
            budget: self.budget,
            employee_ids: self.employee_ids,
            association: self.association,
        }
    }
}

impl Company {
    pub fn has_employee(&self, user_id: UserId) -> bool {
        self.employee_ids.contains(&user_id)
    }

    /// Adds an employee. A second add of the same user is a conflict rather
    /// than a silent no-op, so duplicated cross-service calls surface.
    pub fn add_employee(&mut self, user_id: UserId) -> Result<(), MembershipError> {
        if !self.employee_ids.insert(user_id) {
            return Err(MembershipError::conflict(format!(
                "Employee {} already exists in company {}",
                user_id, self.id
            )));
        }
        Ok(())
    }

    /// Returns `false` when the user was not an employee.
    pub fn remove_employee(&mut self, user_id: UserId) -> bool {
        self.employee_ids.remove(&user_id)
    }

    pub fn apply_draft(&mut self, draft: &CompanyDraft) {
        self.name = draft.name.trim().to_string();
        self.budget = draft.budget;
        if let Some(employees) = &draft.employee_ids {
            self.employee_ids = employees.clone();
        }
    }

    pub fn snapshot(&self) -> CompanySnapshot {
        CompanySnapshot {
            id: self.id,
            name: self.name.clone(),
            budget: self.budget,
        }
    }
}
