// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # User Aggregate
//!
//! Owned by the User service. `company_id` is the User service's half of a
//! membership; the Company service keeps the matching `employee_ids` entry.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::errors::MembershipError;
use crate::domain::membership::{AssociationState, CompanyId, UserId, UserSnapshot};

/// Optional leading `+`, then digits with spaces, dashes or parentheses.
static PHONE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[\d\s\-()]+$").expect("phone pattern is valid"));

const MIN_PHONE_DIGITS: usize = 3;
const MAX_PHONE_DIGITS: usize = 15;

/// Input for creating or updating a user.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserDraft {
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    #[serde(default)]
    pub company_id: Option<CompanyId>,
}

impl UserDraft {
    pub fn validate(&self) -> Result<(), MembershipError> {
        if self.first_name.trim().is_empty() {
            return Err(MembershipError::validation("First name is required"));
        }
        if self.last_name.trim().is_empty() {
            return Err(MembershipError::validation("Last name is required"));
        }
        validate_phone(&self.phone_number)
    }
}

pub fn validate_phone(phone: &str) -> Result<(), MembershipError> {
    let phone = phone.trim();
    if phone.is_empty() {
        return Err(MembershipError::validation("Phone number is required"));
    }
    let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
    if !PHONE_PATTERN.is_match(phone) || !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits) {
        return Err(MembershipError::validation("Invalid phone number"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub company_id: Option<CompanyId>,
    #[serde(default)]
    pub association: AssociationState,
}

/// A user that has not been assigned an identifier yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewUser {
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub company_id: Option<CompanyId>,
    pub association: AssociationState,
}

impl NewUser {
    pub fn from_draft(draft: &UserDraft, association: AssociationState) -> Self {
        Self {
            first_name: draft.first_name.trim().to_string(),
            last_name: draft.last_name.trim().to_string(),
            phone_number: draft.phone_number.trim().to_string(),
            company_id: draft.company_id,
            association,
        }
    }

    pub fn into_user(self, id: UserId) -> User {
        User {
            id,
            first_name: self.first_name,
            last_name: self.last_name,
            phone_number: self.phone_number,
            company_id: self.company_id,
            association: self.association,
        }
    }
}

impl User {
    /// Phone numbers identify users across the store and cannot change.
    pub fn ensure_same_phone(&self, draft: &UserDraft) -> Result<(), MembershipError> {
        if self.phone_number != draft.phone_number.trim() {
            return Err(MembershipError::validation("Phone number cannot be updated"));
        }
        Ok(())
    }

    pub fn rename(&mut self, draft: &UserDraft) {
        self.first_name = draft.first_name.trim().to_string();
        self.last_name = draft.last_name.trim().to_string();
    }

    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot {
            id: self.id,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            phone_number: self.phone_number.clone(),
            company_id: self.company_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(phone: &str) -> UserDraft {
        UserDraft {
            first_name: "Ivan".to_string(),
            last_name: "Ivanov".to_string(),
            phone_number: phone.to_string(),
            company_id: Some(CompanyId(1)),
        }
    }

    #[test]
    fn test_phone_formats() {
        assert!(validate_phone("+1000").is_ok());
        assert!(validate_phone("+7 (902) 111-11-11").is_ok());
        assert!(validate_phone("89021111111").is_ok());
        assert!(validate_phone("").is_err());
        assert!(validate_phone("+12").is_err());
        assert!(validate_phone("call me").is_err());
        assert!(validate_phone("1234567890123456").is_err());
    }

    #[test]
    fn test_draft_requires_names() {
        let mut d = draft("+1000");
        assert!(d.validate().is_ok());
        d.first_name = " ".to_string();
        assert!(matches!(d.validate(), Err(MembershipError::Validation(_))));
    }

    #[test]
    fn test_phone_is_immutable() {
        let user = NewUser::from_draft(&draft("+1000"), AssociationState::Propagated).into_user(UserId(3));
        assert!(user.ensure_same_phone(&draft(" +1000 ")).is_ok());
        assert!(user.ensure_same_phone(&draft("+2000")).is_err());
    }
}
