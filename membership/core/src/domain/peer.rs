// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Remote Peer Gateway Contracts
//!
//! Each service talks to the other one only through these traits. They are
//! injected into the coordinators as `Arc<dyn _>`, which lets tests swap in
//! recording doubles and keeps HTTP details in `crate::infrastructure`.
//!
//! Every method resolves to `Ok(_)`, `Err(PeerError::CounterpartNotFound)` or
//! `Err(PeerError::PeerUnavailable)`. `exists` is the one exception to the
//! not-found branch: a remote 404 is reported as `Ok(false)` (fail closed),
//! while timeouts and server errors still surface as `PeerUnavailable`.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::domain::membership::{CompanyId, CompanySnapshot, PeerError, UserId, UserSnapshot};

/// Peer names carried in `PeerError` and logs
pub const COMPANY_PEER: &str = "company-service";
pub const USER_PEER: &str = "user-service";

/// The Company service as seen from the User service.
#[async_trait]
pub trait CompanyPeer: Send + Sync {
    async fn exists(&self, id: CompanyId) -> Result<bool, PeerError>;

    async fn fetch_snapshot(&self, id: CompanyId) -> Result<CompanySnapshot, PeerError>;

    /// Ask the company to list `user_id` among its employees
    async fn add_membership(&self, company_id: CompanyId, user_id: UserId) -> Result<(), PeerError>;

    /// Ask the company to drop `user_id` from its employees
    async fn remove_membership(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<(), PeerError>;
}

/// The User service as seen from the Company service.
#[async_trait]
pub trait UserPeer: Send + Sync {
    async fn exists(&self, id: UserId) -> Result<bool, PeerError>;

    /// Fetch several users in one round trip; unknown IDs are absent from the map
    async fn fetch_batch(&self, ids: &[UserId]) -> Result<HashMap<UserId, UserSnapshot>, PeerError>;

    /// Point the user at `company_id`. Returns the company the user belonged
    /// to before, if it was a different one.
    async fn add_membership(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<Option<CompanyId>, PeerError>;

    /// Detach the user from `company_id`; a user attached elsewhere is left alone
    async fn remove_membership(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<(), PeerError>;
}
