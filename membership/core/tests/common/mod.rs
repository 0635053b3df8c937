// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared test doubles: recording peers and a store whose commits fail.

#![allow(dead_code)]

use async_trait::async_trait;
use membership_core::domain::membership::{
    CompanyId, CompanySnapshot, PeerError, UserId, UserMembershipEvent, UserSnapshot,
};
use membership_core::domain::peer::{CompanyPeer, UserPeer, COMPANY_PEER, USER_PEER};
use membership_core::domain::repository::{
    Page, PageRequest, RepositoryError, UserRepository, UserTransaction,
};
use membership_core::domain::user::{NewUser, User};
use membership_core::infrastructure::propagation_channel::PropagationReport;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Wait for the next propagation report, failing the test after two seconds
pub async fn next_report(reports: &mut broadcast::Receiver<PropagationReport>) -> PropagationReport {
    tokio::time::timeout(Duration::from_secs(2), reports.recv())
        .await
        .expect("no propagation report within 2s")
        .expect("report channel closed")
}

// ============================================================================
// Company peer (as seen by the User service)
// ============================================================================

#[derive(Default)]
pub struct RecordingCompanyPeer {
    companies: Mutex<HashMap<CompanyId, BTreeSet<UserId>>>,
    calls: Mutex<Vec<String>>,
    down: AtomicBool,
    fail_add: Mutex<BTreeSet<CompanyId>>,
    vanish_on_add: Mutex<BTreeSet<CompanyId>>,
}

impl RecordingCompanyPeer {
    pub fn with_companies(ids: &[i64]) -> Self {
        let peer = Self::default();
        for id in ids {
            peer.companies.lock().insert(CompanyId(*id), BTreeSet::new());
        }
        peer
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Make `add_membership` on this company answer "unavailable"
    pub fn fail_add_to(&self, id: i64) {
        self.fail_add.lock().insert(CompanyId(id));
    }

    /// Company passes `exists` but is gone by the time `add_membership` runs
    pub fn vanish_on_add(&self, id: i64) {
        self.vanish_on_add.lock().insert(CompanyId(id));
    }

    pub fn link(&self, company: i64, user: i64) {
        self.companies
            .lock()
            .entry(CompanyId(company))
            .or_default()
            .insert(UserId(user));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn members(&self, company: i64) -> Vec<i64> {
        self.companies
            .lock()
            .get(&CompanyId(company))
            .map(|m| m.iter().map(|u| u.0).collect())
            .unwrap_or_default()
    }

    fn check(&self, call: String) -> Result<(), PeerError> {
        self.calls.lock().push(call);
        if self.down.load(Ordering::SeqCst) {
            return Err(PeerError::unavailable(COMPANY_PEER, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl CompanyPeer for RecordingCompanyPeer {
    async fn exists(&self, id: CompanyId) -> Result<bool, PeerError> {
        self.check(format!("exists {}", id))?;
        Ok(self.companies.lock().contains_key(&id))
    }

    async fn fetch_snapshot(&self, id: CompanyId) -> Result<CompanySnapshot, PeerError> {
        self.check(format!("fetch {}", id))?;
        if !self.companies.lock().contains_key(&id) {
            return Err(PeerError::not_found(COMPANY_PEER, "company", id));
        }
        Ok(CompanySnapshot {
            id,
            name: format!("Company {}", id),
            budget: 1000,
        })
    }

    async fn add_membership(&self, company_id: CompanyId, user_id: UserId) -> Result<(), PeerError> {
        self.check(format!("add {} {}", company_id, user_id))?;
        if self.fail_add.lock().contains(&company_id) {
            return Err(PeerError::unavailable(COMPANY_PEER, "timeout"));
        }
        if self.vanish_on_add.lock().contains(&company_id) {
            return Err(PeerError::not_found(COMPANY_PEER, "company", company_id));
        }
        match self.companies.lock().get_mut(&company_id) {
            Some(members) => {
                members.insert(user_id);
                Ok(())
            }
            None => Err(PeerError::not_found(COMPANY_PEER, "company", company_id)),
        }
    }

    async fn remove_membership(&self, company_id: CompanyId, user_id: UserId) -> Result<(), PeerError> {
        self.check(format!("remove {} {}", company_id, user_id))?;
        match self.companies.lock().get_mut(&company_id) {
            Some(members) => {
                members.remove(&user_id);
                Ok(())
            }
            None => Err(PeerError::not_found(COMPANY_PEER, "company", company_id)),
        }
    }
}

// ============================================================================
// User peer (as seen by the Company service)
// ============================================================================

#[derive(Default)]
pub struct RecordingUserPeer {
    users: Mutex<HashMap<UserId, Option<CompanyId>>>,
    calls: Mutex<Vec<String>>,
    down: AtomicBool,
    fail_add: Mutex<BTreeSet<UserId>>,
}

impl RecordingUserPeer {
    pub fn with_users(ids: &[i64]) -> Self {
        let peer = Self::default();
        for id in ids {
            peer.users.lock().insert(UserId(*id), None);
        }
        peer
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_add_of(&self, id: i64) {
        self.fail_add.lock().insert(UserId(id));
    }

    pub fn attach(&self, user: i64, company: i64) {
        self.users.lock().insert(UserId(user), Some(CompanyId(company)));
    }

    pub fn company_of(&self, user: i64) -> Option<i64> {
        self.users.lock().get(&UserId(user)).copied().flatten().map(|c| c.0)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn check(&self, call: String) -> Result<(), PeerError> {
        self.calls.lock().push(call);
        if self.down.load(Ordering::SeqCst) {
            return Err(PeerError::unavailable(USER_PEER, "connection refused"));
        }
        Ok(())
    }

    fn snapshot(id: UserId, company_id: Option<CompanyId>) -> UserSnapshot {
        UserSnapshot {
            id,
            first_name: "Anna".to_string(),
            last_name: format!("User{}", id),
            phone_number: format!("+7900{:07}", id.0),
            company_id,
        }
    }
}

#[async_trait]
impl UserPeer for RecordingUserPeer {
    async fn exists(&self, id: UserId) -> Result<bool, PeerError> {
        self.check(format!("exists {}", id))?;
        Ok(self.users.lock().contains_key(&id))
    }

    async fn fetch_batch(&self, ids: &[UserId]) -> Result<HashMap<UserId, UserSnapshot>, PeerError> {
        self.check(format!("batch {}", ids.len()))?;
        let users = self.users.lock();
        Ok(ids
            .iter()
            .filter_map(|id| users.get(id).map(|c| (*id, Self::snapshot(*id, *c))))
            .collect())
    }

    async fn add_membership(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<Option<CompanyId>, PeerError> {
        self.check(format!("add {} {}", company_id, user_id))?;
        if self.fail_add.lock().contains(&user_id) {
            return Err(PeerError::unavailable(USER_PEER, "timeout"));
        }
        match self.users.lock().get_mut(&user_id) {
            Some(current) => {
                let previous = current.replace(company_id);
                Ok(previous.filter(|p| *p != company_id))
            }
            None => Err(PeerError::not_found(USER_PEER, "user", user_id)),
        }
    }

    async fn remove_membership(&self, company_id: CompanyId, user_id: UserId) -> Result<(), PeerError> {
        self.check(format!("remove {} {}", company_id, user_id))?;
        match self.users.lock().get_mut(&user_id) {
            Some(current) => {
                if *current == Some(company_id) {
                    *current = None;
                }
                Ok(())
            }
            None => Err(PeerError::not_found(USER_PEER, "user", user_id)),
        }
    }
}

// ============================================================================
// Store whose commits always fail
// ============================================================================

/// Wraps a real user store; every transaction fails at commit and rolls back
pub struct FailingCommitUsers<R> {
    pub inner: R,
}

#[async_trait]
impl<R: UserRepository> UserRepository for FailingCommitUsers<R> {
    async fn begin(&self) -> Result<Box<dyn UserTransaction>, RepositoryError> {
        Ok(Box::new(FailingCommitTx {
            inner: self.inner.begin().await?,
        }))
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>, RepositoryError> {
        self.inner.find_by_ids(ids).await
    }

    async fn exists(&self, id: UserId) -> Result<bool, RepositoryError> {
        self.inner.exists(id).await
    }

    async fn list(&self, page: PageRequest) -> Result<Page<User>, RepositoryError> {
        self.inner.list(page).await
    }
}

struct FailingCommitTx {
    inner: Box<dyn UserTransaction>,
}

#[async_trait]
impl UserTransaction for FailingCommitTx {
    async fn find_for_update(&mut self, id: UserId) -> Result<Option<User>, RepositoryError> {
        self.inner.find_for_update(id).await
    }

    async fn phone_taken(&mut self, phone: &str) -> Result<bool, RepositoryError> {
        self.inner.phone_taken(phone).await
    }

    async fn insert(&mut self, user: NewUser) -> Result<User, RepositoryError> {
        self.inner.insert(user).await
    }

    async fn update(&mut self, user: &User) -> Result<(), RepositoryError> {
        self.inner.update(user).await
    }

    async fn delete(&mut self, id: UserId) -> Result<(), RepositoryError> {
        self.inner.delete(id).await
    }

    fn after_commit(&mut self, event: UserMembershipEvent) {
        self.inner.after_commit(event);
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        // Dropping the inner transaction rolls it back.
        drop(self.inner);
        Err(RepositoryError::Database("disk full".to_string()))
    }
}
