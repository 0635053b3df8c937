// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the Local Aggregate Store contracts
//! defined in `crate::domain::repository`.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist Company and User aggregates transactionally
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! ## PostgreSQL Repositories
//!
//! - **PostgresCompanyRepository** - `companies` + `company_employees` tables
//! - **PostgresUserRepository** - `users` table
//!
//! ## In-Memory Repositories
//!
//! Used for development and tests. Each transaction takes per-row async
//! locks (held until commit or drop), stages its writes privately and applies
//! them atomically at commit after re-checking unique keys. Identifiers come
//! from a sequence, so a rolled-back insert leaves a gap exactly like
//! `BIGSERIAL` does.

pub mod postgres_company;
pub mod postgres_user;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::company::{Company, NewCompany};
use crate::domain::membership::{CompanyId, CompanyMembershipEvent, UserId, UserMembershipEvent};
use crate::domain::repository::{
    CompanyRepository, CompanyTransaction, Page, PageRequest, RepositoryError, UserRepository,
    UserTransaction,
};
use crate::domain::user::{NewUser, User};
use crate::infrastructure::propagation_channel::{PostCommitHooks, PropagationSender};

pub use postgres_company::PostgresCompanyRepository;
pub use postgres_user::PostgresUserRepository;

// ============================================================================
// Shared table machinery
// ============================================================================

struct Table<K, V> {
    next_id: i64,
    rows: BTreeMap<K, V>,
}

struct Store<K, V> {
    table: Arc<Mutex<Table<K, V>>>,
    row_locks: Arc<DashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K, V> Clone for Store<K, V> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            row_locks: self.row_locks.clone(),
        }
    }
}

impl<K, V> Store<K, V>
where
    K: Copy + Ord + Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                next_id: 1,
                rows: BTreeMap::new(),
            })),
            row_locks: Arc::new(DashMap::new()),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        self.table.lock().rows.get(key).cloned()
    }

    fn page(&self, page: PageRequest) -> Page<V> {
        let page = page.normalized();
        let table = self.table.lock();
        let content = table
            .rows
            .values()
            .skip(page.offset() as usize)
            .take(page.size as usize)
            .cloned()
            .collect();
        Page {
            content,
            page: page.page,
            size: page.size,
            total_elements: table.rows.len() as u64,
        }
    }

    fn begin(&self) -> TxState<K, V> {
        TxState {
            store: self.clone(),
            guards: HashMap::new(),
            staged: BTreeMap::new(),
        }
    }
}

/// Private write set of one in-memory transaction
struct TxState<K, V> {
    store: Store<K, V>,
    guards: HashMap<K, OwnedMutexGuard<()>>,
    staged: BTreeMap<K, Option<V>>,
}

impl<K, V> TxState<K, V>
where
    K: Copy + Ord + Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    /// Block until the row lock for `key` is held by this transaction
    async fn lock(&mut self, key: K) {
        if self.guards.contains_key(&key) {
            return;
        }
        let lock = self
            .store
            .row_locks
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        self.guards.insert(key, guard);
    }

    fn read(&self, key: &K) -> Option<V> {
        match self.staged.get(key) {
            Some(staged) => staged.clone(),
            None => self.store.get(key),
        }
    }

    /// Committed rows overlaid with this transaction's staged writes
    fn visible(&self) -> BTreeMap<K, V> {
        let mut rows = self.store.table.lock().rows.clone();
        overlay(&mut rows, &self.staged);
        rows
    }

    fn next_id(&self) -> i64 {
        let mut table = self.store.table.lock();
        let id = table.next_id;
        table.next_id += 1;
        id
    }

    fn stage(&mut self, key: K, value: Option<V>) {
        self.staged.insert(key, value);
    }

    /// Apply staged writes atomically if `check` accepts the resulting table
    fn apply(
        self,
        check: impl Fn(&BTreeMap<K, V>) -> Result<(), RepositoryError>,
    ) -> Result<(), RepositoryError> {
        let Self {
            store,
            guards,
            staged,
        } = self;
        {
            let mut table = store.table.lock();
            let mut candidate = table.rows.clone();
            overlay(&mut candidate, &staged);
            check(&candidate)?;
            table.rows = candidate;
        }
        drop(guards);
        Ok(())
    }
}

fn overlay<K: Copy + Ord, V: Clone>(rows: &mut BTreeMap<K, V>, staged: &BTreeMap<K, Option<V>>) {
    for (key, value) in staged {
        match value {
            Some(v) => {
                rows.insert(*key, v.clone());
            }
            None => {
                rows.remove(key);
            }
        }
    }
}

fn ensure_unique<'a, V: 'a>(
    rows: impl Iterator<Item = &'a V>,
    key: impl Fn(&V) -> &str,
    what: &str,
) -> Result<(), RepositoryError> {
    let mut seen = HashSet::new();
    for row in rows {
        let k = key(row);
        if !seen.insert(k.to_string()) {
            return Err(RepositoryError::Conflict(format!(
                "{} '{}' already exists",
                what, k
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Company store
// ============================================================================

#[derive(Clone)]
pub struct InMemoryCompanyRepository {
    store: Store<CompanyId, Company>,
    propagation: PropagationSender<CompanyMembershipEvent>,
}

impl InMemoryCompanyRepository {
    pub fn new(propagation: PropagationSender<CompanyMembershipEvent>) -> Self {
        Self {
            store: Store::new(),
            propagation,
        }
    }
}

#[async_trait]
impl CompanyRepository for InMemoryCompanyRepository {
    async fn begin(&self) -> Result<Box<dyn CompanyTransaction>, RepositoryError> {
        Ok(Box::new(InMemoryCompanyTransaction {
            state: self.store.begin(),
            hooks: self.propagation.hooks(),
        }))
    }

    async fn find_by_id(&self, id: CompanyId) -> Result<Option<Company>, RepositoryError> {
        Ok(self.store.get(&id))
    }

    async fn exists(&self, id: CompanyId) -> Result<bool, RepositoryError> {
        Ok(self.store.table.lock().rows.contains_key(&id))
    }

    async fn list(&self, page: PageRequest) -> Result<Page<Company>, RepositoryError> {
        Ok(self.store.page(page))
    }
}

pub struct InMemoryCompanyTransaction {
    state: TxState<CompanyId, Company>,
    hooks: PostCommitHooks<CompanyMembershipEvent>,
}

#[async_trait]
impl CompanyTransaction for InMemoryCompanyTransaction {
    async fn find_for_update(&mut self, id: CompanyId) -> Result<Option<Company>, RepositoryError> {
        self.state.lock(id).await;
        Ok(self.state.read(&id))
    }

    async fn name_taken(
        &mut self,
        name: &str,
        except: Option<CompanyId>,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .state
            .visible()
            .values()
            .any(|c| c.name == name && Some(c.id) != except))
    }

    async fn insert(&mut self, company: NewCompany) -> Result<Company, RepositoryError> {
        let id = CompanyId(self.state.next_id());
        self.state.lock(id).await;
        let company = company.into_company(id);
        self.state.stage(id, Some(company.clone()));
        Ok(company)
    }

    async fn update(&mut self, company: &Company) -> Result<(), RepositoryError> {
        self.state.lock(company.id).await;
        if self.state.read(&company.id).is_none() {
            return Err(RepositoryError::NotFound(format!("company {}", company.id)));
        }
        self.state.stage(company.id, Some(company.clone()));
        Ok(())
    }

    async fn delete(&mut self, id: CompanyId) -> Result<(), RepositoryError> {
        self.state.lock(id).await;
        if self.state.read(&id).is_none() {
            return Err(RepositoryError::NotFound(format!("company {}", id)));
        }
        self.state.stage(id, None);
        Ok(())
    }

    fn after_commit(&mut self, event: CompanyMembershipEvent) {
        self.hooks.record(event);
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        let Self { state, hooks } = *self;
        match state.apply(|rows| ensure_unique(rows.values(), |c| c.name.as_str(), "Company name")) {
            Ok(()) => {
                hooks.release();
                Ok(())
            }
            Err(e) => {
                hooks.discard();
                Err(e)
            }
        }
    }
}

// ============================================================================
// User store
// ============================================================================

#[derive(Clone)]
pub struct InMemoryUserRepository {
    store: Store<UserId, User>,
    propagation: PropagationSender<UserMembershipEvent>,
}

impl InMemoryUserRepository {
    pub fn new(propagation: PropagationSender<UserMembershipEvent>) -> Self {
        Self {
            store: Store::new(),
            propagation,
        }
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn begin(&self) -> Result<Box<dyn UserTransaction>, RepositoryError> {
        Ok(Box::new(InMemoryUserTransaction {
            state: self.store.begin(),
            hooks: self.propagation.hooks(),
        }))
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        Ok(self.store.get(&id))
    }

    async fn find_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>, RepositoryError> {
        let table = self.store.table.lock();
        let mut wanted: Vec<UserId> = ids.to_vec();
        wanted.sort();
        wanted.dedup();
        Ok(wanted
            .iter()
            .filter_map(|id| table.rows.get(id).cloned())
            .collect())
    }

    async fn exists(&self, id: UserId) -> Result<bool, RepositoryError> {
        Ok(self.store.table.lock().rows.contains_key(&id))
    }

    async fn list(&self, page: PageRequest) -> Result<Page<User>, RepositoryError> {
        Ok(self.store.page(page))
    }
}

pub struct InMemoryUserTransaction {
    state: TxState<UserId, User>,
    hooks: PostCommitHooks<UserMembershipEvent>,
}

#[async_trait]
impl UserTransaction for InMemoryUserTransaction {
    async fn find_for_update(&mut self, id: UserId) -> Result<Option<User>, RepositoryError> {
        self.state.lock(id).await;
        Ok(self.state.read(&id))
    }

    async fn phone_taken(&mut self, phone: &str) -> Result<bool, RepositoryError> {
        Ok(self.state.visible().values().any(|u| u.phone_number == phone))
    }

    async fn insert(&mut self, user: NewUser) -> Result<User, RepositoryError> {
        let id = UserId(self.state.next_id());
        self.state.lock(id).await;
        let user = user.into_user(id);
        self.state.stage(id, Some(user.clone()));
        Ok(user)
    }

    async fn update(&mut self, user: &User) -> Result<(), RepositoryError> {
        self.state.lock(user.id).await;
        if self.state.read(&user.id).is_none() {
            return Err(RepositoryError::NotFound(format!("user {}", user.id)));
        }
        self.state.stage(user.id, Some(user.clone()));
        Ok(())
    }

    async fn delete(&mut self, id: UserId) -> Result<(), RepositoryError> {
        self.state.lock(id).await;
        if self.state.read(&id).is_none() {
            return Err(RepositoryError::NotFound(format!("user {}", id)));
        }
        self.state.stage(id, None);
        Ok(())
    }

    fn after_commit(&mut self, event: UserMembershipEvent) {
        self.hooks.record(event);
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        let Self { state, hooks } = *self;
        match state.apply(|rows| {
            ensure_unique(rows.values(), |u| u.phone_number.as_str(), "Phone number")
        }) {
            Ok(()) => {
                hooks.release();
                Ok(())
            }
            Err(e) => {
                hooks.discard();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::membership::AssociationState;
    use crate::infrastructure::propagation_channel::PropagationChannel;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn new_user(phone: &str) -> NewUser {
        NewUser {
            first_name: "Ivan".to_string(),
            last_name: "Petrov".to_string(),
            phone_number: phone.to_string(),
            company_id: Some(CompanyId(7)),
            association: AssociationState::Propagated,
        }
    }

    fn user_repo() -> (InMemoryUserRepository, PropagationChannel<UserMembershipEvent>) {
        let channel = PropagationChannel::new("user-service", 8);
        (InMemoryUserRepository::new(channel.sender()), channel)
    }

    #[tokio::test]
    async fn test_uncommitted_insert_is_invisible() {
        let (repo, _channel) = user_repo();
        let mut tx = repo.begin().await.unwrap();
        let user = tx.insert(new_user("+1000")).await.unwrap();
        assert!(repo.find_by_id(user.id).await.unwrap().is_none());

        tx.commit().await.unwrap();
        assert!(repo.exists(user.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let (repo, _channel) = user_repo();
        {
            let mut tx = repo.begin().await.unwrap();
            tx.insert(new_user("+1000")).await.unwrap();
        }
        assert_eq!(repo.list(PageRequest::default()).await.unwrap().total_elements, 0);

        // Sequence keeps advancing like BIGSERIAL
        let mut tx = repo.begin().await.unwrap();
        let user = tx.insert(new_user("+1000")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(user.id, UserId(2));
    }

    #[tokio::test]
    async fn test_duplicate_phone_fails_at_commit() {
        let (repo, _channel) = user_repo();
        let mut first = repo.begin().await.unwrap();
        let mut second = repo.begin().await.unwrap();
        first.insert(new_user("+1000")).await.unwrap();
        second.insert(new_user("+1000")).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(repo.list(PageRequest::default()).await.unwrap().total_elements, 1);
    }

    #[tokio::test]
    async fn test_row_lock_serializes_writers() {
        let (repo, _channel) = user_repo();
        let mut tx = repo.begin().await.unwrap();
        let user = tx.insert(new_user("+1000")).await.unwrap();
        tx.commit().await.unwrap();

        let mut holder = repo.begin().await.unwrap();
        holder.find_for_update(user.id).await.unwrap();

        let contender_repo = repo.clone();
        let contender = tokio::spawn(async move {
            let mut tx = contender_repo.begin().await.unwrap();
            tx.find_for_update(user.id).await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(holder);
        let seen = contender.await.unwrap();
        assert_eq!(seen.map(|u| u.id), Some(user.id));
    }

    #[tokio::test]
    async fn test_company_updates_and_pages() {
        let channel = PropagationChannel::<CompanyMembershipEvent>::new("company-service", 8);
        let repo = InMemoryCompanyRepository::new(channel.sender());

        for name in ["Acme", "Globex", "Initech"] {
            let mut tx = repo.begin().await.unwrap();
            assert!(!tx.name_taken(name, None).await.unwrap());
            tx.insert(NewCompany {
                name: name.to_string(),
                budget: 100,
                employee_ids: BTreeSet::new(),
                association: AssociationState::Propagated,
            })
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }

        let page = repo.list(PageRequest::new(1, 2)).await.unwrap();
        assert_eq!(page.total_elements, 3);
        assert_eq!(page.content.len(), 1);
        assert_eq!(page.content[0].name, "Initech");

        let mut tx = repo.begin().await.unwrap();
        let mut acme = tx.find_for_update(CompanyId(1)).await.unwrap().unwrap();
        assert!(tx.name_taken("Globex", Some(acme.id)).await.unwrap());
        assert!(!tx.name_taken("Acme", Some(acme.id)).await.unwrap());
        acme.add_employee(UserId(4)).unwrap();
        tx.update(&acme).await.unwrap();
        tx.commit().await.unwrap();

        let stored = repo.find_by_id(CompanyId(1)).await.unwrap().unwrap();
        assert!(stored.has_employee(UserId(4)));
    }
}
