// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for the two aggregates, following the DDD Repository
//! pattern: one repository per aggregate root, interface defined in the
//! domain layer, implemented in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `CompanyRepository` | `Company` | `InMemoryCompanyRepository`, `PostgresCompanyRepository` |
//! | `UserRepository` | `User` | `InMemoryUserRepository`, `PostgresUserRepository` |
//!
//! ## Transactions and post-commit hooks
//!
//! Mutations go through a transaction obtained from `begin()`. A transaction
//! locks the rows it reads with `find_for_update`, stages writes, and carries
//! a post-commit hook list filled through `after_commit`. `commit()` makes the
//! writes durable and only then hands the recorded events to the deferred
//! propagation channel. Dropping a transaction without committing rolls it
//! back and discards its hooks, so a failed local write never triggers a
//! remote call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::company::{Company, NewCompany};
use crate::domain::membership::{
    CompanyId, CompanyMembershipEvent, UserId, UserMembershipEvent,
};
use crate::domain::user::{NewUser, User};

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    InMemory,
    PostgreSQL(PostgresConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    pub connection_string: String,
}

/// Zero-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub size: u32,
}

fn default_page_size() -> u32 {
    10
}

impl PageRequest {
    pub const MAX_SIZE: u32 = 100;

    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    /// Clamps the size into `1..=MAX_SIZE`.
    pub fn normalized(self) -> Self {
        Self {
            page: self.page,
            size: self.size.clamp(1, Self::MAX_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, default_page_size())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total_elements: u64,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            page: self.page,
            size: self.size,
            total_elements: self.total_elements,
        }
    }
}

/// Repository interface for Company aggregates
#[async_trait]
pub trait CompanyRepository: Send + Sync {
    /// Start a transaction for a read-modify-write cycle
    async fn begin(&self) -> Result<Box<dyn CompanyTransaction>, RepositoryError>;

    /// Find company by ID (no lock)
    async fn find_by_id(&self, id: CompanyId) -> Result<Option<Company>, RepositoryError>;

    async fn exists(&self, id: CompanyId) -> Result<bool, RepositoryError>;

    /// List companies ordered by ID
    async fn list(&self, page: PageRequest) -> Result<Page<Company>, RepositoryError>;
}

/// Transaction scope over the Company store
#[async_trait]
pub trait CompanyTransaction: Send {
    /// Read a company and hold its row lock until commit or rollback
    async fn find_for_update(&mut self, id: CompanyId) -> Result<Option<Company>, RepositoryError>;

    /// Whether another company already uses `name`
    async fn name_taken(
        &mut self,
        name: &str,
        except: Option<CompanyId>,
    ) -> Result<bool, RepositoryError>;

    async fn insert(&mut self, company: NewCompany) -> Result<Company, RepositoryError>;

    async fn update(&mut self, company: &Company) -> Result<(), RepositoryError>;

    async fn delete(&mut self, id: CompanyId) -> Result<(), RepositoryError>;

    /// Queue an event for delivery once this transaction has committed
    fn after_commit(&mut self, event: CompanyMembershipEvent);

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError>;
}

/// Repository interface for User aggregates
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Start a transaction for a read-modify-write cycle
    async fn begin(&self) -> Result<Box<dyn UserTransaction>, RepositoryError>;

    /// Find user by ID (no lock)
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError>;

    /// Find all users whose ID is in `ids`; unknown IDs are skipped
    async fn find_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>, RepositoryError>;

    async fn exists(&self, id: UserId) -> Result<bool, RepositoryError>;

    /// List users ordered by ID
    async fn list(&self, page: PageRequest) -> Result<Page<User>, RepositoryError>;
}

/// Transaction scope over the User store
#[async_trait]
pub trait UserTransaction: Send {
    /// Read a user and hold its row lock until commit or rollback
    async fn find_for_update(&mut self, id: UserId) -> Result<Option<User>, RepositoryError>;

    async fn phone_taken(&mut self, phone: &str) -> Result<bool, RepositoryError>;

    async fn insert(&mut self, user: NewUser) -> Result<User, RepositoryError>;

    async fn update(&mut self, user: &User) -> Result<(), RepositoryError>;

    async fn delete(&mut self, id: UserId) -> Result<(), RepositoryError>;

    /// Queue an event for delivery once this transaction has committed
    fn after_commit(&mut self, event: UserMembershipEvent);

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("Row not found".to_string()),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                RepositoryError::Conflict(db.message().to_string())
            }
            _ => RepositoryError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_normalization() {
        let req = PageRequest::new(2, 0).normalized();
        assert_eq!(req.size, 1);
        let req = PageRequest::new(3, 500).normalized();
        assert_eq!(req.size, PageRequest::MAX_SIZE);
        assert_eq!(PageRequest::new(3, 10).offset(), 30);
    }

    #[test]
    fn test_page_map_keeps_metadata() {
        let page = Page {
            content: vec![1, 2, 3],
            page: 1,
            size: 3,
            total_elements: 9,
        };
        let mapped = page.map(|n| n * 10);
        assert_eq!(mapped.content, vec![10, 20, 30]);
        assert_eq!(mapped.total_elements, 9);
    }
}
