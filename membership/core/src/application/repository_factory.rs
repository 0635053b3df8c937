// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory - Application Layer
//!
//! Creates concrete repository implementations based on storage backend
//! configuration, wiring each one to its service's propagation channel.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Select in-memory or PostgreSQL stores at startup

use anyhow::{bail, Result};
use sqlx::PgPool;
use std::sync::Arc;

use crate::domain::membership::{CompanyMembershipEvent, UserMembershipEvent};
use crate::domain::repository::{CompanyRepository, StorageBackend, UserRepository};
use crate::infrastructure::propagation_channel::PropagationSender;
use crate::infrastructure::repositories::{
    InMemoryCompanyRepository, InMemoryUserRepository, PostgresCompanyRepository,
    PostgresUserRepository,
};

/// Creates a CompanyRepository implementation based on the configured backend
pub fn create_company_repository(
    backend: &StorageBackend,
    pool: Option<PgPool>,
    propagation: PropagationSender<CompanyMembershipEvent>,
) -> Result<Arc<dyn CompanyRepository>> {
    match (backend, pool) {
        (StorageBackend::InMemory, _) => Ok(Arc::new(InMemoryCompanyRepository::new(propagation))),
        (StorageBackend::PostgreSQL(_), Some(pool)) => {
            Ok(Arc::new(PostgresCompanyRepository::new(pool, propagation)))
        }
        (StorageBackend::PostgreSQL(_), None) => bail!("PostgreSQL backend selected but no pool was provided"),
    }
}

/// Creates a UserRepository implementation based on the configured backend
pub fn create_user_repository(
    backend: &StorageBackend,
    pool: Option<PgPool>,
    propagation: PropagationSender<UserMembershipEvent>,
) -> Result<Arc<dyn UserRepository>> {
    match (backend, pool) {
        (StorageBackend::InMemory, _) => Ok(Arc::new(InMemoryUserRepository::new(propagation))),
        (StorageBackend::PostgreSQL(_), Some(pool)) => {
            Ok(Arc::new(PostgresUserRepository::new(pool, propagation)))
        }
        (StorageBackend::PostgreSQL(_), None) => bail!("PostgreSQL backend selected but no pool was provided"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::{PageRequest, PostgresConfig};
    use crate::infrastructure::propagation_channel::PropagationChannel;

    #[tokio::test]
    async fn test_in_memory_backend_needs_no_pool() {
        let channel = PropagationChannel::<UserMembershipEvent>::new("user-service", 4);
        let repo = create_user_repository(&StorageBackend::InMemory, None, channel.sender()).unwrap();
        assert_eq!(repo.list(PageRequest::default()).await.unwrap().total_elements, 0);
    }

    #[test]
    fn test_postgres_backend_requires_pool() {
        let channel = PropagationChannel::<CompanyMembershipEvent>::new("company-service", 4);
        let backend = StorageBackend::PostgreSQL(PostgresConfig {
            connection_string: "postgres://localhost/companies".to_string(),
        });
        assert!(create_company_repository(&backend, None, channel.sender()).is_err());
    }
}
