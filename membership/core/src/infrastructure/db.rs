// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Connection Pool
//!
//! Wraps `sqlx::postgres::PgPool` in a thin `Database` newtype that is
//! injected into the PostgreSQL repository implementations. Each service owns
//! its own database and runs only its own migration set.

use anyhow::{Context, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::domain::service_config::ServiceRole;

static COMPANY_MIGRATOR: Migrator = sqlx::migrate!("./migrations/company");
static USER_MIGRATOR: Migrator = sqlx::migrate!("./migrations/user");

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await
            .context("Failed to connect to database")?;

        Ok(Self { pool })
    }

    /// Apply the schema owned by `role`
    pub async fn migrate(&self, role: ServiceRole) -> Result<()> {
        let migrator = match role {
            ServiceRole::Company => &COMPANY_MIGRATOR,
            ServiceRole::User => &USER_MIGRATOR,
        };
        info!(role = %role, migrations = migrator.iter().count(), "Applying database migrations");
        migrator
            .run(&self.pool)
            .await
            .context("Failed to apply migrations")?;
        Ok(())
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }
}
