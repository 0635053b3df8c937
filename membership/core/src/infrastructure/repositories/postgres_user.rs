// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL User Repository
//!
//! `UserRepository` backed by the `users` table. Same transaction model as
//! `PostgresCompanyRepository`.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};

use crate::domain::membership::{AssociationState, CompanyId, UserId, UserMembershipEvent};
use crate::domain::repository::{Page, PageRequest, RepositoryError, UserRepository, UserTransaction};
use crate::domain::user::{NewUser, User};
use crate::infrastructure::propagation_channel::{PostCommitHooks, PropagationSender};

const USER_COLUMNS: &str = "id, first_name, last_name, phone_number, company_id, association";

pub struct PostgresUserRepository {
    pool: PgPool,
    propagation: PropagationSender<UserMembershipEvent>,
}

impl PostgresUserRepository {
    pub fn new(pool: PgPool, propagation: PropagationSender<UserMembershipEvent>) -> Self {
        Self { pool, propagation }
    }
}

fn user_from_row(row: &PgRow) -> Result<User, RepositoryError> {
    let company_id: Option<i64> = row.try_get("company_id")?;
    let association: String = row.try_get("association")?;
    Ok(User {
        id: UserId(row.try_get("id")?),
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        phone_number: row.try_get("phone_number")?,
        company_id: company_id.map(CompanyId),
        association: AssociationState::parse(&association),
    })
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn begin(&self) -> Result<Box<dyn UserTransaction>, RepositoryError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresUserTransaction {
            tx,
            hooks: self.propagation.hooks(),
        }))
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_by_ids(&self, ids: &[UserId]) -> Result<Vec<User>, RepositoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = ids.iter().map(|u| u.0).collect();
        let rows = sqlx::query(&format!(
            "SELECT {} FROM users WHERE id = ANY($1) ORDER BY id",
            USER_COLUMNS
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn exists(&self, id: UserId) -> Result<bool, RepositoryError> {
        let found: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
            .bind(id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(found)
    }

    async fn list(&self, page: PageRequest) -> Result<Page<User>, RepositoryError> {
        let page = page.normalized();
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM users ORDER BY id LIMIT $1 OFFSET $2",
            USER_COLUMNS
        ))
        .bind(i64::from(page.size))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page {
            content: rows.iter().map(user_from_row).collect::<Result<_, _>>()?,
            page: page.page,
            size: page.size,
            total_elements: total.max(0) as u64,
        })
    }
}

pub struct PostgresUserTransaction {
    tx: Transaction<'static, Postgres>,
    hooks: PostCommitHooks<UserMembershipEvent>,
}

#[async_trait]
impl UserTransaction for PostgresUserTransaction {
    async fn find_for_update(&mut self, id: UserId) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE id = $1 FOR UPDATE",
            USER_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn phone_taken(&mut self, phone: &str) -> Result<bool, RepositoryError> {
        let taken: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE phone_number = $1)")
                .bind(phone)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(taken)
    }

    async fn insert(&mut self, user: NewUser) -> Result<User, RepositoryError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO users (first_name, last_name, phone_number, company_id, association)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.phone_number)
        .bind(user.company_id.map(|c| c.0))
        .bind(user.association.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(user.into_user(UserId(id)))
    }

    async fn update(&mut self, user: &User) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET first_name = $2, last_name = $3, company_id = $4, association = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user.id.0)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.company_id.map(|c| c.0))
        .bind(user.association.as_str())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("user {}", user.id)));
        }
        Ok(())
    }

    async fn delete(&mut self, id: UserId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("user {}", id)));
        }
        Ok(())
    }

    fn after_commit(&mut self, event: UserMembershipEvent) {
        self.hooks.record(event);
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        let Self { tx, hooks } = *self;
        match tx.commit().await {
            Ok(()) => {
                hooks.release();
                Ok(())
            }
            Err(e) => {
                hooks.discard();
                Err(e.into())
            }
        }
    }
}
