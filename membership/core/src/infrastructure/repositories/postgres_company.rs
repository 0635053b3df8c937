// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Company Repository
//!
//! `CompanyRepository` backed by the `companies` and `company_employees`
//! tables. A `CompanyTransaction` wraps one `sqlx::Transaction`; rows read
//! with `find_for_update` are locked with `SELECT ... FOR UPDATE` until the
//! transaction ends. Dropping the transaction rolls it back.

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::company::{Company, NewCompany};
use crate::domain::membership::{AssociationState, CompanyId, CompanyMembershipEvent, UserId};
use crate::domain::repository::{
    CompanyRepository, CompanyTransaction, Page, PageRequest, RepositoryError,
};
use crate::infrastructure::propagation_channel::{PostCommitHooks, PropagationSender};

pub struct PostgresCompanyRepository {
    pool: PgPool,
    propagation: PropagationSender<CompanyMembershipEvent>,
}

impl PostgresCompanyRepository {
    pub fn new(pool: PgPool, propagation: PropagationSender<CompanyMembershipEvent>) -> Self {
        Self { pool, propagation }
    }
}

fn budget_to_db(budget: u64) -> Result<i64, RepositoryError> {
    i64::try_from(budget)
        .map_err(|_| RepositoryError::Serialization(format!("budget {} out of range", budget)))
}

fn company_from_row(row: &PgRow, employee_ids: BTreeSet<UserId>) -> Result<Company, RepositoryError> {
    let budget: i64 = row.try_get("budget")?;
    let association: String = row.try_get("association")?;
    Ok(Company {
        id: CompanyId(row.try_get("id")?),
        name: row.try_get("name")?,
        budget: u64::try_from(budget)
            .map_err(|_| RepositoryError::Serialization(format!("negative budget {}", budget)))?,
        employee_ids,
        association: AssociationState::parse(&association),
    })
}

async fn load_employees(
    conn: &mut PgConnection,
    company_id: CompanyId,
) -> Result<BTreeSet<UserId>, RepositoryError> {
    let rows = sqlx::query(
        "SELECT user_id FROM company_employees WHERE company_id = $1 ORDER BY user_id",
    )
    .bind(company_id.0)
    .fetch_all(conn)
    .await?;

    rows.iter()
        .map(|row| row.try_get::<i64, _>("user_id").map(UserId))
        .collect::<Result<_, _>>()
        .map_err(RepositoryError::from)
}

async fn load_company(
    conn: &mut PgConnection,
    id: CompanyId,
    for_update: bool,
) -> Result<Option<Company>, RepositoryError> {
    let sql = if for_update {
        "SELECT id, name, budget, association FROM companies WHERE id = $1 FOR UPDATE"
    } else {
        "SELECT id, name, budget, association FROM companies WHERE id = $1"
    };
    let row = sqlx::query(sql).bind(id.0).fetch_optional(&mut *conn).await?;

    match row {
        Some(row) => {
            let employees = load_employees(conn, id).await?;
            Ok(Some(company_from_row(&row, employees)?))
        }
        None => Ok(None),
    }
}

async fn replace_employees(
    conn: &mut PgConnection,
    company_id: CompanyId,
    employee_ids: &BTreeSet<UserId>,
) -> Result<(), RepositoryError> {
    sqlx::query("DELETE FROM company_employees WHERE company_id = $1")
        .bind(company_id.0)
        .execute(&mut *conn)
        .await?;

    if !employee_ids.is_empty() {
        let ids: Vec<i64> = employee_ids.iter().map(|u| u.0).collect();
        sqlx::query(
            "INSERT INTO company_employees (company_id, user_id) SELECT $1, unnest($2::BIGINT[])",
        )
        .bind(company_id.0)
        .bind(ids)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl CompanyRepository for PostgresCompanyRepository {
    async fn begin(&self) -> Result<Box<dyn CompanyTransaction>, RepositoryError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresCompanyTransaction {
            tx,
            hooks: self.propagation.hooks(),
        }))
    }

    async fn find_by_id(&self, id: CompanyId) -> Result<Option<Company>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        load_company(&mut conn, id, false).await
    }

    async fn exists(&self, id: CompanyId) -> Result<bool, RepositoryError> {
        let found: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM companies WHERE id = $1)")
            .bind(id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(found)
    }

    async fn list(&self, page: PageRequest) -> Result<Page<Company>, RepositoryError> {
        let page = page.normalized();
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM companies")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            r#"
            SELECT id, name, budget, association
            FROM companies
            ORDER BY id
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(page.size))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<i64> = rows
            .iter()
            .map(|row| row.try_get::<i64, _>("id"))
            .collect::<Result<_, _>>()?;

        let mut employees: BTreeMap<i64, BTreeSet<UserId>> = BTreeMap::new();
        if !ids.is_empty() {
            let member_rows = sqlx::query(
                "SELECT company_id, user_id FROM company_employees WHERE company_id = ANY($1)",
            )
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;
            for row in member_rows {
                let company_id: i64 = row.try_get("company_id")?;
                let user_id: i64 = row.try_get("user_id")?;
                employees.entry(company_id).or_default().insert(UserId(user_id));
            }
        }

        let mut content = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            content.push(company_from_row(row, employees.remove(&id).unwrap_or_default())?);
        }

        Ok(Page {
            content,
            page: page.page,
            size: page.size,
            total_elements: total.max(0) as u64,
        })
    }
}

pub struct PostgresCompanyTransaction {
    tx: Transaction<'static, Postgres>,
    hooks: PostCommitHooks<CompanyMembershipEvent>,
}

#[async_trait]
impl CompanyTransaction for PostgresCompanyTransaction {
    async fn find_for_update(&mut self, id: CompanyId) -> Result<Option<Company>, RepositoryError> {
        load_company(&mut self.tx, id, true).await
    }

    async fn name_taken(
        &mut self,
        name: &str,
        except: Option<CompanyId>,
    ) -> Result<bool, RepositoryError> {
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM companies WHERE name = $1 AND ($2::BIGINT IS NULL OR id <> $2))",
        )
        .bind(name)
        .bind(except.map(|c| c.0))
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(taken)
    }

    async fn insert(&mut self, company: NewCompany) -> Result<Company, RepositoryError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO companies (name, budget, association)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(&company.name)
        .bind(budget_to_db(company.budget)?)
        .bind(company.association.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        let id = CompanyId(id);
        replace_employees(&mut self.tx, id, &company.employee_ids).await?;
        Ok(company.into_company(id))
    }

    async fn update(&mut self, company: &Company) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE companies
            SET name = $2, budget = $3, association = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(company.id.0)
        .bind(&company.name)
        .bind(budget_to_db(company.budget)?)
        .bind(company.association.as_str())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("company {}", company.id)));
        }
        replace_employees(&mut self.tx, company.id, &company.employee_ids).await
    }

    async fn delete(&mut self, id: CompanyId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM companies WHERE id = $1")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("company {}", id)));
        }
        Ok(())
    }

    fn after_commit(&mut self, event: CompanyMembershipEvent) {
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
