// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! User service HTTP API
//!
//! `/api/users/{cid}/members/{uid}` is called by the Company service gateway.
//! Attaching answers with a [`MembershipAck`](crate::domain::membership::MembershipAck)
//! naming the user's previous company, if any.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::application::user_service::UserService;
use crate::domain::errors::MembershipError;
use crate::domain::membership::{CompanyId, UserId};
use crate::domain::repository::PageRequest;
use crate::domain::user::UserDraft;
use crate::presentation::error::{deletion_response, ApiError, MutationBody};

pub struct UserApiState {
    pub service: Arc<dyn UserService>,
}

pub fn user_router(service: Arc<dyn UserService>) -> Router {
    let state = UserApiState { service };

    Router::new()
        .route("/health", get(health))
        .route("/api/users", post(create_user).get(list_users))
        .route("/api/users/batch", get(users_batch))
        .route("/api/users/exists/{id}", get(user_exists))
        .route(
            "/api/users/{id}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route(
            "/api/users/{company_id}/members/{user_id}",
            post(attach_company).delete(detach_company),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
struct BatchQuery {
    #[serde(default)]
    ids: String,
}

impl BatchQuery {
    /// `ids=1,2,3`; blanks are skipped
    fn parse(&self) -> Result<Vec<UserId>, MembershipError> {
        self.ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<UserId>()
                    .map_err(|_| MembershipError::validation(format!("Invalid user id: {}", s)))
            })
            .collect()
    }
}

async fn create_user(
    State(state): State<Arc<UserApiState>>,
    Json(draft): Json<UserDraft>,
) -> Result<Response, ApiError> {
    let outcome = state.service.create_user(draft).await?;
    Ok((StatusCode::CREATED, Json(MutationBody::from(outcome))).into_response())
}

async fn list_users(
    State(state): State<Arc<UserApiState>>,
    Query(page): Query<PageRequest>,
) -> Result<Response, ApiError> {
    let page = state.service.list_users(page).await?;
    Ok(Json(page).into_response())
}

async fn users_batch(
    State(state): State<Arc<UserApiState>>,
    Query(query): Query<BatchQuery>,
) -> Result<Response, ApiError> {
    let ids = query.parse()?;
    let users = state.service.users_batch(&ids).await?;
    Ok(Json(users).into_response())
}

async fn get_user(
    State(state): State<Arc<UserApiState>>,
    Path(id): Path<UserId>,
) -> Result<Response, ApiError> {
    let view = state.service.get_user(id).await?;
    Ok(Json(view).into_response())
}

async fn user_exists(
    State(state): State<Arc<UserApiState>>,
    Path(id): Path<UserId>,
) -> Result<Json<bool>, ApiError> {
    Ok(Json(state.service.user_exists(id).await?))
}

async fn update_user(
    State(state): State<Arc<UserApiState>>,
    Path(id): Path<UserId>,
    Json(draft): Json<UserDraft>,
) -> Result<Response, ApiError> {
    let outcome = state.service.update_user(id, draft).await?;
    Ok(Json(MutationBody::from(outcome)).into_response())
}

async fn delete_user(
    State(state): State<Arc<UserApiState>>,
    Path(id): Path<UserId>,
) -> Result<Response, ApiError> {
    let outcome = state.service.delete_user(id).await?;
    Ok(deletion_response(outcome))
}

async fn attach_company(
    State(state): State<Arc<UserApiState>>,
    Path((company_id, user_id)): Path<(CompanyId, UserId)>,
) -> Result<Response, ApiError> {
    let ack = state.service.attach_company(company_id, user_id).await?;
    Ok(Json(ack).into_response())
}

async fn detach_company(
    State(state): State<Arc<UserApiState>>,
    Path((company_id, user_id)): Path<(CompanyId, UserId)>,
) -> Result<StatusCode, ApiError> {
    state.service.detach_company(company_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_query_parsing() {
        let query = BatchQuery { ids: "1, 2,,3".into() };
        assert_eq!(query.parse().unwrap(), vec![UserId(1), UserId(2), UserId(3)]);

        let bad = BatchQuery { ids: "1,x".into() };
        assert!(matches!(bad.parse(), Err(MembershipError::Validation(_))));

        assert!(BatchQuery { ids: String::new() }.parse().unwrap().is_empty());
    }
}
