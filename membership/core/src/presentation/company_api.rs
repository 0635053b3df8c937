// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Company service HTTP API
//!
//! Public routes live under `/api/companies`. The `/{cid}/members/{uid}`
//! routes are the passive side of the protocol, called by the User service
//! gateway; they update local state only and never call back.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::application::company_service::CompanyService;
use crate::domain::company::CompanyDraft;
use crate::domain::membership::{CompanyId, UserId};
use crate::domain::repository::PageRequest;
use crate::presentation::error::{deletion_response, ApiError, MutationBody};

pub struct CompanyApiState {
    pub service: Arc<dyn CompanyService>,
}

pub fn company_router(service: Arc<dyn CompanyService>) -> Router {
    let state = CompanyApiState { service };

    Router::new()
        .route("/health", get(health))
        .route("/api/companies", post(create_company).get(list_companies))
        .route(
            "/api/companies/{id}",
            get(get_company).put(update_company).delete(delete_company),
        )
        .route("/api/companies/exists/{id}", get(company_exists))
        .route(
            "/api/companies/{company_id}/employees/{user_id}",
            post(add_employee).delete(remove_employee),
        )
        .route(
            "/api/companies/{company_id}/members/{user_id}",
            post(add_member).delete(remove_member),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn health() -> &'static str {
    "OK"
}

async fn create_company(
    State(state): State<Arc<CompanyApiState>>,
    Json(draft): Json<CompanyDraft>,
) -> Result<Response, ApiError> {
    let outcome = state.service.create_company(draft).await?;
    Ok((StatusCode::CREATED, Json(MutationBody::from(outcome))).into_response())
}

async fn list_companies(
    State(state): State<Arc<CompanyApiState>>,
    Query(page): Query<PageRequest>,
) -> Result<Response, ApiError> {
    let page = state.service.list_companies(page).await?;
    Ok(Json(page).into_response())
}

async fn get_company(
    State(state): State<Arc<CompanyApiState>>,
    Path(id): Path<CompanyId>,
) -> Result<Response, ApiError> {
    let view = state.service.get_company(id).await?;
    Ok(Json(view).into_response())
}

async fn company_exists(
    State(state): State<Arc<CompanyApiState>>,
    Path(id): Path<CompanyId>,
) -> Result<Json<bool>, ApiError> {
    Ok(Json(state.service.company_exists(id).await?))
}

async fn update_company(
    State(state): State<Arc<CompanyApiState>>,
    Path(id): Path<CompanyId>,
    Json(draft): Json<CompanyDraft>,
) -> Result<Response, ApiError> {
    let outcome = state.service.update_company(id, draft).await?;
    Ok(Json(MutationBody::from(outcome)).into_response())
}

async fn delete_company(
    State(state): State<Arc<CompanyApiState>>,
    Path(id): Path<CompanyId>,
) -> Result<Response, ApiError> {
    let outcome = state.service.delete_company(id).await?;
    Ok(deletion_response(outcome))
}

async fn add_employee(
    State(state): State<Arc<CompanyApiState>>,
    Path((company_id, user_id)): Path<(CompanyId, UserId)>,
) -> Result<Response, ApiError> {
    let outcome = state.service.add_employee(company_id, user_id).await?;
    Ok(Json(MutationBody::from(outcome)).into_response())
}

async fn remove_employee(
    State(state): State<Arc<CompanyApiState>>,
    Path((company_id, user_id)): Path<(CompanyId, UserId)>,
) -> Result<Response, ApiError> {
    let outcome = state.service.remove_employee(company_id, user_id).await?;
    Ok(Json(MutationBody::from(outcome)).into_response())
}

async fn add_member(
    State(state): State<Arc<CompanyApiState>>,
    Path((company_id, user_id)): Path<(CompanyId, UserId)>,
) -> Result<StatusCode, ApiError> {
    state.service.add_member(company_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_member(
    State(state): State<Arc<CompanyApiState>>,
    Path((company_id, user_id)): Path<(CompanyId, UserId)>,
) -> Result<StatusCode, ApiError> {
    state.service.remove_member(company_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
