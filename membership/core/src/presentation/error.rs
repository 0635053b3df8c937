// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! HTTP mapping of `MembershipError`
//!
//! | Kind | Status |
//! |------|--------|
//! | `Validation` | 400 Bad Request |
//! | `NotFound` | 404 Not Found |
//! | `Conflict` | 409 Conflict |
//! | `CounterpartNotFound` | 422 Unprocessable Entity |
//! | `PeerUnavailable` | 503 Service Unavailable |
//! | `Persistence` | 500 Internal Server Error |
//!
//! The peer gateway relies on 404 and 409 from the passive `/members/`
//! routes, so those two must stay stable.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::error;

use crate::domain::errors::{ErrorKind, MembershipError, MembershipWarning, MutationOutcome};

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::CounterpartNotFound => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::PeerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error response wrapper so handlers can use `?`
#[derive(Debug)]
pub struct ApiError(pub MembershipError);

impl From<MembershipError> for ApiError {
    fn from(err: MembershipError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = Json(json!({
            "error": kind,
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Successful mutation body: the entity plus any warnings
#[derive(Debug, Serialize)]
pub struct MutationBody<T: Serialize> {
    #[serde(flatten)]
    pub value: T,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<MembershipWarning>,
}

impl<T: Serialize> From<MutationOutcome<T>> for MutationBody<T> {
    fn from(outcome: MutationOutcome<T>) -> Self {
        Self {
            value: outcome.value,
            warnings: outcome.warnings,
        }
    }
}

/// 204 for a clean deletion, 200 with the warnings otherwise
pub fn deletion_response(outcome: MutationOutcome<()>) -> Response {
    if outcome.is_clean() {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::OK, Json(json!({ "warnings": outcome.warnings }))).into_response()
    }
}
