// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Remote Peer Gateway (HTTP)
//!
//! reqwest implementations of `CompanyPeer` and `UserPeer`.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Call the peer service and classify every response
//! - **Integration:** Coordinator → gateway → peer `/exists`, `/{id}`, `/members` routes
//!
//! # Outcome classification
//!
//! | Peer response | Result |
//! |---------------|--------|
//! | 2xx with a well-formed body | `Ok(_)` |
//! | 404 | `CounterpartNotFound` (`exists` answers `Ok(false)`) |
//! | 409 on a membership add | `Ok(_)`; the link is already there |
//! | any other status, timeout, connect error, bad body | `PeerUnavailable` |
//!
//! Every call is bounded by the client timeout, so a hung peer surfaces as
//! `PeerUnavailable` instead of holding the caller's row lock indefinitely.
//!
//! # Cross-service lock wait
//!
//! Synchronous membership calls are made while the caller holds its own row
//! lock. A user reassociation holds the user row while it calls the company's
//! `/members` route, and a company `add_employee` holds the company row while
//! it calls the user's `/members` route. When both target the same pair at
//! once, each passive handler waits on the row the other caller holds. Neither
//! side can make progress until both client timeouts expire, and both requests
//! then fail with `PeerUnavailable` (503). The timeout is the only bound; there
//! is no cross-service lock ordering.

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::membership::{
    CompanyId, CompanySnapshot, MembershipAck, PeerError, UserId, UserSnapshot,
};
use crate::domain::peer::{CompanyPeer, UserPeer, COMPANY_PEER, USER_PEER};

// ============================================================================
// Shared HTTP plumbing
// ============================================================================

/// One peer endpoint with a bounded-timeout client
#[derive(Clone)]
struct PeerEndpoint {
    peer: &'static str,
    base_url: String,
    client: Client,
}

impl PeerEndpoint {
    fn new(peer: &'static str, base_url: impl Into<String>, timeout: Duration) -> Result<Self, PeerError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| PeerError::unavailable(peer, format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            peer,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(&self, method: Method, path: &str) -> Result<Response, PeerError> {
        let url = self.url(path);
        debug!(peer = self.peer, %method, %url, "Calling peer");
        self.client
            .request(method, &url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, err: reqwest::Error) -> PeerError {
        let reason = if err.is_timeout() {
            format!("request timed out: {}", err)
        } else if err.is_connect() {
            format!("connection failed: {}", err)
        } else {
            err.to_string()
        };
        PeerError::unavailable(self.peer, reason)
    }

    fn unexpected_status(&self, status: StatusCode) -> PeerError {
        PeerError::unavailable(self.peer, format!("unexpected status {}", status))
    }

    async fn body<T: DeserializeOwned>(&self, response: Response) -> Result<T, PeerError> {
        response
            .json::<T>()
            .await
            .map_err(|e| PeerError::unavailable(self.peer, format!("malformed response body: {}", e)))
    }

    async fn exists(&self, entity: &'static str, id: i64) -> Result<bool, PeerError> {
        let response = self.send(Method::GET, &format!("exists/{}", id)).await?;
        match response.status() {
            s if s.is_success() => self.body::<bool>(response).await,
            StatusCode::NOT_FOUND => {
                debug!(peer = self.peer, entity, id, "Peer answered 404 to existence check");
                Ok(false)
            }
            s => Err(self.unexpected_status(s)),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, entity: &'static str, id: i64) -> Result<T, PeerError> {
        let response = self.send(Method::GET, &id.to_string()).await?;
        match response.status() {
            s if s.is_success() => self.body(response).await,
            StatusCode::NOT_FOUND => Err(PeerError::not_found(self.peer, entity, id)),
            s => Err(self.unexpected_status(s)),
        }
    }

    /// POST or DELETE on `{parent}/members/{child}`; returns the response on success
    async fn membership(
        &self,
        method: Method,
        entity: &'static str,
        parent: i64,
        child: i64,
    ) -> Result<Option<Response>, PeerError> {
        let adding = method == Method::POST;
        let response = self
            .send(method, &format!("{}/members/{}", parent, child))
            .await?;
        match response.status() {
            s if s.is_success() => Ok(Some(response)),
            StatusCode::CONFLICT if adding => {
                warn!(
                    peer = self.peer,
                    parent, child, "Peer already holds this membership; treating add as done"
                );
                Ok(None)
            }
            StatusCode::NOT_FOUND => Err(PeerError::not_found(self.peer, entity, parent)),
            s => Err(self.unexpected_status(s)),
        }
    }
}

// ============================================================================
// Company peer (called by the User service)
// ============================================================================

pub struct HttpCompanyPeer {
    endpoint: PeerEndpoint,
}

impl HttpCompanyPeer {
    /// `base_url` is the company collection, e.g. `http://company-service:8882/api/companies`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PeerError> {
        Ok(Self {
            endpoint: PeerEndpoint::new(COMPANY_PEER, base_url, timeout)?,
        })
    }
}

#[async_trait]
impl CompanyPeer for HttpCompanyPeer {
    async fn exists(&self, id: CompanyId) -> Result<bool, PeerError> {
        self.endpoint.exists("company", id.0).await
    }

    async fn fetch_snapshot(&self, id: CompanyId) -> Result<CompanySnapshot, PeerError> {
        self.endpoint.fetch("company", id.0).await
    }

    async fn add_membership(&self, company_id: CompanyId, user_id: UserId) -> Result<(), PeerError> {
        self.endpoint
            .membership(Method::POST, "company", company_id.0, user_id.0)
            .await
            .map(|_| ())
    }

    async fn remove_membership(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<(), PeerError> {
        self.endpoint
            .membership(Method::DELETE, "company", company_id.0, user_id.0)
            .await
            .map(|_| ())
    }
}

// ============================================================================
// User peer (called by the Company service)
// ============================================================================

pub struct HttpUserPeer {
    endpoint: PeerEndpoint,
}

impl HttpUserPeer {
    /// `base_url` is the user collection, e.g. `http://user-service:8881/api/users`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PeerError> {
        Ok(Self {
            endpoint: PeerEndpoint::new(USER_PEER, base_url, timeout)?,
        })
    }
}

#[async_trait]
impl UserPeer for HttpUserPeer {
    async fn exists(&self, id: UserId) -> Result<bool, PeerError> {
        self.endpoint.exists("user", id.0).await
    }

    async fn fetch_batch(&self, ids: &[UserId]) -> Result<HashMap<UserId, UserSnapshot>, PeerError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let joined = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let response = self
            .endpoint
            .send(Method::GET, &format!("batch?ids={}", joined))
            .await?;
        match response.status() {
            s if s.is_success() => {
                let users: Vec<UserSnapshot> = self.endpoint.body(response).await?;
                Ok(users.into_iter().map(|u| (u.id, u)).collect())
            }
            s => Err(self.endpoint.unexpected_status(s)),
        }
    }

    async fn add_membership(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<Option<CompanyId>, PeerError> {
        // The user side addresses the user, so a 404 means the user is gone.
        let response = self
            .endpoint
            .membership(Method::POST, "user", company_id.0, user_id.0)
            .await
            .map_err(|e| match e {
                PeerError::CounterpartNotFound { peer, entity, .. } => {
                    PeerError::not_found(peer, entity, user_id)
                }
                other => other,
            })?;
        match response {
            Some(response) => {
                let ack: MembershipAck = self.endpoint.body(response).await?;
                Ok(ack.previous_company_id.filter(|previous| *previous != company_id))
            }
            None => Ok(None),
        }
    }

    async fn remove_membership(
        &self,
        company_id: CompanyId,
        user_id: UserId,
    ) -> Result<(), PeerError> {
        self.endpoint
            .membership(Method::DELETE, "user", company_id.0, user_id.0)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                PeerError::CounterpartNotFound { peer, entity, .. } => {
                    PeerError::not_found(peer, entity, user_id)
                }
                other => other,
            })
    }
}
