// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Membership Error Taxonomy
//!
//! Every mutating operation of either service resolves to a success payload
//! or exactly one `MembershipError`. The presentation layer maps the kinds to
//! HTTP statuses; see `crate::presentation::error`.
//!
//! | Kind | Origin | Caller sees |
//! |------|--------|-------------|
//! | `Validation` | malformed input, checked before any remote call | 4xx |
//! | `NotFound` | the local entity addressed by the request is absent | 4xx |
//! | `CounterpartNotFound` | the peer confirmed the remote entity is absent | 4xx |
//! | `Conflict` | duplicate membership, name or phone collision | 4xx |
//! | `PeerUnavailable` | the peer timed out or failed before commit | 5xx |
//! | `Persistence` | local store failure, transaction rolled back | 5xx |

use serde::Serialize;

use crate::domain::membership::PeerError;
use crate::domain::repository::RepositoryError;

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found with id: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Referenced {entity} {id} does not exist")]
    CounterpartNotFound { entity: &'static str, id: String },

    #[error("{peer} is unavailable: {reason}")]
    PeerUnavailable { peer: &'static str, reason: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Persistence failure: {0}")]
    Persistence(RepositoryError),
}

/// Coarse classification used by the presentation layer and by logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    CounterpartNotFound,
    PeerUnavailable,
    Conflict,
    Persistence,
}

impl MembershipError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::CounterpartNotFound { .. } => ErrorKind::CounterpartNotFound,
            Self::PeerUnavailable { .. } => ErrorKind::PeerUnavailable,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Persistence(_) => ErrorKind::Persistence,
        }
    }

    /// Rejections caused by the request itself rather than by infrastructure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Validation
                | ErrorKind::NotFound
                | ErrorKind::CounterpartNotFound
                | ErrorKind::Conflict
        )
    }
}

impl From<PeerError> for MembershipError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::CounterpartNotFound { entity, id, .. } => {
                Self::CounterpartNotFound { entity, id }
            }
            PeerError::PeerUnavailable { peer, reason } => Self::PeerUnavailable { peer, reason },
        }
    }
}

impl From<RepositoryError> for MembershipError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Persistence(other),
        }
    }
}

/// Non-fatal observation attached to a successful mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MembershipWarning {
    /// The entity was stored although the peer could not confirm the link.
    AssociationUnpropagated { reason: String },
    /// The local entity was removed but the peer could not be told.
    RemoteUnlinkFailed { counterpart: String, reason: String },
}

impl std::fmt::Display for MembershipWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AssociationUnpropagated { reason } => {
                write!(f, "association stored unpropagated: {}", reason)
            }
            Self::RemoteUnlinkFailed {
                counterpart,
                reason,
            } => write!(f, "could not unlink {}: {}", counterpart, reason),
        }
    }
}

/// Successful result of a coordinated mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome<T> {
    pub value: T,
    pub warnings: Vec<MembershipWarning>,
}

impl<T> MutationOutcome<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(value: T, warnings: Vec<MembershipWarning>) -> Self {
        Self { value, warnings }
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MutationOutcome<U> {
        MutationOutcome {
            value: f(self.value),
            warnings: self.warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_error_conversion_preserves_kind() {
        let err: MembershipError = PeerError::not_found("company-service", "company", 999).into();
        assert_eq!(err.kind(), ErrorKind::CounterpartNotFound);
        assert!(err.is_rejection());

        let err: MembershipError = PeerError::unavailable("company-service", "timeout").into();
        assert_eq!(err.kind(), ErrorKind::PeerUnavailable);
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_repository_conflict_becomes_conflict() {
        let err: MembershipError = RepositoryError::Conflict("phone taken".into()).into();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err: MembershipError = RepositoryError::Database("broken pipe".into()).into();
        assert_eq!(err.kind(), ErrorKind::Persistence);
    }
}
