// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Membership Value Objects
//!
//! Shared vocabulary of the Company ↔ User relationship: the identifiers both
//! services exchange, the three-way outcome of every peer call, the snapshots
//! returned by enrichment reads, and the events handed to the deferred
//! propagation channel after a local commit.
//!
//! Each service owns exactly one half of a membership. The Company service
//! holds `employee_ids`, the User service holds `company_id`. Neither half is
//! authoritative for the other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Company identifier, assigned by the Company store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompanyId(pub i64);

/// User identifier, assigned by the User store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CompanyId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

// ============================================================================
// Peer Outcomes
// ============================================================================

/// Failure outcome of a Remote Peer Gateway call.
///
/// Together with `Ok(_)` this forms the complete outcome set of every peer
/// operation. `CounterpartNotFound` is a business fact the caller reacts to;
/// `PeerUnavailable` is an infrastructure fact the caller degrades around.
/// The two are never merged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("{peer} reports {entity} {id} does not exist")]
    CounterpartNotFound {
        peer: &'static str,
        entity: &'static str,
        id: String,
    },

    #[error("{peer} is unavailable: {reason}")]
    PeerUnavailable { peer: &'static str, reason: String },
}

impl PeerError {
    pub fn not_found(peer: &'static str, entity: &'static str, id: impl ToString) -> Self {
        Self::CounterpartNotFound {
            peer,
            entity,
            id: id.to_string(),
        }
    }

    pub fn unavailable(peer: &'static str, reason: impl Into<String>) -> Self {
        Self::PeerUnavailable {
            peer,
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CounterpartNotFound { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::PeerUnavailable { .. })
    }

    /// Short label used for metrics and structured logs.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Self::CounterpartNotFound { .. } => "counterpart_not_found",
            Self::PeerUnavailable { .. } => "peer_unavailable",
        }
    }
}

// ============================================================================
// Association State
// ============================================================================

/// Whether the local half of a membership is known to be mirrored remotely.
///
/// `Unpropagated` is set when the local write went ahead without the peer
/// confirming it (degraded create, failed deferred propagation). It is the
/// observable marker of drift; nothing retries it automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationState {
    #[default]
    Propagated,
    Unpropagated,
}

impl AssociationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Propagated => "propagated",
            Self::Unpropagated => "unpropagated",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "unpropagated" => Self::Unpropagated,
            _ => Self::Propagated,
        }
    }
}

// ============================================================================
// Snapshots (enrichment reads)
// ============================================================================

/// Company record as returned by the Company service to its peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanySnapshot {
    pub id: CompanyId,
    pub name: String,
    pub budget: u64,
}

/// User record as returned by the User service to its peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<CompanyId>,
}

/// Body returned by the User service when a company attaches a user.
///
/// `previous_company_id` lets the Company service drop the stale employee
/// entry from the company the user was attached to before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MembershipAck {
    #[serde(default)]
    pub previous_company_id: Option<CompanyId>,
}

// ============================================================================
// Deferred Propagation Events
// ============================================================================

/// Envelope metadata attached to every deferred event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub event_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn new() -> Self {
        Self {
            event_id: Uuid::new_v4(),
            recorded_at: Utc::now(),
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Events recorded by the User service inside a transaction and delivered
/// to the Company service after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserMembershipEvent {
    /// A user was created under a company; the company must list them.
    UserJoined {
        meta: EventMeta,
        user_id: UserId,
        company_id: CompanyId,
    },
    /// A user was deleted; the company must forget them.
    UserLeft {
        meta: EventMeta,
        user_id: UserId,
        company_id: CompanyId,
    },
}

impl UserMembershipEvent {
    pub fn joined(user_id: UserId, company_id: CompanyId) -> Self {
        Self::UserJoined {
            meta: EventMeta::new(),
            user_id,
            company_id,
        }
    }

    pub fn left(user_id: UserId, company_id: CompanyId) -> Self {
        Self::UserLeft {
            meta: EventMeta::new(),
            user_id,
            company_id,
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::UserJoined { meta, .. } | Self::UserLeft { meta, .. } => meta,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
        }
    }
}

/// Events recorded by the Company service inside a transaction and delivered
/// to the User service after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompanyMembershipEvent {
    /// A company was created with an initial employee set.
    CompanyFormed {
        meta: EventMeta,
        company_id: CompanyId,
        employee_ids: BTreeSet<UserId>,
    },
    /// A company was deleted; each former employee must be detached.
    CompanyDissolved {
        meta: EventMeta,
        company_id: CompanyId,
        employee_ids: BTreeSet<UserId>,
    },
}

impl CompanyMembershipEvent {
    pub fn formed(company_id: CompanyId, employee_ids: BTreeSet<UserId>) -> Self {
        Self::CompanyFormed {
            meta: EventMeta::new(),
            company_id,
            employee_ids,
        }
    }

    pub fn dissolved(company_id: CompanyId, employee_ids: BTreeSet<UserId>) -> Self {
        Self::CompanyDissolved {
            meta: EventMeta::new(),
            company_id,
            employee_ids,
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::CompanyFormed { meta, .. } | Self::CompanyDissolved { meta, .. } => meta,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::CompanyFormed { .. } => "company_formed",
            Self::CompanyDissolved { .. } => "company_dissolved",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_parse_and_display() {
        assert_eq!("42".parse::<CompanyId>().unwrap(), CompanyId(42));
        assert_eq!(" 7 ".parse::<UserId>().unwrap(), UserId(7));
        assert!("abc".parse::<UserId>().is_err());
        assert_eq!(CompanyId(9).to_string(), "9");
    }

    #[test]
    fn test_peer_error_kinds_stay_distinct() {
        let missing = PeerError::not_found("company-service", "company", CompanyId(999));
        let down = PeerError::unavailable("company-service", "connection refused");

        assert!(missing.is_not_found());
        assert!(!missing.is_unavailable());
        assert!(down.is_unavailable());
        assert_ne!(missing.outcome_label(), down.outcome_label());
        assert!(missing.to_string().contains("999"));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = UserMembershipEvent::joined(UserId(1), CompanyId(7));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "user_joined");
        assert_eq!(json["company_id"], 7);
        assert_eq!(event.kind(), "user_joined");
    }

    #[test]
    fn test_association_state_parse() {
        assert_eq!(AssociationState::parse("unpropagated"), AssociationState::Unpropagated);
        assert_eq!(AssociationState::parse("propagated"), AssociationState::Propagated);
        assert_eq!(AssociationState::Unpropagated.as_str(), "unpropagated");
    }
}
