// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Coordinated Mutation Tracking
//!
//! Two small pieces shared by both coordinators:
//!
//! - [`MutationTracker`]: the per-request state machine
//!   `Validating → LocalWriteApplied → RemoteSyncAttempted → Done`, with
//!   `Aborted` reachable from `Validating` only. Everything up to and
//!   including the local commit happens in `Validating`; once the commit is
//!   durable the request can no longer abort, only collect warnings.
//! - [`CompensationLog`]: the remote membership steps a request already
//!   performed, undone in reverse order when a later step fails.

use async_trait::async_trait;
use std::fmt;
use tracing::{debug, error, warn};

use crate::domain::errors::MembershipError;
use crate::domain::membership::{CompanyId, PeerError, UserId};
use crate::domain::peer::{CompanyPeer, UserPeer};

// ============================================================================
// State machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Validating,
    LocalWriteApplied,
    RemoteSyncAttempted,
    Done,
    Aborted,
}

impl MutationPhase {
    pub fn can_transition_to(self, next: MutationPhase) -> bool {
        use MutationPhase::*;
        matches!(
            (self, next),
            (Validating, LocalWriteApplied)
                | (Validating, Aborted)
                | (LocalWriteApplied, RemoteSyncAttempted)
                | (RemoteSyncAttempted, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MutationPhase::Done | MutationPhase::Aborted)
    }
}

impl fmt::Display for MutationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validating => "validating",
            Self::LocalWriteApplied => "local_write_applied",
            Self::RemoteSyncAttempted => "remote_sync_attempted",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Tracks one coordinated mutation through its phases
#[derive(Debug)]
pub struct MutationTracker {
    operation: &'static str,
    subject: String,
    phase: MutationPhase,
}

impl MutationTracker {
    pub fn begin(operation: &'static str, subject: impl fmt::Display) -> Self {
        let subject = subject.to_string();
        debug!(operation, subject = %subject, phase = %MutationPhase::Validating, "Mutation started");
        Self {
            operation,
            subject,
            phase: MutationPhase::Validating,
        }
    }

    pub fn phase(&self) -> MutationPhase {
        self.phase
    }

    /// Name the subject once it is known (e.g. after an insert assigned an id)
    pub fn identify(&mut self, subject: impl fmt::Display) {
        self.subject = subject.to_string();
    }

    fn advance(&mut self, next: MutationPhase) {
        if !self.phase.can_transition_to(next) {
            error!(
                operation = self.operation,
                subject = %self.subject,
                from = %self.phase,
                to = %next,
                "Illegal mutation phase transition ignored"
            );
            return;
        }
        debug!(
            operation = self.operation,
            subject = %self.subject,
            from = %self.phase,
            to = %next,
            "Mutation phase transition"
        );
        self.phase = next;
    }

    /// The local transaction committed
    pub fn local_write_applied(&mut self) {
        self.advance(MutationPhase::LocalWriteApplied);
    }

    /// Remote reconciliation was performed or handed to the deferred channel
    pub fn remote_sync_attempted(&mut self, how: &'static str) {
        debug!(operation = self.operation, subject = %self.subject, how, "Remote sync attempted");
        self.advance(MutationPhase::RemoteSyncAttempted);
    }

    pub fn done(&mut self) {
        self.advance(MutationPhase::Done);
    }

    /// Record the failure and hand the error back for `?`/`return Err(..)`
    pub fn abort(&mut self, err: MembershipError) -> MembershipError {
        if err.is_rejection() {
            debug!(operation = self.operation, subject = %self.subject, error = %err, "Mutation rejected");
        } else {
            warn!(operation = self.operation, subject = %self.subject, error = %err, "Mutation aborted");
        }
        self.advance(MutationPhase::Aborted);
        err
    }

    /// Commit, sync and finish in one go for the common straight path
    pub fn finish(&mut self, how: &'static str) {
        self.local_write_applied();
        self.remote_sync_attempted(how);
        self.done();
    }
}

// ============================================================================
// Compensation
// ============================================================================

/// Add/remove access to the remote half of a membership, regardless of direction
#[async_trait]
pub trait MembershipLink: Send + Sync {
    async fn link(&self, company_id: CompanyId, user_id: UserId) -> Result<(), PeerError>;
    async fn unlink(&self, company_id: CompanyId, user_id: UserId) -> Result<(), PeerError>;
}

#[async_trait]
impl MembershipLink for dyn CompanyPeer {
    async fn link(&self, company_id: CompanyId, user_id: UserId) -> Result<(), PeerError> {
        self.add_membership(company_id, user_id).await
    }

    async fn unlink(&self, company_id: CompanyId, user_id: UserId) -> Result<(), PeerError> {
        self.remove_membership(company_id, user_id).await
    }
}

#[async_trait]
impl MembershipLink for dyn UserPeer {
    async fn link(&self, company_id: CompanyId, user_id: UserId) -> Result<(), PeerError> {
        self.add_membership(company_id, user_id).await.map(|_| ())
    }

    async fn unlink(&self, company_id: CompanyId, user_id: UserId) -> Result<(), PeerError> {
        self.remove_membership(company_id, user_id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStep {
    Linked { company_id: CompanyId, user_id: UserId },
    Unlinked { company_id: CompanyId, user_id: UserId },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompensationSummary {
    pub attempted: usize,
    pub failed: usize,
}

impl CompensationSummary {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Remote steps performed so far by one request
#[derive(Debug, Default)]
pub struct CompensationLog {
    steps: Vec<RemoteStep>,
}

impl CompensationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn linked(&mut self, company_id: CompanyId, user_id: UserId) {
        self.steps.push(RemoteStep::Linked { company_id, user_id });
    }

    pub fn unlinked(&mut self, company_id: CompanyId, user_id: UserId) {
        self.steps.push(RemoteStep::Unlinked { company_id, user_id });
    }

    pub fn steps(&self) -> &[RemoteStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Undo every recorded step, newest first. Best effort: a failed undo is
    /// logged and counted, and unwinding continues with the next step.
    pub async fn unwind<L>(self, link: &L) -> CompensationSummary
    where
        L: MembershipLink + ?Sized,
    {
        let mut summary = CompensationSummary::default();
        for step in self.steps.into_iter().rev() {
            summary.attempted += 1;
            let result = match step {
                RemoteStep::Linked { company_id, user_id } => link.unlink(company_id, user_id).await,
                RemoteStep::Unlinked { company_id, user_id } => link.link(company_id, user_id).await,
            };
            match result {
                Ok(()) => {
                    debug!(?step, "Compensated remote membership step");
                    metrics::counter!("membership_compensation_total", "outcome" => "compensated")
                        .increment(1);
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(?step, error = %e, "Compensation failed; memberships may have drifted");
                    metrics::counter!("membership_compensation_total", "outcome" => "failed")
                        .increment(1);
                }
            }
        }
        summary
    }
}
