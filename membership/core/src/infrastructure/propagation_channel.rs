// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Deferred Propagation Channel
//
// Carries membership events from a committed local transaction to the peer
// service. Transactions collect events in `PostCommitHooks`; only a durable
// commit releases them onto an unbounded queue drained by a single worker
// task. A rolled-back or dropped transaction discards its hooks.
//
// Delivery is at-most-once: a failed handler run is logged, counted in
// `membership_propagation_total{outcome="failed"}` and broadcast as a
// `PropagationReport`, but never retried. A handler may also report an
// event as superseded when local state moved on after the commit; that is
// counted as `outcome="superseded"`.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::membership::{CompanyMembershipEvent, UserMembershipEvent};

/// Events that can travel through the channel
pub trait PropagationEvent: Clone + Debug + Send + Sync + 'static {
    fn event_id(&self) -> Uuid;
    fn kind(&self) -> &'static str;
}

impl PropagationEvent for UserMembershipEvent {
    fn event_id(&self) -> Uuid {
        self.meta().event_id
    }

    fn kind(&self) -> &'static str {
        UserMembershipEvent::kind(self)
    }
}

impl PropagationEvent for CompanyMembershipEvent {
    fn event_id(&self) -> Uuid {
        self.meta().event_id
    }

    fn kind(&self) -> &'static str {
        CompanyMembershipEvent::kind(self)
    }
}

/// What a handler did with an event it did not fail on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The remote side effect was performed
    Applied,
    /// A later local mutation made the event stale; nothing was sent
    Superseded(String),
}

/// Performs the remote side effect for one committed event
#[async_trait]
pub trait PropagationHandler<E: PropagationEvent>: Send + Sync {
    async fn handle(&self, event: E) -> anyhow::Result<Delivery>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PropagationOutcome {
    Delivered,
    Superseded { reason: String },
    Failed { reason: String },
}

/// Published after every handler run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropagationReport {
    pub service: &'static str,
    pub event_id: Uuid,
    pub event_kind: &'static str,
    #[serde(flatten)]
    pub outcome: PropagationOutcome,
}

impl PropagationReport {
    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, PropagationOutcome::Delivered)
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self.outcome, PropagationOutcome::Superseded { .. })
    }
}

// ============================================================================
// Sender side
// ============================================================================

/// Cloneable handle used by repositories to enqueue committed events
pub struct PropagationSender<E> {
    service: &'static str,
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for PropagationSender<E> {
    fn clone(&self) -> Self {
        Self {
            service: self.service,
            tx: self.tx.clone(),
        }
    }
}

impl<E: PropagationEvent> PropagationSender<E> {
    /// Enqueue events that belong to an already committed transaction
    pub fn dispatch(&self, events: Vec<E>) {
        for event in events {
            debug!(
                service = self.service,
                event_id = %event.event_id(),
                kind = event.kind(),
                "Enqueueing committed membership event"
            );
            if let Err(mpsc::error::SendError(event)) = self.tx.send(event) {
                error!(
                    service = self.service,
                    event_id = %event.event_id(),
                    kind = event.kind(),
                    "Propagation worker stopped; committed event dropped"
                );
                metrics::counter!(
                    "membership_propagation_total",
                    "service" => self.service,
                    "outcome" => "dropped"
                )
                .increment(1);
            }
        }
    }

    /// Start an empty hook list bound to this channel
    pub fn hooks(&self) -> PostCommitHooks<E> {
        PostCommitHooks {
            sender: self.clone(),
            pending: Vec::new(),
        }
    }
}

/// Events recorded inside one transaction, released only after its commit
pub struct PostCommitHooks<E: PropagationEvent> {
    sender: PropagationSender<E>,
    pending: Vec<E>,
}

impl<E: PropagationEvent> PostCommitHooks<E> {
    pub fn record(&mut self, event: E) {
        self.pending.push(event);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Hand the recorded events to the worker. Call only after a durable commit.
    pub fn release(self) {
        if !self.pending.is_empty() {
            self.sender.dispatch(self.pending);
        }
    }

    /// Drop the recorded events (rollback path)
    pub fn discard(self) {
        if !self.pending.is_empty() {
            debug!(
                count = self.pending.len(),
                "Discarding post-commit hooks of rolled back transaction"
            );
        }
    }
}

// ============================================================================
// Worker side
// ============================================================================

/// Unstarted channel; hand out senders, then `spawn` it with a handler
pub struct PropagationChannel<E: PropagationEvent> {
    service: &'static str,
    sender: PropagationSender<E>,
    receiver: mpsc::UnboundedReceiver<E>,
    reports: broadcast::Sender<PropagationReport>,
}

impl<E: PropagationEvent> PropagationChannel<E> {
    /// `report_capacity` bounds how many reports a slow subscriber may lag behind
    pub fn new(service: &'static str, report_capacity: usize) -> Self {
        let (tx, receiver) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(report_capacity.max(1));
        Self {
            service,
            sender: PropagationSender { service, tx },
            receiver,
            reports,
        }
    }

    pub fn sender(&self) -> PropagationSender<E> {
        self.sender.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PropagationReport> {
        self.reports.subscribe()
    }

    /// Spawn the worker that feeds queued events to `handler`, one at a time
    pub fn spawn(self, handler: Arc<dyn PropagationHandler<E>>) -> PropagationWorker {
        let Self {
            service,
            sender,
            mut receiver,
            reports,
        } = self;
        // The worker must not keep its own queue open.
        drop(sender);

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let worker_reports = reports.clone();

        let handle = tokio::spawn(async move {
            info!(service, "Propagation worker started");
            loop {
                tokio::select! {
                    biased;
                    maybe_event = receiver.recv() => match maybe_event {
                        Some(event) => deliver(service, handler.as_ref(), &worker_reports, event).await,
                        None => break,
                    },
                    _ = &mut stop_rx => {
                        while let Ok(event) = receiver.try_recv() {
                            deliver(service, handler.as_ref(), &worker_reports, event).await;
                        }
                        break;
                    }
                }
            }
            info!(service, "Propagation worker stopped");
        });

        PropagationWorker {
            service,
            reports,
            stop: Some(stop_tx),
            handle,
        }
    }
}

async fn deliver<E: PropagationEvent>(
    service: &'static str,
    handler: &dyn PropagationHandler<E>,
    reports: &broadcast::Sender<PropagationReport>,
    event: E,
) {
    let event_id = event.event_id();
    let event_kind = event.kind();

    let outcome = match handler.handle(event).await {
        Ok(Delivery::Applied) => {
            debug!(service, %event_id, kind = event_kind, "Membership event propagated");
            PropagationOutcome::Delivered
        }
        Ok(Delivery::Superseded(reason)) => {
            warn!(
                service,
                %event_id,
                kind = event_kind,
                reason = %reason,
                "Membership event superseded by a later local change; not sent"
            );
            PropagationOutcome::Superseded { reason }
        }
        Err(e) => {
            error!(
                service,
                %event_id,
                kind = event_kind,
                error = %e,
                "Membership event propagation failed; association left unpropagated"
            );
            PropagationOutcome::Failed {
                reason: format!("{:#}", e),
            }
        }
    };

    let label = match outcome {
        PropagationOutcome::Delivered => "delivered",
        PropagationOutcome::Superseded { .. } => "superseded",
        PropagationOutcome::Failed { .. } => "failed",
    };
    metrics::counter!(
        "membership_propagation_total",
        "service" => service,
        "outcome" => label
    )
    .increment(1);

    // No subscriber is the normal case outside tests.
    let _ = reports.send(PropagationReport {
        service,
        event_id,
        event_kind,
        outcome,
    });
}

/// Running worker handle
pub struct PropagationWorker {
    service: &'static str,
    reports: broadcast::Sender<PropagationReport>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl PropagationWorker {
    pub fn subscribe(&self) -> broadcast::Receiver<PropagationReport> {
        self.reports.subscribe()
    }

    /// Deliver everything already queued, then stop the worker
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            warn!(service = self.service, "Propagation worker ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::membership::{CompanyId, UserId};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<UserMembershipEvent>>,
        fail: bool,
        stale: bool,
    }

    #[async_trait]
    impl PropagationHandler<UserMembershipEvent> for RecordingHandler {
        async fn handle(&self, event: UserMembershipEvent) -> anyhow::Result<Delivery> {
            self.seen.lock().push(event);
            if self.fail {
                anyhow::bail!("company-service is unavailable: connection refused");
            }
            if self.stale {
                return Ok(Delivery::Superseded("user 3 moved to company 10".to_string()));
            }
            Ok(Delivery::Applied)
        }
    }

    #[tokio::test]
    async fn test_released_hooks_reach_handler() {
        let channel = PropagationChannel::<UserMembershipEvent>::new("user-service", 16);
        let sender = channel.sender();
        let mut reports = channel.subscribe();
        let handler = Arc::new(RecordingHandler::default());
        let worker = channel.spawn(handler.clone());

        let mut hooks = sender.hooks();
        hooks.record(UserMembershipEvent::joined(UserId(1), CompanyId(7)));
        assert_eq!(hooks.len(), 1);
        hooks.release();

        let report = reports.recv().await.unwrap();
        assert!(report.is_delivered());
        assert_eq!(report.event_kind, "user_joined");
        assert_eq!(handler.seen.lock().len(), 1);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_discarded_hooks_never_reach_handler() {
        let channel = PropagationChannel::<UserMembershipEvent>::new("user-service", 16);
        let sender = channel.sender();
        let handler = Arc::new(RecordingHandler::default());
        let worker = channel.spawn(handler.clone());

        let mut hooks = sender.hooks();
        hooks.record(UserMembershipEvent::joined(UserId(1), CompanyId(7)));
        hooks.discard();

        let dropped = {
            let mut hooks = sender.hooks();
            hooks.record(UserMembershipEvent::left(UserId(2), CompanyId(7)));
            hooks
        };
        drop(dropped);

        worker.shutdown().await;
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delivery_is_reported_not_retried() {
        let channel = PropagationChannel::<UserMembershipEvent>::new("user-service", 16);
        let sender = channel.sender();
        let mut reports = channel.subscribe();
        let handler = Arc::new(RecordingHandler {
            fail: true,
            ..Default::default()
        });
        let worker = channel.spawn(handler.clone());

        sender.dispatch(vec![UserMembershipEvent::joined(UserId(3), CompanyId(9))]);

        let report = reports.recv().await.unwrap();
        match report.outcome {
            PropagationOutcome::Failed { reason } => assert!(reason.contains("unavailable")),
            other => panic!("unexpected outcome {:?}", other),
        }

        worker.shutdown().await;
        assert_eq!(handler.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_superseded_event_is_reported_separately() {
        let channel = PropagationChannel::<UserMembershipEvent>::new("user-service", 16);
        let sender = channel.sender();
        let mut reports = channel.subscribe();
        let handler = Arc::new(RecordingHandler {
            stale: true,
            ..Default::default()
        });
        let worker = channel.spawn(handler.clone());

        sender.dispatch(vec![UserMembershipEvent::joined(UserId(3), CompanyId(9))]);

        let report = reports.recv().await.unwrap();
        assert!(report.is_superseded());
        assert!(!report.is_delivered());
        match report.outcome {
            PropagationOutcome::Superseded { reason } => assert!(reason.contains("moved")),
            other => panic!("unexpected outcome {:?}", other),
        }

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue_in_order() {
        let channel = PropagationChannel::<UserMembershipEvent>::new("user-service", 16);
        let sender = channel.sender();
        let handler = Arc::new(RecordingHandler::default());
        let worker = channel.spawn(handler.clone());

        sender.dispatch(vec![
            UserMembershipEvent::joined(UserId(1), CompanyId(1)),
            UserMembershipEvent::joined(UserId(2), CompanyId(1)),
            UserMembershipEvent::left(UserId(1), CompanyId(1)),
        ]);
        worker.shutdown().await;

        let seen = handler.seen.lock();
        let kinds: Vec<_> = seen.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["user_joined", "user_joined", "user_left"]);
    }
}
