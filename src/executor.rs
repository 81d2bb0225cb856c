// ===============================
// src/executor.rs (bulk execution coordinator)
// ===============================
//
// One round = one frozen ExecutionRequest. Every OrderTask runs as its own
// spawned task behind a shared semaphore (worker-pool bound) and its own
// timeout, so a slow, failing or panicking client never holds up the others.
// The round's report is built only after every task has resolved.
//
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::{ClearPolicy, DispatchLimits};
use crate::domain::{
    ClientId, Event, ExecutionReport, ExecutionRequest, OrderOutcome, OrderResult, OrderTask,
    RoundSummary, TradeIntent,
};
use crate::gateway::{BrokerError, Brokerage};
use crate::metrics::{ORDERS_DISPATCHED, ORDERS_IN_FLIGHT, ORDER_RESULTS, ROUNDS, ROUNDS_EMPTY, ROUND_LATENCY};
use crate::registry::{self, ClientRegistry, RegistryError, RegistrySnapshot};
use crate::session::Session;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no orders selected: every client quantity is zero or absent")]
    NoOrdersSelected,
}

pub struct BulkExecutor {
    broker: Arc<dyn Brokerage>,
    registry: Arc<dyn ClientRegistry>,
    limits: DispatchLimits,
    events: broadcast::Sender<Event>,
    rounds: AtomicU64,
}

/// Keeps the in-flight gauge honest even if the broker call panics.
struct InFlight;
impl InFlight {
    fn enter() -> Self {
        ORDERS_IN_FLIGHT.inc();
        InFlight
    }
}
impl Drop for InFlight {
    fn drop(&mut self) { ORDERS_IN_FLIGHT.dec(); }
}

impl BulkExecutor {
    pub fn new(
        broker: Arc<dyn Brokerage>,
        registry: Arc<dyn ClientRegistry>,
        limits: DispatchLimits,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self { broker, registry, limits, events, rounds: AtomicU64::new(0) }
    }

    pub fn limits(&self) -> &DispatchLimits { &self.limits }

    pub fn registry(&self) -> &Arc<dyn ClientRegistry> { &self.registry }

    /// Stateless form: one intent over a caller-owned quantity map.
    pub async fn execute_all(
        &self,
        intent: &TradeIntent,
        quantities: &BTreeMap<ClientId, u32>,
    ) -> Result<ExecutionReport, DispatchError> {
        match ExecutionRequest::from_intent(intent, quantities) {
            Some(req) => self.dispatch(req).await,
            None => {
                ROUNDS_EMPTY.inc();
                Err(DispatchError::NoOrdersSelected)
            }
        }
    }

    /// Session form: freezes the session, dispatches, then clears the
    /// round's own quantity entries according to the clearing policy.
    pub async fn execute_session(&self, session: &Session) -> Result<ExecutionReport, DispatchError> {
        let Some(frozen) = session.freeze().await else {
            ROUNDS_EMPTY.inc();
            return Err(DispatchError::NoOrdersSelected);
        };
        let report = self.dispatch(frozen.request.clone()).await?;
        let clear = match self.limits.clear_policy {
            ClearPolicy::Always => true,
            ClearPolicy::AnyAccepted => report.any_accepted(),
        };
        if clear {
            let n = session.clear_dispatched(&frozen).await;
            tracing::debug!(cleared = n, "dispatched quantities cleared");
        }
        Ok(report)
    }

    /// Runs one frozen request to completion.
    pub async fn dispatch(&self, request: ExecutionRequest) -> Result<ExecutionReport, DispatchError> {
        if request.tasks.is_empty() {
            ROUNDS_EMPTY.inc();
            return Err(DispatchError::NoOrdersSelected);
        }
        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let kind = request.kind;

        // frozen registry view for the whole round; per-client lookups if it is unavailable
        let clients: Option<Arc<RegistrySnapshot>> = match registry::snapshot(self.registry.as_ref()).await {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                warn!(round, error = %e, "registry snapshot failed, resolving clients one by one");
                None
            }
        };

        let pool = Arc::new(Semaphore::new(self.limits.max_in_flight.max(1)));
        let mut handles = Vec::with_capacity(request.tasks.len());
        for task in request.tasks.iter().cloned() {
            let client_id = task.client_id.clone();
            let pool = pool.clone();
            let broker = self.broker.clone();
            let registry = self.registry.clone();
            let clients = clients.clone();
            let per_task = self.limits.task_timeout;
            ORDERS_DISPATCHED.inc();
            let handle = tokio::spawn(async move {
                // deadline includes the wait for a pool slot
                let attempt = async {
                    // the pool is never closed; a failed acquire just runs unbounded
                    let _permit = pool.acquire_owned().await.ok();
                    let _in_flight = InFlight::enter();
                    place_one(broker.as_ref(), registry.as_ref(), clients.as_deref(), &task).await
                };
                match timeout(per_task, attempt).await {
                    Ok(outcome) => outcome,
                    Err(_) => OrderOutcome::TransportError { reason: "timeout".into() },
                }
            });
            handles.push((client_id, handle));
        }

        let results = join_all(handles.into_iter().map(|(client_id, h)| async move {
            let outcome = match h.await {
                Ok(o) => o,
                Err(e) if e.is_panic() => OrderOutcome::TransportError { reason: "broker call panicked".into() },
                Err(_) => OrderOutcome::TransportError { reason: "broker call cancelled".into() },
            };
            OrderResult { client_id, outcome }
        }))
        .await;

        for r in &results {
            ORDER_RESULTS.with_label_values(&[r.outcome.label(), kind.as_str()]).inc();
            if let Some(reason) = r.outcome.reason() {
                warn!(round, client_id = %r.client_id, outcome = r.outcome.label(), %reason, "order not accepted");
            }
            let _ = self.events.send(Event::Order { round, result: r.clone() });
        }

        let mut report = ExecutionReport::fold(results);
        report.skipped = request.skipped;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        ROUNDS.with_label_values(&[kind.as_str()]).inc();
        ROUND_LATENCY.observe(elapsed_ms as f64);

        let summary = RoundSummary {
            round,
            kind,
            token_symbol: request.token_symbol.clone(),
            token_exchange: request.token_exchange.clone(),
            total: report.total,
            accepted: report.accepted,
            rejected: report.rejected.len(),
            elapsed_ms,
        };
        info!(
            round,
            kind = kind.as_str(),
            token = %summary.token_symbol,
            total = summary.total,
            accepted = summary.accepted,
            rejected = summary.rejected,
            skipped = report.skipped.len(),
            elapsed_ms,
            "round complete"
        );
        let _ = self.events.send(Event::Round(summary));
        Ok(report)
    }
}

async fn place_one(
    broker: &dyn Brokerage,
    registry: &dyn ClientRegistry,
    clients: Option<&RegistrySnapshot>,
    task: &OrderTask,
) -> OrderOutcome {
    let client = match clients {
        Some(snap) => snap.get(&task.client_id).cloned().ok_or(RegistryError::NotFound(task.client_id.clone())),
        None => registry.get_client(&task.client_id).await,
    };
    let client = match client {
        Ok(c) => c,
        Err(RegistryError::NotFound(_)) => return OrderOutcome::Rejected { reason: "client not found".into() },
        Err(e) => return OrderOutcome::TransportError { reason: e.to_string() },
    };
    match broker.place_order(&client, task).await {
        Ok(broker_order_id) => OrderOutcome::Accepted { broker_order_id },
        Err(BrokerError::Rejected(reason)) => OrderOutcome::Rejected { reason },
        Err(BrokerError::Transport(reason)) => OrderOutcome::TransportError { reason },
    }
}
