// ===============================
// src/posttrade.rs
// ===============================
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::domain::{Event, OrderOutcome};

pub async fn run(mut rx: broadcast::Receiver<Event>) {
    loop {
        let ev = match rx.recv().await {
            Ok(ev) => ev,
            Err(RecvError::Lagged(n)) => {
                warn!(skipped = n, "posttrade lagging");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match ev {
            Event::Order { round, result } => match &result.outcome {
                OrderOutcome::Accepted { broker_order_id } => {
                    info!(round, client_id = %result.client_id, %broker_order_id, "ACCEPTED")
                }
                OrderOutcome::Rejected { reason } => warn!(round, client_id = %result.client_id, %reason, "REJECTED"),
                OrderOutcome::TransportError { reason } => {
                    warn!(round, client_id = %result.client_id, %reason, "TRANSPORT_ERROR")
                }
            },
            Event::Round(s) => info!(
                round = s.round,
                kind = s.kind.as_str(),
                token = %s.token_symbol,
                exchange = %s.token_exchange,
                total = s.total,
                accepted = s.accepted,
                rejected = s.rejected,
                "ROUND"
            ),
            Event::Note(n) => info!(note = %n, "NOTE"),
        }
    }
}
