// ===============================
// src/gateway.rs (brokerage boundary + mock broker)
// ===============================
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio::time::{sleep, Duration};

use crate::domain::{Client, OrderTask};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Business rejection from the broker (margin, RMS, bad symbol, ...)
    #[error("rejected: {0}")]
    Rejected(String),
    /// Could not get an answer from the broker at all
    #[error("transport: {0}")]
    Transport(String),
}

/// One call per client order. Implementations must be safe to call
/// concurrently for distinct clients.
#[async_trait]
pub trait Brokerage: Send + Sync {
    /// Returns the broker-side order id on acceptance.
    async fn place_order(&self, client: &Client, task: &OrderTask) -> Result<String, BrokerError>;
}

/// Paper broker: accepts after a fixed delay, rejects anything above `max_qty`.
pub struct MockBroker {
    fill_ms: u64,
    max_qty: u32,
}

impl MockBroker {
    pub fn new(fill_ms: u64, max_qty: u32) -> Self { Self { fill_ms, max_qty } }
}

#[async_trait]
impl Brokerage for MockBroker {
    async fn place_order(&self, client: &Client, task: &OrderTask) -> Result<String, BrokerError> {
        sleep(Duration::from_millis(self.fill_ms)).await;
        if task.quantity > self.max_qty {
            return Err(BrokerError::Rejected("insufficient margin".into()));
        }
        let ts = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let oid = format!("MOCK-{}-{}-{}", client.broker_client_id, ts, rand::thread_rng().gen::<u32>());
        tracing::debug!(client = %client.id, symbol = %task.token_symbol, qty = task.quantity, %oid, "mock order accepted");
        Ok(oid)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderType, Side, TradeType};
    use crate::registry::test_clients;

    fn task(qty: u32) -> OrderTask {
        OrderTask {
            client_id: "c1".into(),
            token_symbol: "RELIANCE".into(),
            token_exchange: "NSE".into(),
            trade_type: TradeType::Intraday,
            order_type: OrderType::Market,
            side: Side::Buy,
            quantity: qty,
        }
    }

    #[tokio::test]
    async fn mock_accepts_within_margin() {
        let b = MockBroker::new(0, 100);
        let client = &test_clients(&["c1"])[0];
        let oid = b.place_order(client, &task(100)).await.unwrap();
        assert!(oid.starts_with("MOCK-BRK-c1-"));
        assert_eq!(
            b.place_order(client, &task(101)).await,
            Err(BrokerError::Rejected("insufficient margin".into()))
        );
    }
}
