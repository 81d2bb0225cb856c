// ===============================
// src/exit.rs (token exit coordinator)
// ===============================
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{
    ClientId, ExecutionReport, ExecutionRequest, OrderTask, OrderType, RejectedOrder, RoundKind, Side, TokenHolder,
    TradeType,
};
use crate::executor::{BulkExecutor, DispatchError};
use crate::holdings::{HoldingsError, HoldingsResolver};

#[derive(Debug, Error)]
pub enum ExitError {
    #[error(transparent)]
    Holdings(#[from] HoldingsError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("holders for {0} on {1} not loaded")]
    NotLoaded(String, String),
    #[error("{0} does not hold this token")]
    UnknownHolder(ClientId),
}

/// Holder set of one token plus the operator's opt-out selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitSelection {
    pub token_symbol: String,
    pub token_exchange: String,
    pub holders: Vec<TokenHolder>,
    pub selected: BTreeSet<ClientId>,
}

impl ExitSelection {
    /// Fresh load: everybody selected.
    pub fn new(token_symbol: &str, token_exchange: &str, holders: Vec<TokenHolder>) -> Self {
        let selected = holders.iter().map(|h| h.client_id.clone()).collect();
        Self { token_symbol: token_symbol.into(), token_exchange: token_exchange.into(), holders, selected }
    }

    pub fn set_selected(&mut self, client_id: &ClientId, selected: bool) -> Result<(), ExitError> {
        if !self.holders.iter().any(|h| &h.client_id == client_id) {
            return Err(ExitError::UnknownHolder(client_id.clone()));
        }
        if selected {
            self.selected.insert(client_id.clone());
        } else {
            self.selected.remove(client_id);
        }
        Ok(())
    }

    pub fn selected_ids(&self) -> Vec<ClientId> { self.selected.iter().cloned().collect() }
}

/// One row per client. Backends that report one row per open trade get their
/// rows summed; `avg_price` becomes the quantity-weighted average.
pub fn net_positions(holders: Vec<TokenHolder>) -> Vec<TokenHolder> {
    let mut net: BTreeMap<ClientId, TokenHolder> = BTreeMap::new();
    for h in holders {
        match net.get_mut(&h.client_id) {
            None => {
                net.insert(h.client_id.clone(), h);
            }
            Some(n) => {
                let qty = n.quantity_held.saturating_add(h.quantity_held);
                if qty != 0 {
                    let cost = n.avg_price * Decimal::from(n.quantity_held) + h.avg_price * Decimal::from(h.quantity_held);
                    n.avg_price = cost / Decimal::from(qty);
                }
                n.quantity_held = qty;
            }
        }
    }
    net.into_values().collect()
}

/// Closing order for one net holding: long -> SELL, short -> BUY.
/// Err carries the reason no order is placed.
pub fn closing_task(
    holder: &TokenHolder,
    token_symbol: &str,
    token_exchange: &str,
    trade_type: TradeType,
) -> Result<OrderTask, String> {
    let side = match holder.quantity_held {
        q if q > 0 => Side::Sell,
        q if q < 0 => Side::Buy,
        _ => return Err("no open position".into()),
    };
    let quantity = u32::try_from(holder.quantity_held.unsigned_abs())
        .map_err(|_| format!("holding of {} too large for one order", holder.quantity_held))?;
    Ok(OrderTask {
        client_id: holder.client_id.clone(),
        token_symbol: token_symbol.into(),
        token_exchange: token_exchange.into(),
        trade_type,
        order_type: OrderType::Market,
        side,
        quantity,
    })
}

/// Builds the exit round for the selected subset of `holders`. Every selected
/// client ends up either as a task or in `skipped`.
pub fn exit_request(
    token_symbol: &str,
    token_exchange: &str,
    holders: Vec<TokenHolder>,
    selected: &[ClientId],
    trade_type: TradeType,
) -> ExecutionRequest {
    let net = net_positions(holders);
    let wanted: BTreeSet<&ClientId> = selected.iter().collect();
    let mut tasks = Vec::new();
    let mut skipped = Vec::new();
    for id in wanted {
        let built = match net.iter().find(|h| &h.client_id == id) {
            Some(h) => closing_task(h, token_symbol, token_exchange, trade_type),
            None => Err(format!("no position in {token_symbol}")),
        };
        match built {
            Ok(task) => tasks.push(task),
            Err(reason) => {
                warn!(client_id = %id, token = token_symbol, %reason, "selected client skipped");
                skipped.push(RejectedOrder { client_id: id.clone(), reason });
            }
        }
    }
    ExecutionRequest {
        kind: RoundKind::Exit,
        token_symbol: token_symbol.into(),
        token_exchange: token_exchange.into(),
        tasks,
        skipped,
    }
}

pub struct TokenExitCoordinator {
    resolver: Arc<dyn HoldingsResolver>,
    executor: Arc<BulkExecutor>,
    selections: Mutex<HashMap<(String, String), ExitSelection>>,
}

fn sel_key(symbol: &str, exchange: &str) -> (String, String) {
    (symbol.to_ascii_uppercase(), exchange.to_ascii_uppercase())
}

impl TokenExitCoordinator {
    pub fn new(resolver: Arc<dyn HoldingsResolver>, executor: Arc<BulkExecutor>) -> Self {
        Self { resolver, executor, selections: Mutex::new(HashMap::new()) }
    }

    /// Fetches holders and resets the selection to all of them.
    pub async fn holders(&self, token_symbol: &str, token_exchange: &str) -> Result<ExitSelection, ExitError> {
        let holders = self.resolver.holders_of(token_symbol, token_exchange).await?;
        let sel = ExitSelection::new(token_symbol, token_exchange, net_positions(holders));
        self.selections.lock().await.insert(sel_key(token_symbol, token_exchange), sel.clone());
        Ok(sel)
    }

    pub async fn selection(&self, token_symbol: &str, token_exchange: &str) -> Option<ExitSelection> {
        self.selections.lock().await.get(&sel_key(token_symbol, token_exchange)).cloned()
    }

    pub async fn set_selected(
        &self,
        token_symbol: &str,
        token_exchange: &str,
        client_id: &ClientId,
        selected: bool,
    ) -> Result<ExitSelection, ExitError> {
        let mut all = self.selections.lock().await;
        let sel = all
            .get_mut(&sel_key(token_symbol, token_exchange))
            .ok_or_else(|| ExitError::NotLoaded(token_symbol.into(), token_exchange.into()))?;
        sel.set_selected(client_id, selected)?;
        Ok(sel.clone())
    }

    /// Liquidates the given clients' holdings. Quantities come from a fresh
    /// holder fetch so the orders match what is actually held right now.
    pub async fn exit_selected(
        &self,
        token_symbol: &str,
        token_exchange: &str,
        selected: &[ClientId],
    ) -> Result<ExecutionReport, ExitError> {
        let holders = self.resolver.holders_of(token_symbol, token_exchange).await?;
        let trade_type = self.executor.limits().exit_trade_type;
        let request = exit_request(token_symbol, token_exchange, holders, selected, trade_type);
        info!(token = token_symbol, exchange = token_exchange, orders = request.tasks.len(), "exit round");
        Ok(self.executor.dispatch(request).await?)
    }

    /// Exits whatever the stored selection currently holds.
    pub async fn exit_current_selection(&self, token_symbol: &str, token_exchange: &str) -> Result<ExecutionReport, ExitError> {
        let ids = self
            .selection(token_symbol, token_exchange)
            .await
            .ok_or_else(|| ExitError::NotLoaded(token_symbol.into(), token_exchange.into()))?
            .selected_ids();
        self.exit_selected(token_symbol, token_exchange, &ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchLimits;
    use crate::gateway::testkit::{Script, ScriptedBroker};
    use crate::holdings::InMemoryHoldings;
    use crate::registry::{test_clients, InMemoryRegistry};
    use rust_decimal_macros::dec;
    use tokio::sync::broadcast;

    fn holder(id: &str, qty: i64) -> TokenHolder {
        TokenHolder { client_id: id.into(), client_name: format!("Client {id}"), quantity_held: qty, avg_price: dec!(100.5) }
    }

    fn coordinator(broker: Arc<ScriptedBroker>) -> TokenExitCoordinator {
        let holders = vec![holder("h1", 40), holder("h2", 15), holder("h3", -5), holder("h4", 0)];
        let resolver = Arc::new(InMemoryHoldings::new().with("INFY", "NSE", holders));
        let registry = Arc::new(InMemoryRegistry::new(test_clients(&["h1", "h2", "h3", "h4"])));
        let (tx, _) = broadcast::channel(64);
        let exec = Arc::new(BulkExecutor::new(broker, registry, DispatchLimits::default(), tx));
        TokenExitCoordinator::new(resolver, exec)
    }

    #[tokio::test]
    async fn load_selects_every_holder() {
        let c = coordinator(Arc::new(ScriptedBroker::new(&[])));
        let sel = c.holders("INFY", "NSE").await.unwrap();
        assert_eq!(sel.selected.len(), sel.holders.len());
    }

    #[tokio::test]
    async fn deselected_holder_is_left_out() {
        let broker = Arc::new(ScriptedBroker::new(&[]));
        let c = coordinator(broker.clone());
        c.holders("INFY", "NSE").await.unwrap();
        c.set_selected("INFY", "NSE", &"h2".into(), false).await.unwrap();
        let report = c.exit_current_selection("INFY", "NSE").await.unwrap();

        // h4 is flat, h2 opted out
        assert_eq!(broker.called(), vec![("h1".into(), 40), ("h3".into(), 5)]);
        assert_eq!(report.total, 2);
        let calls = broker.calls.lock().unwrap();
        let side_of = |id: &str| calls.iter().find(|t| t.client_id.0 == id).map(|t| t.side);
        assert_eq!(side_of("h1"), Some(Side::Sell));
        assert_eq!(side_of("h3"), Some(Side::Buy));
        assert!(calls.iter().all(|t| t.order_type == OrderType::Market));
    }

    #[tokio::test]
    async fn reload_resets_selection() {
        let c = coordinator(Arc::new(ScriptedBroker::new(&[])));
        c.holders("INFY", "NSE").await.unwrap();
        c.set_selected("INFY", "NSE", &"h1".into(), false).await.unwrap();
        assert!(!c.selection("INFY", "NSE").await.unwrap().selected.contains(&ClientId::from("h1")));
        let again = c.holders("INFY", "NSE").await.unwrap();
        assert!(again.selected.contains(&ClientId::from("h1")));
    }

    #[tokio::test]
    async fn partial_failure_is_a_normal_report() {
        let broker = Arc::new(ScriptedBroker::new(&[("h1", Script::Reject("market closed"))]));
        let c = coordinator(broker);
        let report = c.exit_selected("INFY", "NSE", &["h1".into(), "h2".into()]).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected[0].client_id, ClientId::from("h1"));
    }

    #[tokio::test]
    async fn empty_selection_and_unknown_holder() {
        let c = coordinator(Arc::new(ScriptedBroker::new(&[])));
        assert!(matches!(
            c.exit_selected("INFY", "NSE", &["h4".into()]).await,
            Err(ExitError::Dispatch(DispatchError::NoOrdersSelected))
        ));
        assert!(matches!(c.exit_selected("TCS", "NSE", &[]).await, Err(ExitError::Holdings(_))));
        c.holders("INFY", "NSE").await.unwrap();
        assert!(matches!(
            c.set_selected("INFY", "NSE", &"nobody".into(), false).await,
            Err(ExitError::UnknownHolder(_))
        ));
        assert!(matches!(c.set_selected("TCS", "BSE", &"h1".into(), true).await, Err(ExitError::NotLoaded(..))));
    }

    #[tokio::test]
    async fn split_rows_for_one_client_become_one_order() {
        let broker = Arc::new(ScriptedBroker::new(&[]));
        let rows = vec![holder("h1", 10), holder("h1", 5), holder("h2", -4), holder("h2", 4)];
        let resolver = Arc::new(InMemoryHoldings::new().with("SBIN", "NSE", rows));
        let registry = Arc::new(InMemoryRegistry::new(test_clients(&["h1", "h2"])));
        let (tx, _) = broadcast::channel(64);
        let exec = Arc::new(BulkExecutor::new(broker.clone(), registry, DispatchLimits::default(), tx));
        let c = TokenExitCoordinator::new(resolver, exec);

        let sel = c.holders("SBIN", "NSE").await.unwrap();
        assert_eq!(sel.holders.len(), 2);
        assert_eq!(sel.holders[0].quantity_held, 15);

        let report = c.exit_selected("SBIN", "NSE", &["h1".into(), "h2".into()]).await.unwrap();
        assert_eq!(broker.called(), vec![("h1".into(), 15)]);
        assert_eq!(report.total, broker.called().len());
        assert_eq!(report.skipped, vec![RejectedOrder { client_id: "h2".into(), reason: "no open position".into() }]);
    }

    #[tokio::test]
    async fn every_selected_client_is_accounted_for() {
        let broker = Arc::new(ScriptedBroker::new(&[]));
        let c = coordinator(broker.clone());
        let report = c.exit_selected("INFY", "NSE", &["h1".into(), "h4".into(), "gone".into()]).await.unwrap();
        assert_eq!(report.total, 1);
        assert!(report.outcomes[&ClientId::from("h1")].is_accepted());
        let skipped: Vec<&str> = report.skipped.iter().map(|s| s.client_id.0.as_str()).collect();
        assert_eq!(skipped, vec!["gone", "h4"]);
        assert_eq!(report.skipped[0].reason, "no position in INFY");
    }

    #[test]
    fn netting_weights_the_average_price() {
        let mut a = holder("h1", 10);
        a.avg_price = dec!(100);
        let mut b = holder("h1", 30);
        b.avg_price = dec!(200);
        let net = net_positions(vec![a, b]);
        assert_eq!(net.len(), 1);
        assert_eq!(net[0].quantity_held, 40);
        assert_eq!(net[0].avg_price, dec!(175));
    }
}
