// ===============================
// src/desk.rs (operator-facing facade)
// ===============================
//
// Everything the HTTP surface can do goes through Desk: the session's intent
// and quantities, bulk execution, token exits and the P/L view.
//
use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

use crate::domain::{
    Client, ClientId, Event, ExecutionReport, PlEntry, PlSnapshot, PlTick, TradeIntent, TradeIntentPatch,
};
use crate::executor::{BulkExecutor, DispatchError};
use crate::exit::{ExitError, ExitSelection, TokenExitCoordinator};
use crate::pnl::PlAggregator;
use crate::registry::RegistryError;
use crate::session::{Session, SessionError};

#[derive(Debug, Error)]
pub enum DeskError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Exit(#[from] ExitError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("round task failed: {0}")]
    RoundAborted(String),
}

pub struct Desk {
    session: Arc<Session>,
    executor: Arc<BulkExecutor>,
    exits: Arc<TokenExitCoordinator>,
    pl: Arc<PlAggregator>,
    events: broadcast::Sender<Event>,
}

impl Desk {
    pub fn new(
        executor: Arc<BulkExecutor>,
        exits: TokenExitCoordinator,
        pl: Arc<PlAggregator>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self { session: Arc::new(Session::new()), executor, exits: Arc::new(exits), pl, events }
    }

    pub async fn trade_intent(&self) -> TradeIntent { self.session.intent().await }

    pub async fn set_trade_intent(&self, patch: TradeIntentPatch) -> TradeIntent {
        let intent = self.session.update_intent(patch).await;
        info!(
            token = %intent.token_symbol,
            exchange = %intent.token_exchange,
            trade_type = intent.trade_type.as_str(),
            order_type = intent.order_type.as_str(),
            side = intent.side.as_str(),
            "trade intent updated"
        );
        let _ = self.events.send(Event::Note(format!(
            "intent {} {} {} {} {}",
            intent.token_symbol,
            intent.token_exchange,
            intent.trade_type.as_str(),
            intent.order_type.as_str(),
            intent.side.as_str()
        )));
        intent
    }

    pub async fn set_quantity(&self, client_id: ClientId, quantity: i64) -> Result<(), DeskError> {
        Ok(self.session.set_quantity(client_id, quantity).await?)
    }

    pub async fn quantities(&self) -> BTreeMap<ClientId, u32> { self.session.quantities().await }

    /// One bulk round over the session's non-zero quantities. The round runs
    /// as its own task: a dropped caller does not stop clearing or the summary.
    pub async fn execute_all(&self) -> Result<ExecutionReport, DeskError> {
        let (executor, session) = (self.executor.clone(), self.session.clone());
        let round = tokio::spawn(async move { executor.execute_session(&session).await });
        let report = round.await.map_err(|e| DeskError::RoundAborted(e.to_string()))??;
        Ok(report)
    }

    pub async fn clients(&self) -> Result<Vec<Client>, DeskError> {
        Ok(self.executor.registry().list_clients().await?)
    }

    pub async fn holders(&self, token_symbol: &str, token_exchange: &str) -> Result<ExitSelection, DeskError> {
        Ok(self.exits.holders(token_symbol, token_exchange).await?)
    }

    pub async fn set_exit_selected(
        &self,
        token_symbol: &str,
        token_exchange: &str,
        client_id: &ClientId,
        selected: bool,
    ) -> Result<ExitSelection, DeskError> {
        Ok(self.exits.set_selected(token_symbol, token_exchange, client_id, selected).await?)
    }

    /// Explicit client list wins; otherwise the stored selection for the token.
    pub async fn exit_token(
        &self,
        token_symbol: &str,
        token_exchange: &str,
        clients_to_exit: Option<Vec<ClientId>>,
    ) -> Result<ExecutionReport, DeskError> {
        let exits = self.exits.clone();
        let (symbol, exchange) = (token_symbol.to_string(), token_exchange.to_string());
        // detached like execute_all
        let round = tokio::spawn(async move {
            match clients_to_exit {
                Some(ids) => exits.exit_selected(&symbol, &exchange, &ids).await,
                None => exits.exit_current_selection(&symbol, &exchange).await,
            }
        });
        let report = round.await.map_err(|e| DeskError::RoundAborted(e.to_string()))??;
        Ok(report)
    }

    pub fn pl_snapshot(&self) -> PlSnapshot { self.pl.snapshot() }

    pub fn pl_detailed(&self) -> BTreeMap<ClientId, PlEntry> { self.pl.snapshot_detailed() }

    pub fn pl_latest(&self, client_id: &ClientId) -> Option<rust_decimal::Decimal> { self.pl.latest(client_id) }

    pub fn subscribe_pl(&self) -> broadcast::Receiver<PlTick> { self.pl.subscribe() }
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::config::DispatchLimits;
    use crate::domain::TokenHolder;
    use crate::gateway::testkit::ScriptedBroker;
    use crate::holdings::InMemoryHoldings;
    use crate::registry::{test_clients, InMemoryRegistry};
    use rust_decimal_macros::dec;

    /// Desk over c1..c3 with a scripted broker; INFY/NSE held by c1 (long) and c2 (short).
    pub fn desk(broker: Arc<ScriptedBroker>) -> Desk {
        let (tx, _) = broadcast::channel(256);
        let registry = Arc::new(InMemoryRegistry::new(test_clients(&["c1", "c2", "c3"])));
        let exec = Arc::new(BulkExecutor::new(broker, registry, DispatchLimits::default(), tx.clone()));
        let holders = vec![
            TokenHolder { client_id: "c1".into(), client_name: "Client c1".into(), quantity_held: 25, avg_price: dec!(1510) },
            TokenHolder { client_id: "c2".into(), client_name: "Client c2".into(), quantity_held: -10, avg_price: dec!(1498.25) },
        ];
        let resolver = Arc::new(InMemoryHoldings::new().with("INFY", "NSE", holders));
        let exits = TokenExitCoordinator::new(resolver, exec.clone());
        Desk::new(exec, exits, Arc::new(PlAggregator::new(64)), tx)
    }

    pub fn merge_pl(d: &Desk, frame: &str) { d.pl.merge_frame(frame).unwrap(); }
}

#[cfg(test)]
mod tests {
    use super::testkit::desk;
    use super::*;
    use crate::domain::{RejectedOrder, Side};
    use crate::gateway::testkit::{Script, ScriptedBroker};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn worked_example_through_the_desk() {
        let broker = Arc::new(ScriptedBroker::new(&[("c3", Script::Reject("insufficient margin"))]));
        let d = desk(broker.clone());
        assert_eq!(d.trade_intent().await, TradeIntent::default());
        d.set_quantity("c1".into(), 10).await.unwrap();
        d.set_quantity("c2".into(), 0).await.unwrap();
        d.set_quantity("c3".into(), 5).await.unwrap();

        let report = d.execute_all().await.unwrap();
        assert_eq!((report.total, report.accepted), (2, 1));
        assert_eq!(report.rejected, vec![RejectedOrder { client_id: "c3".into(), reason: "insufficient margin".into() }]);
        assert!(d.quantities().await.is_empty());
    }

    #[tokio::test]
    async fn intent_patch_and_errors_surface() {
        let d = desk(Arc::new(ScriptedBroker::new(&[])));
        let patch = TradeIntentPatch { token_symbol: Some("TCS".into()), side: Some(Side::Sell), ..Default::default() };
        let intent = d.set_trade_intent(patch).await;
        assert_eq!((intent.token_symbol.as_str(), intent.side), ("TCS", Side::Sell));
        assert_eq!(intent.token_exchange, "NSE");

        assert!(matches!(d.set_quantity("c1".into(), -3).await, Err(DeskError::Session(_))));
        assert!(matches!(d.execute_all().await, Err(DeskError::Dispatch(DispatchError::NoOrdersSelected))));
        assert_eq!(d.clients().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn exit_uses_selection_or_explicit_list() {
        let broker = Arc::new(ScriptedBroker::new(&[]));
        let d = desk(broker.clone());
        d.holders("INFY", "NSE").await.unwrap();
        d.set_exit_selected("INFY", "NSE", &"c1".into(), false).await.unwrap();
        let report = d.exit_token("INFY", "NSE", None).await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(broker.called(), vec![("c2".into(), 10)]);

        let report = d.exit_token("INFY", "NSE", Some(vec!["c1".into()])).await.unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(broker.called(), vec![("c1".into(), 25), ("c2".into(), 10)]);
    }

    #[tokio::test]
    async fn pl_view_reads_the_aggregator() {
        let d = desk(Arc::new(ScriptedBroker::new(&[])));
        let mut rx = d.subscribe_pl();
        d.pl.merge(PlTick { client_id: "c1".into(), pnl: dec!(125.5) });
        assert_eq!(d.pl_latest(&"c1".into()), Some(dec!(125.5)));
        assert_eq!(d.pl_snapshot().len(), 1);
        assert_eq!(d.pl_detailed()[&ClientId::from("c1")].pnl, dec!(125.5));
        assert_eq!(rx.recv().await.unwrap().pnl, dec!(125.5));
    }

    #[tokio::test]
    async fn round_finishes_when_the_caller_goes_away() {
        let broker = Arc::new(ScriptedBroker::new(&[("c1", Script::Delay(150)), ("c3", Script::Delay(150))]));
        let d = Arc::new(desk(broker.clone()));
        let mut events = d.events.subscribe();
        d.set_quantity("c1".into(), 10).await.unwrap();
        d.set_quantity("c3".into(), 5).await.unwrap();

        let caller = {
            let d = d.clone();
            tokio::spawn(async move { d.execute_all().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        let summary = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if let Ok(Event::Round(s)) = events.recv().await {
                    return s;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!((summary.total, summary.accepted), (2, 2));
        for _ in 0..50 {
            if d.quantities().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(d.quantities().await.is_empty());
        assert_eq!(broker.called(), vec![("c1".into(), 10), ("c3".into(), 5)]);
    }
}
