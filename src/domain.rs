// ===============================
// src/domain.rs
// ===============================
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Opaque client identifier (registry key, not the broker-side login id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);
impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}
impl From<&str> for ClientId { fn from(s: &str) -> Self { ClientId(s.to_string()) } }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    #[serde(alias = "name")]
    pub display_name: String,
    #[serde(alias = "client_id")]
    pub broker_client_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeType { Mtf, Intraday }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType { Market, Ltp }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }

impl TradeType {
    pub fn as_str(&self) -> &'static str { match self { TradeType::Mtf => "MTF", TradeType::Intraday => "INTRADAY" } }
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MTF" => Some(TradeType::Mtf),
            "INTRADAY" => Some(TradeType::Intraday),
            _ => None,
        }
    }
}
impl OrderType {
    pub fn as_str(&self) -> &'static str { match self { OrderType::Market => "MARKET", OrderType::Ltp => "LTP" } }
}
impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

/// The operator's current trade configuration. One value per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub token_symbol: String,
    pub token_exchange: String,
    pub trade_type: TradeType,
    pub order_type: OrderType,
    pub side: Side,
}

impl Default for TradeIntent {
    fn default() -> Self {
        Self {
            token_symbol: "RELIANCE".into(),
            token_exchange: "NSE".into(),
            trade_type: TradeType::Intraday,
            order_type: OrderType::Market,
            side: Side::Buy,
        }
    }
}

/// Partial update; `None` fields leave the current value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeIntentPatch {
    pub token_symbol: Option<String>,
    pub token_exchange: Option<String>,
    pub trade_type: Option<TradeType>,
    pub order_type: Option<OrderType>,
    pub side: Option<Side>,
}

impl TradeIntent {
    pub fn apply(&mut self, patch: TradeIntentPatch) {
        if let Some(v) = patch.token_symbol { self.token_symbol = v; }
        if let Some(v) = patch.token_exchange { self.token_exchange = v; }
        if let Some(v) = patch.trade_type { self.trade_type = v; }
        if let Some(v) = patch.order_type { self.order_type = v; }
        if let Some(v) = patch.side { self.side = v; }
    }
}

/// One client's share of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTask {
    pub client_id: ClientId,
    pub token_symbol: String,
    pub token_exchange: String,
    pub trade_type: TradeType,
    pub order_type: OrderType,
    pub side: Side,
    pub quantity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundKind { Execute, Exit }

impl RoundKind {
    pub fn as_str(&self) -> &'static str { match self { RoundKind::Execute => "execute", RoundKind::Exit => "exit" } }
}

/// Frozen task set of one round. Built once, never mutated after dispatch starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub kind: RoundKind,
    pub token_symbol: String,
    pub token_exchange: String,
    pub tasks: Vec<OrderTask>,
    /// Selected clients that get no order, with the reason. Not dispatched.
    #[serde(default)]
    pub skipped: Vec<RejectedOrder>,
}

impl ExecutionRequest {
    /// Expands one intent over a quantity snapshot. Zero quantities are skipped;
    /// `None` when nothing remains to dispatch.
    pub fn from_intent(intent: &TradeIntent, quantities: &BTreeMap<ClientId, u32>) -> Option<Self> {
        let tasks: Vec<OrderTask> = quantities
            .iter()
            .filter(|(_, q)| **q > 0)
            .map(|(id, q)| OrderTask {
                client_id: id.clone(),
                token_symbol: intent.token_symbol.clone(),
                token_exchange: intent.token_exchange.clone(),
                trade_type: intent.trade_type,
                order_type: intent.order_type,
                side: intent.side,
                quantity: *q,
            })
            .collect();
        if tasks.is_empty() {
            return None;
        }
        Some(Self {
            kind: RoundKind::Execute,
            token_symbol: intent.token_symbol.clone(),
            token_exchange: intent.token_exchange.clone(),
            tasks,
            skipped: Vec::new(),
        })
    }

    pub fn client_ids(&self) -> impl Iterator<Item = &ClientId> { self.tasks.iter().map(|t| &t.client_id) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OrderOutcome {
    Accepted { broker_order_id: String },
    Rejected { reason: String },
    TransportError { reason: String },
}

impl OrderOutcome {
    pub fn is_accepted(&self) -> bool { matches!(self, OrderOutcome::Accepted { .. }) }
    pub fn label(&self) -> &'static str {
        match self {
            OrderOutcome::Accepted { .. } => "accepted",
            OrderOutcome::Rejected { .. } => "rejected",
            OrderOutcome::TransportError { .. } => "transport_error",
        }
    }
    pub fn reason(&self) -> Option<&str> {
        match self {
            OrderOutcome::Accepted { .. } => None,
            OrderOutcome::Rejected { reason } | OrderOutcome::TransportError { reason } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderResult { pub client_id: ClientId, pub outcome: OrderOutcome }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedOrder { pub client_id: ClientId, pub reason: String }

/// Aggregate of one round. `outcomes` keeps every attempted client's result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub total: usize,
    pub accepted: usize,
    pub rejected: Vec<RejectedOrder>,
    pub outcomes: BTreeMap<ClientId, OrderOutcome>,
    /// Clients left out before dispatch; not part of `total`.
    #[serde(default)]
    pub skipped: Vec<RejectedOrder>,
}

impl ExecutionReport {
    /// Order-independent fold: results are keyed by client id, and the derived
    /// counts and rejection list are read back in key order.
    pub fn fold<I: IntoIterator<Item = OrderResult>>(results: I) -> Self {
        let outcomes: BTreeMap<ClientId, OrderOutcome> =
            results.into_iter().map(|r| (r.client_id, r.outcome)).collect();
        let accepted = outcomes.values().filter(|o| o.is_accepted()).count();
        let rejected = outcomes
            .iter()
            .filter_map(|(id, o)| o.reason().map(|r| RejectedOrder { client_id: id.clone(), reason: r.to_string() }))
            .collect();
        Self { total: outcomes.len(), accepted, rejected, outcomes, skipped: Vec::new() }
    }

    pub fn any_accepted(&self) -> bool { self.accepted > 0 }
}

/// One aggregate notification per completed round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: u64,
    pub kind: RoundKind,
    pub token_symbol: String,
    pub token_exchange: String,
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub elapsed_ms: u64,
}

/// Incoming P/L frame. Accepts both `clientId` and `client_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlTick {
    #[serde(rename = "clientId", alias = "client_id")]
    pub client_id: ClientId,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlEntry { pub pnl: Decimal, pub updated_at: DateTime<Utc> }

pub type PlSnapshot = BTreeMap<ClientId, Decimal>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHolder {
    pub client_id: ClientId,
    pub client_name: String,
    /// Net position; negative means short.
    pub quantity_held: i64,
    pub avg_price: Decimal,
}

/// Desk-level events for the journal and post-trade log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event { Round(RoundSummary), Order { round: u64, result: OrderResult }, Note(String) }

#[cfg(test)]
mod tests {
    use super::*;

    fn res(id: &str, outcome: OrderOutcome) -> OrderResult { OrderResult { client_id: id.into(), outcome } }

    fn sample() -> Vec<OrderResult> {
        vec![
            res("c1", OrderOutcome::Accepted { broker_order_id: "B1".into() }),
            res("c2", OrderOutcome::Rejected { reason: "insufficient margin".into() }),
            res("c3", OrderOutcome::TransportError { reason: "timeout".into() }),
            res("c4", OrderOutcome::Accepted { broker_order_id: "B4".into() }),
        ]
    }

    #[test]
    fn fold_counts_every_outcome() {
        let report = ExecutionReport::fold(sample());
        assert_eq!(report.total, 4);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.accepted + report.rejected.len(), report.total);
        assert_eq!(report.rejected[0], RejectedOrder { client_id: "c2".into(), reason: "insufficient margin".into() });
        assert_eq!(report.rejected[1].reason, "timeout");
    }

    #[test]
    fn fold_ignores_arrival_order() {
        let base = ExecutionReport::fold(sample());
        let mut rev = sample();
        rev.reverse();
        assert_eq!(ExecutionReport::fold(rev), base);
        let mut rotated = sample();
        rotated.rotate_left(2);
        assert_eq!(ExecutionReport::fold(rotated), base);
    }

    #[test]
    fn request_skips_zero_quantities() {
        let mut q = BTreeMap::new();
        q.insert(ClientId::from("c1"), 10);
        q.insert(ClientId::from("c2"), 0);
        q.insert(ClientId::from("c3"), 5);
        let req = ExecutionRequest::from_intent(&TradeIntent::default(), &q).unwrap();
        let ids: Vec<_> = req.client_ids().map(|c| c.0.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c3"]);
        assert!(req.tasks.iter().all(|t| t.token_symbol == "RELIANCE" && t.side == Side::Buy));

        q.clear();
        q.insert(ClientId::from("c2"), 0);
        assert!(ExecutionRequest::from_intent(&TradeIntent::default(), &q).is_none());
    }

    #[test]
    fn patch_touches_only_given_fields() {
        let mut intent = TradeIntent::default();
        intent.apply(TradeIntentPatch { side: Some(Side::Sell), ..Default::default() });
        assert_eq!(intent.side, Side::Sell);
        assert_eq!(intent.token_symbol, "RELIANCE");
        assert_eq!(intent.trade_type, TradeType::Intraday);
    }

    #[test]
    fn tick_accepts_both_key_styles() {
        let a: PlTick = serde_json::from_str(r#"{"clientId":"A","pnl":10.5}"#).unwrap();
        let b: PlTick = serde_json::from_str(r#"{"client_id":"A","pnl":"10.5"}"#).unwrap();
        assert_eq!(a, b);
    }
}
