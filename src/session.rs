// ===============================
// src/session.rs (trade intent + per-client quantities)
// ===============================
use std::collections::BTreeMap;

use ahash::AHashMap as HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain::{ClientId, ExecutionRequest, TradeIntent, TradeIntentPatch};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("quantity for {0} must not be negative (got {1})")]
    NegativeQuantity(ClientId, i64),
    #[error("quantity for {0} out of range (got {1})")]
    QuantityTooLarge(ClientId, i64),
}

#[derive(Debug, Clone, Copy)]
struct QtyEntry {
    qty: u32,
    // bumped on every edit; lets a finished round tell its own entries from later edits
    rev: u64,
}

#[derive(Debug, Default)]
struct SessionState {
    intent: TradeIntent,
    quantities: HashMap<ClientId, QtyEntry>,
    next_rev: u64,
}

/// A round's frozen request plus the quantity revisions it was built from.
#[derive(Debug, Clone)]
pub struct Frozen {
    pub request: ExecutionRequest,
    revs: Vec<(ClientId, u64)>,
}

/// One operator session. Every read/modify/write goes through the one lock.
#[derive(Debug, Default)]
pub struct Session {
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new() -> Self { Self::default() }

    pub async fn intent(&self) -> TradeIntent {
        self.state.lock().await.intent.clone()
    }

    pub async fn update_intent(&self, patch: TradeIntentPatch) -> TradeIntent {
        let mut st = self.state.lock().await;
        st.intent.apply(patch);
        st.intent.clone()
    }

    /// Zero removes the entry; negatives are refused.
    pub async fn set_quantity(&self, client_id: ClientId, quantity: i64) -> Result<(), SessionError> {
        if quantity < 0 {
            return Err(SessionError::NegativeQuantity(client_id, quantity));
        }
        let qty = u32::try_from(quantity).map_err(|_| SessionError::QuantityTooLarge(client_id.clone(), quantity))?;
        let mut st = self.state.lock().await;
        if qty == 0 {
            st.quantities.remove(&client_id);
            return Ok(());
        }
        st.next_rev += 1;
        let rev = st.next_rev;
        st.quantities.insert(client_id, QtyEntry { qty, rev });
        Ok(())
    }

    pub async fn quantities(&self) -> BTreeMap<ClientId, u32> {
        self.state.lock().await.quantities.iter().map(|(k, e)| (k.clone(), e.qty)).collect()
    }

    /// Copy-on-dispatch: snapshot intent and quantities together.
    pub async fn freeze(&self) -> Option<Frozen> {
        let st = self.state.lock().await;
        let quantities: BTreeMap<ClientId, u32> =
            st.quantities.iter().map(|(k, e)| (k.clone(), e.qty)).collect();
        let request = ExecutionRequest::from_intent(&st.intent, &quantities)?;
        let revs = request
            .client_ids()
            .filter_map(|id| st.quantities.get(id).map(|e| (id.clone(), e.rev)))
            .collect();
        Some(Frozen { request, revs })
    }

    /// Removes the round's own entries. Entries edited since the freeze keep
    /// their new value; clients outside the round are never touched.
    pub async fn clear_dispatched(&self, frozen: &Frozen) -> usize {
        let mut st = self.state.lock().await;
        let mut cleared = 0;
        for (id, rev) in &frozen.revs {
            if st.quantities.get(id).map(|e| e.rev) == Some(*rev) {
                st.quantities.remove(id);
                cleared += 1;
            }
        }
        cleared
    }
}
