// ===============================
// src/pnl.rs (latest-value P/L snapshot)
// ===============================
use std::collections::BTreeMap;
use std::sync::RwLock;

use ahash::AHashMap as HashMap;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::{ClientId, PlEntry, PlSnapshot, PlTick};
use crate::metrics::{PL_CLIENTS, PL_LAST_EVENT_TS, PL_MALFORMED, PL_TICKS};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no P/L payload")]
    Shape,
}

/// Accepts a bare `{"clientId","pnl"}` frame, a batch array of them, or the
/// broadcaster envelope `{"type": .., "data": <frame or batch>}`.
pub fn parse_frame(raw: &str) -> Result<Vec<PlTick>, FrameError> {
    let v: Value = serde_json::from_str(raw)?;
    let envelope = v.get("type").is_some() && v.get("data").is_some();
    let payload = if envelope { v["data"].clone() } else { v };
    let ticks: Vec<PlTick> = match payload {
        Value::Array(_) => serde_json::from_value(payload)?,
        Value::Object(_) => vec![serde_json::from_value(payload)?],
        _ => return Err(FrameError::Shape),
    };
    Ok(ticks)
}

/// Single writer per key (the stream merge step), many readers.
/// One lock over the whole map: volume is one tick per client per interval.
pub struct PlAggregator {
    entries: RwLock<HashMap<ClientId, PlEntry>>,
    updates: broadcast::Sender<PlTick>,
}

impl PlAggregator {
    pub fn new(subscriber_capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(subscriber_capacity.max(1));
        Self { entries: RwLock::new(HashMap::new()), updates }
    }

    /// Last write wins; unknown client ids create a new entry.
    pub fn merge(&self, tick: PlTick) {
        let now = Utc::now();
        let len = {
            let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
            map.insert(tick.client_id.clone(), PlEntry { pnl: tick.pnl, updated_at: now });
            map.len()
        };
        PL_TICKS.inc();
        PL_CLIENTS.set(len as i64);
        PL_LAST_EVENT_TS.set(now.timestamp());
        // no subscribers is fine
        let _ = self.updates.send(tick);
    }

    /// Parses and merges one raw frame. Malformed frames are counted, logged
    /// and dropped; the error is returned for the caller's bookkeeping only.
    pub fn merge_frame(&self, raw: &str) -> Result<usize, FrameError> {
        match parse_frame(raw) {
            Ok(ticks) => {
                let n = ticks.len();
                for t in ticks {
                    self.merge(t);
                }
                Ok(n)
            }
            Err(e) => {
                PL_MALFORMED.inc();
                tracing::warn!(error = %e, frame = %truncate(raw, 200), "dropping malformed P/L frame");
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> PlSnapshot {
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        map.iter().map(|(k, e)| (k.clone(), e.pnl)).collect()
    }

    /// Snapshot with per-client last-update time, for staleness checks.
    pub fn snapshot_detailed(&self) -> BTreeMap<ClientId, PlEntry> {
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        map.iter().map(|(k, e)| (k.clone(), e.clone())).collect()
    }

    pub fn latest(&self, client_id: &ClientId) -> Option<Decimal> {
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        map.get(client_id).map(|e| e.pnl)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlTick> {
        self.updates.subscribe()
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn tick(id: &str, pnl: Decimal) -> PlTick { PlTick { client_id: id.into(), pnl } }

    #[test]
    fn last_write_wins_per_client() {
        let agg = PlAggregator::new(16);
        agg.merge(tick("A", dec!(10)));
        agg.merge(tick("A", dec!(12)));
        agg.merge(tick("B", dec!(-5)));
        let snap = agg.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[&ClientId::from("A")], dec!(12));
        assert_eq!(snap[&ClientId::from("B")], dec!(-5));
        assert_eq!(agg.latest(&"A".into()), Some(dec!(12)));
        assert_eq!(agg.latest(&"Z".into()), None);
    }

    #[test]
    fn frame_shapes() {
        assert_eq!(parse_frame(r#"{"clientId":"A","pnl":1.25}"#).unwrap(), vec![tick("A", dec!(1.25))]);
        assert_eq!(
            parse_frame(r#"{"type":"pl","data":{"clientId":"B","pnl":-3}}"#).unwrap(),
            vec![tick("B", dec!(-3))]
        );
        assert_eq!(parse_frame(r#"[{"clientId":"A","pnl":1},{"clientId":"B","pnl":2}]"#).unwrap().len(), 2);
        assert!(matches!(parse_frame("not json"), Err(FrameError::Json(_))));
        assert!(matches!(parse_frame("42"), Err(FrameError::Shape)));
        assert!(parse_frame(r#"{"clientId":"A"}"#).is_err());
    }

    #[test]
    fn malformed_frames_do_not_block_later_ones() {
        let agg = PlAggregator::new(16);
        assert!(agg.merge_frame("{oops").is_err());
        assert_eq!(agg.merge_frame(r#"{"clientId":"A","pnl":7}"#).unwrap(), 1);
        assert_eq!(agg.latest(&"A".into()), Some(dec!(7)));
    }

    #[tokio::test]
    async fn subscribers_see_incremental_ticks() {
        let agg = PlAggregator::new(16);
        let mut rx = agg.subscribe();
        agg.merge(tick("A", dec!(1)));
        assert_eq!(rx.recv().await.unwrap(), tick("A", dec!(1)));
    }

    #[tokio::test]
    async fn concurrent_writers_on_distinct_clients() {
        let agg = Arc::new(PlAggregator::new(16));
        let mut handles = Vec::new();
        for i in 0..16 {
            let agg = agg.clone();
            handles.push(tokio::spawn(async move {
                for v in 0..50i64 {
                    agg.merge(tick(&format!("c{i}"), Decimal::from(v)));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let snap = agg.snapshot();
        assert_eq!(snap.len(), 16);
        assert!(snap.values().all(|v| *v == dec!(49)));
    }

    #[test]
    fn detailed_snapshot_carries_timestamps() {
        let agg = PlAggregator::new(4);
        let before = Utc::now();
        agg.merge(tick("A", dec!(2)));
        let d = agg.snapshot_detailed();
        assert!(d[&ClientId::from("A")].updated_at >= before);
    }
}
