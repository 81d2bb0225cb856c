// ===============================
// src/feed.rs
// ===============================
//
// P/L push-source adapters:
// - run_ws   : WebSocket consumer, reconnects forever with exponential
//              backoff + jitter, merges each frame into the aggregator
// - run_mock : random-walk P/L per registered client
//
// At most one consumer runs per process; spawning takes a StreamGuard.
//
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};
use url::Url;

use crate::config::ReconnectCfg;
use crate::domain::{ClientId, PlTick};
use crate::metrics::{PL_WS_CONNECTED, PL_WS_RECONNECTS};
use crate::pnl::PlAggregator;

static STREAM_ACTIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("a P/L stream consumer is already running")]
    AlreadyRunning,
    #[error("bad P/L stream url {0}: {1}")]
    BadUrl(String, String),
}

/// Held by the one live consumer; released on drop.
#[derive(Debug)]
pub struct StreamGuard {
    flag: &'static AtomicBool,
}

impl StreamGuard {
    pub fn claim() -> Result<Self, FeedError> { Self::claim_on(&STREAM_ACTIVE) }

    fn claim_on(flag: &'static AtomicBool) -> Result<Self, FeedError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| StreamGuard { flag })
            .map_err(|_| FeedError::AlreadyRunning)
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) { self.flag.store(false, Ordering::Release); }
}

/// Exponential backoff: base * 2^min(attempt, max_shift) + jitter.
#[derive(Debug)]
pub struct Backoff {
    cfg: ReconnectCfg,
    attempt: u32,
}

impl Backoff {
    pub fn new(cfg: ReconnectCfg) -> Self { Self { cfg, attempt: 0 } }

    pub fn reset(&mut self) { self.attempt = 0; }

    pub fn attempts(&self) -> u32 { self.attempt }

    /// Delay before the next attempt, without jitter.
    pub fn base_delay(&self) -> Duration {
        let shift = self.attempt.min(self.cfg.max_shift).min(20);
        Duration::from_millis(self.cfg.base_ms.saturating_mul(1u64 << shift))
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let jitter = if self.cfg.jitter_ms > 0 { rand::thread_rng().gen_range(0..=self.cfg.jitter_ms) } else { 0 };
        self.base_delay() + Duration::from_millis(jitter)
    }
}

pub fn parse_url(raw: &str) -> Result<Url, FeedError> {
    Url::parse(raw).map_err(|e| FeedError::BadUrl(raw.to_string(), e.to_string()))
}

/// Long-lived P/L subscription. Never returns on transport loss; a gap just
/// means stale values until the next tick for that client.
pub async fn run_ws(url: Url, agg: Arc<PlAggregator>, cfg: ReconnectCfg, _guard: StreamGuard) {
    let alert_after = cfg.alert_after.max(1);
    let mut backoff = Backoff::new(cfg);
    loop {
        info!(%url, "connecting P/L stream");
        match connect_async(url.clone()).await {
            Ok((mut ws, _resp)) => {
                info!(%url, "P/L stream connected");
                PL_WS_CONNECTED.set(1);
                backoff.reset();

                while let Some(frame) = ws.next().await {
                    match frame {
                        Ok(Message::Text(txt)) => {
                            // malformed frames are logged and counted inside
                            let _ = agg.merge_frame(&txt);
                        }
                        Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                            Ok(txt) => {
                                let _ = agg.merge_frame(txt);
                            }
                            Err(e) => warn!(?e, "non-utf8 binary P/L frame dropped"),
                        },
                        Ok(Message::Ping(p)) => {
                            if let Err(e) = ws.send(Message::Pong(p)).await {
                                error!(?e, "pong failed");
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            error!(?e, "P/L stream read error");
                            break;
                        }
                    }
                }
                PL_WS_CONNECTED.set(0);
                info!("P/L stream disconnected, will reconnect");
            }
            Err(e) => {
                error!(?e, attempt = backoff.attempts() + 1, "P/L stream connect failed");
            }
        }

        PL_WS_RECONNECTS.inc();
        let delay = backoff.next_delay();
        if backoff.attempts() % alert_after == 0 {
            error!(failures = backoff.attempts(), "P/L stream still down, snapshot values are going stale");
        }
        sleep(delay).await;
    }
}

/// Random-walk P/L for every given client, one tick per client per interval.
pub async fn run_mock(agg: Arc<PlAggregator>, clients: Vec<ClientId>, every: Duration, _guard: StreamGuard) {
    info!(clients = clients.len(), "mock P/L feed started");
    let mut pnl: Vec<Decimal> = vec![Decimal::ZERO; clients.len()];
    loop {
        for (i, id) in clients.iter().enumerate() {
            // don't hold ThreadRng across .await
            let step: i64 = rand::thread_rng().gen_range(-5_000..=5_000);
            pnl[i] += Decimal::new(step, 2);
            agg.merge(PlTick { client_id: id.clone(), pnl: pnl[i] });
        }
        sleep(every).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn only_one_consumer_at_a_time() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let first = StreamGuard::claim_on(&FLAG).unwrap();
        assert_eq!(StreamGuard::claim_on(&FLAG).unwrap_err(), FeedError::AlreadyRunning);
        drop(first);
        assert!(StreamGuard::claim_on(&FLAG).is_ok());
    }

    #[test]
    fn backoff_doubles_then_caps_and_resets() {
        let mut b = Backoff::new(ReconnectCfg { base_ms: 500, max_shift: 3, jitter_ms: 0, alert_after: 10 });
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 4_000, 4_000]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(1_000));
    }

    #[test]
    fn bad_url_is_reported() {
        assert!(matches!(parse_url("not a url"), Err(FeedError::BadUrl(..))));
        assert!(parse_url("ws://localhost:8000/ws/pl").is_ok());
    }

    #[tokio::test]
    async fn ws_consumer_survives_bad_frames_and_reconnects() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // first session: one good frame, one bad frame, then hang up
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"{"clientId":"A","pnl":10}"#.into())).await.unwrap();
            ws.send(Message::Text("garbage".into())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"pl","data":{"clientId":"A","pnl":12}}"#.into())).await.unwrap();
            ws.close(None).await.unwrap();
            drop(ws);

            // second session after reconnect
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"{"clientId":"B","pnl":-5}"#.into())).await.unwrap();
            sleep(Duration::from_secs(5)).await;
        });

        let agg = Arc::new(PlAggregator::new(16));
        let url = parse_url(&format!("ws://{addr}/ws/pl")).unwrap();
        let cfg = ReconnectCfg { base_ms: 5, max_shift: 2, jitter_ms: 0, alert_after: 10 };
        let consumer = tokio::spawn(run_ws(url, agg.clone(), cfg, StreamGuard::claim_on(&FLAG).unwrap()));

        let done = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if agg.latest(&"B".into()).is_some() {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        consumer.abort();
        assert!(done.is_ok(), "never saw the post-reconnect tick");

        let snap = agg.snapshot();
        assert_eq!(snap[&ClientId::from("A")], dec!(12));
        assert_eq!(snap[&ClientId::from("B")], dec!(-5));
    }

    #[tokio::test]
    async fn mock_feed_covers_every_client() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let agg = Arc::new(PlAggregator::new(16));
        let ids = vec![ClientId::from("c1"), ClientId::from("c2")];
        let h = tokio::spawn(run_mock(agg.clone(), ids, Duration::from_millis(5), StreamGuard::claim_on(&FLAG).unwrap()));
        sleep(Duration::from_millis(50)).await;
        h.abort();
        assert_eq!(agg.snapshot().len(), 2);
    }
}
