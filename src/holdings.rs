// ===============================
// src/holdings.rs
// ===============================
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::TokenHolder;

#[derive(Debug, Error)]
pub enum HoldingsError {
    #[error("token {0} on {1} not found")]
    UnknownToken(String, String),
    #[error("holdings source error: {0}")]
    Source(String),
}

#[async_trait]
pub trait HoldingsResolver: Send + Sync {
    async fn holders_of(&self, token_symbol: &str, token_exchange: &str) -> Result<Vec<TokenHolder>, HoldingsError>;
}

fn key(symbol: &str, exchange: &str) -> (String, String) {
    (symbol.to_ascii_uppercase(), exchange.to_ascii_uppercase())
}

#[derive(Debug, Deserialize)]
struct HoldingsRow {
    token_symbol: String,
    token_exchange: String,
    holders: Vec<TokenHolder>,
}

/// Static holdings, keyed by (symbol, exchange), case-insensitive.
#[derive(Debug, Default)]
pub struct InMemoryHoldings {
    by_token: HashMap<(String, String), Vec<TokenHolder>>,
}

impl InMemoryHoldings {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, symbol: &str, exchange: &str, holders: Vec<TokenHolder>) -> Self {
        self.by_token.insert(key(symbol, exchange), holders);
        self
    }

    pub fn from_file(path: &str) -> Result<Self, HoldingsError> {
        let raw = std::fs::read_to_string(path).map_err(|e| HoldingsError::Source(format!("{path}: {e}")))?;
        let rows: Vec<HoldingsRow> =
            serde_json::from_str(&raw).map_err(|e| HoldingsError::Source(format!("{path}: {e}")))?;
        Ok(rows
            .into_iter()
            .fold(Self::new(), |acc, r| acc.with(&r.token_symbol, &r.token_exchange, r.holders)))
    }
}

#[async_trait]
impl HoldingsResolver for InMemoryHoldings {
    async fn holders_of(&self, token_symbol: &str, token_exchange: &str) -> Result<Vec<TokenHolder>, HoldingsError> {
        self.by_token
            .get(&key(token_symbol, token_exchange))
            .cloned()
            .ok_or_else(|| HoldingsError::UnknownToken(token_symbol.into(), token_exchange.into()))
    }
}

/// Platform backend: GET /api/v1/tokens/{symbol}/holders?token_exchange=..
pub struct RestHoldings {
    http: reqwest::Client,
    base: String,
}

impl RestHoldings {
    pub fn new(http: reqwest::Client, base: &str) -> Self {
        Self { http, base: base.trim_end_matches('/').to_string() }
    }
}

#[async_trait]
impl HoldingsResolver for RestHoldings {
    async fn holders_of(&self, token_symbol: &str, token_exchange: &str) -> Result<Vec<TokenHolder>, HoldingsError> {
        let url = format!(
            "{}/api/v1/tokens/{}/holders?token_exchange={}",
            self.base,
            urlencoding::encode(token_symbol),
            urlencoding::encode(token_exchange)
        );
        let rsp = self.http.get(url).send().await.map_err(|e| HoldingsError::Source(e.to_string()))?;
        match rsp.status() {
            reqwest::StatusCode::NOT_FOUND => {
                Err(HoldingsError::UnknownToken(token_symbol.into(), token_exchange.into()))
            }
            s if s.is_success() => {
                rsp.json::<Vec<TokenHolder>>().await.map_err(|e| HoldingsError::Source(e.to_string()))
            }
            s => Err(HoldingsError::Source(format!("holders: HTTP {s}"))),
        }
    }
}
