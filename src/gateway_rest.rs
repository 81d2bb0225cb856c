// ===============================
// src/gateway_rest.rs
// ===============================
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::domain::{Client, ClientId, OrderTask};
use crate::gateway::{BrokerError, Brokerage};

const LOGIN_PATH: &str = "/rest/login/v4/authdirectapi";
const PLACE_ORDER_PATH: &str = "/rest/trans/v1/placeorder";
const USER_AGENT: &str = "MOSL/V.1.1.0";

/// Per-client API credentials, loaded from `BROKER_CREDENTIALS_FILE`.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub id: ClientId,
    pub api_key: String,
    pub api_secret: String,
}

pub fn load_credentials(path: &str) -> Result<Vec<Credentials>, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("{path}: {e}"))?;
    serde_json::from_str(&raw).map_err(|e| format!("{path}: {e}"))
}

/// Login checksum: hex(sha256(password + api_key)).
pub fn login_checksum(password: &str, api_key: &str) -> String {
    let mut h = Sha256::new();
    h.update(password.as_bytes());
    h.update(api_key.as_bytes());
    hex::encode(h.finalize())
}

pub fn order_body(client: &Client, task: &OrderTask) -> Value {
    json!({
        "clientcode": client.broker_client_id,
        "symbol": task.token_symbol,
        "exchange": task.token_exchange,
        "quantity": task.quantity,
        "type": task.order_type.as_str(),
        "side": task.side.as_str(),
        "producttype": task.trade_type.as_str(),
    })
}

/// Maps a placeorder response body to the broker order id or a rejection.
pub fn interpret_place_response(v: &Value) -> Result<String, BrokerError> {
    let status = v.get("status").and_then(|s| s.as_str()).unwrap_or("ERROR");
    let message = v.get("message").and_then(|s| s.as_str()).unwrap_or("order placement failed");
    if status.eq_ignore_ascii_case("ERROR") {
        return Err(BrokerError::Rejected(message.to_string()));
    }
    match v.pointer("/data/orderid").or_else(|| v.get("uniqueorderid")) {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(BrokerError::Rejected(format!("no order id in response: {message}"))),
    }
}

/// Brokerage REST adapter. One cached session token per client.
pub struct RestBroker {
    http: reqwest::Client,
    base: String,
    password: String,
    two_fa: String,
    creds: HashMap<ClientId, Credentials>,
    tokens: RwLock<HashMap<ClientId, String>>,
}

impl RestBroker {
    pub fn new(http: reqwest::Client, base: &str, password: String, two_fa: String, creds: Vec<Credentials>) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            password,
            two_fa,
            creds: creds.into_iter().map(|c| (c.id.clone(), c)).collect(),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    fn request(&self, path: &str, creds: &Credentials, auth: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{}", self.base, path))
            .header("Accept", "application/json")
            .header("Authorization", auth)
            .header("User-Agent", USER_AGENT)
            .header("apikey", &creds.api_key)
            .header("apisecretkey", &creds.api_secret)
            .header("sourceid", "WEB")
    }

    async fn session_token(&self, client: &Client, creds: &Credentials) -> Result<String, BrokerError> {
        if let Some(t) = self.tokens.read().await.get(&client.id) {
            return Ok(t.clone());
        }
        let body = json!({
            "userid": client.broker_client_id,
            "password": login_checksum(&self.password, &creds.api_key),
            "2FA": self.two_fa,
        });
        let rsp = self
            .request(LOGIN_PATH, creds, "")
            .json(&body)
            .send()
            .await
            .map_err(|e| BrokerError::Transport(format!("login: {e}")))?;
        if !rsp.status().is_success() {
            return Err(BrokerError::Transport(format!("login: HTTP {}", rsp.status())));
        }
        let v = rsp
            .json::<Value>()
            .await
            .map_err(|e| BrokerError::Transport(format!("login body: {e}")))?;
        let token = match (v.get("status").and_then(|s| s.as_str()), v.get("AuthToken").and_then(|s| s.as_str())) {
            (Some("SUCCESS"), Some(t)) => t.to_string(),
            _ => {
                let msg = v.get("message").and_then(|s| s.as_str()).unwrap_or("login failed");
                return Err(BrokerError::Rejected(format!("login failed: {msg}")));
            }
        };
        self.tokens.write().await.insert(client.id.clone(), token.clone());
        tracing::info!(client = %client.id, "broker session opened");
        Ok(token)
    }
}

#[async_trait]
impl Brokerage for RestBroker {
    async fn place_order(&self, client: &Client, task: &OrderTask) -> Result<String, BrokerError> {
        let creds = self
            .creds
            .get(&client.id)
            .ok_or_else(|| BrokerError::Rejected("no broker credentials for client".into()))?;
        let token = self.session_token(client, creds).await?;

        let rsp = self
            .request(PLACE_ORDER_PATH, creds, &token)
            .json(&order_body(client, task))
            .send()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let code = rsp.status();
        if code == reqwest::StatusCode::UNAUTHORIZED {
            // force a fresh login next time
            self.tokens.write().await.remove(&client.id);
            return Err(BrokerError::Transport("session expired".into()));
        }
        if code.is_server_error() {
            return Err(BrokerError::Transport(format!("HTTP {code}")));
        }
        let body = rsp.text().await.map_err(|e| BrokerError::Transport(e.to_string()))?;
        match serde_json::from_str::<Value>(&body) {
            Ok(v) => interpret_place_response(&v),
            Err(_) if code.is_success() => Err(BrokerError::Transport("undecodable broker response".into())),
            Err(_) => Err(BrokerError::Rejected(format!("HTTP {code}: {body}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderType, Side, TradeType};
    use crate::registry::test_clients;

    #[test]
    fn checksum_is_hex_sha256_of_password_then_key() {
        let c = login_checksum("pw", "key");
        assert_eq!(c.len(), 64);
        assert_eq!(c, login_checksum("pwk", "ey"));
        assert_ne!(c, login_checksum("key", "pw"));
    }

    #[test]
    fn body_carries_task_fields() {
        let client = &test_clients(&["c1"])[0];
        let task = OrderTask {
            client_id: "c1".into(),
            token_symbol: "INFY".into(),
            token_exchange: "NSE".into(),
            trade_type: TradeType::Mtf,
            order_type: OrderType::Ltp,
            side: Side::Sell,
            quantity: 12,
        };
        let b = order_body(client, &task);
        assert_eq!(b["clientcode"], "BRK-c1");
        assert_eq!(b["producttype"], "MTF");
        assert_eq!(b["type"], "LTP");
        assert_eq!(b["side"], "SELL");
        assert_eq!(b["quantity"], 12);
    }

    #[test]
    fn place_response_mapping() {
        let ok = json!({"status": "SUCCESS", "message": "ok", "data": {"orderid": "990011"}});
        assert_eq!(interpret_place_response(&ok), Ok("990011".into()));

        let rej = json!({"status": "ERROR", "message": "insufficient margin"});
        assert_eq!(interpret_place_response(&rej), Err(BrokerError::Rejected("insufficient margin".into())));

        let no_id = json!({"status": "SUCCESS", "message": "queued"});
        assert!(matches!(interpret_place_response(&no_id), Err(BrokerError::Rejected(_))));
    }
}
