// ===============================
// src/config.rs
// ===============================
use std::env;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;

use crate::domain::TradeType;

/// Where orders go
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerMode {
    Mock,
    Rest,
}

impl BrokerMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(BrokerMode::Mock),
            "rest" | "live" => Some(BrokerMode::Rest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerMode::Mock => "mock",
            BrokerMode::Rest => "rest",
        }
    }
}

/// Where P/L ticks come from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    Ws,
    Off,
}

impl FeedMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(FeedMode::Mock),
            "ws" | "websocket" => Some(FeedMode::Ws),
            "off" | "none" => Some(FeedMode::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::Ws => "ws",
            FeedMode::Off => "off",
        }
    }
}

/// When a completed round clears its dispatched quantities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearPolicy {
    /// Only if at least one order in the round was accepted.
    AnyAccepted,
    /// Every completed round, whatever the per-client outcomes.
    Always,
}

impl ClearPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any_accepted" | "accepted" => Some(ClearPolicy::AnyAccepted),
            "always" => Some(ClearPolicy::Always),
            _ => None,
        }
    }
}

/// Command-line overrides; anything not given falls back to env / .env.
#[derive(Parser, Debug, Default)]
#[command(name = "bulk_desk", about = "Multi-client bulk order desk with live P/L aggregation")]
pub struct Cli {
    /// HTTP port for the desk API and /metrics
    #[arg(long)]
    pub api_port: Option<u16>,
    /// mock | rest
    #[arg(long)]
    pub broker_mode: Option<String>,
    /// mock | ws | off
    #[arg(long)]
    pub feed_mode: Option<String>,
    /// JSON file with the client list
    #[arg(long)]
    pub clients_file: Option<String>,
    /// JSONL journal of desk events
    #[arg(long)]
    pub record_file: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub api_port: u16,
    pub record_file: Option<String>,

    // collaborators
    pub broker_mode: BrokerMode,
    pub broker_rest_url: String,
    pub broker_password: String,
    pub broker_two_fa: String,
    pub broker_credentials_file: Option<String>,
    pub mock_fill_ms: u64,
    pub mock_max_qty: u32,
    pub clients_file: Option<String>,
    pub registry_url: Option<String>,
    pub holdings_file: Option<String>,

    // P/L feed
    pub feed_mode: FeedMode,
    pub pl_ws_url: String,
}

#[derive(Clone, Debug)]
pub struct DispatchLimits {
    pub task_timeout: Duration,
    pub max_in_flight: usize,
    pub clear_policy: ClearPolicy,
    pub exit_trade_type: TradeType,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_millis(5_000),
            max_in_flight: 32,
            clear_policy: ClearPolicy::AnyAccepted,
            exit_trade_type: TradeType::Intraday,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReconnectCfg {
    pub base_ms: u64,
    pub max_shift: u32,
    pub jitter_ms: u64,
    /// Consecutive failures before the feed is reported as down.
    pub alert_after: u32,
}

impl Default for ReconnectCfg {
    fn default() -> Self {
        Self { base_ms: 500, max_shift: 6, jitter_ms: 250, alert_after: 10 }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

/// Per-order deadline, never below 1ms.
pub fn task_timeout(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

pub fn load(cli: Cli) -> (Args, DispatchLimits, ReconnectCfg) {
    // .env first so every key below can come from it
    let _ = dotenv();

    let broker_mode = cli
        .broker_mode
        .or_else(|| env_opt("BROKER_MODE"))
        .and_then(|s| BrokerMode::parse(&s))
        .unwrap_or(BrokerMode::Mock);
    let feed_mode = cli
        .feed_mode
        .or_else(|| env_opt("FEED_MODE"))
        .and_then(|s| FeedMode::parse(&s))
        .unwrap_or(FeedMode::Mock);

    let args = Args {
        api_port: cli.api_port.unwrap_or_else(|| env_parse("API_PORT", 9899)),
        record_file: cli.record_file.or_else(|| env_opt("RECORD_FILE")),
        broker_mode,
        broker_rest_url: env_opt("BROKER_REST_URL")
            .unwrap_or_else(|| "https://api.motilaloswal.com".to_string()),
        broker_password: env::var("BROKER_PASSWORD").unwrap_or_default(),
        broker_two_fa: env::var("BROKER_TWO_FA").unwrap_or_default(),
        broker_credentials_file: env_opt("BROKER_CREDENTIALS_FILE"),
        mock_fill_ms: env_parse("MOCK_FILL_MS", 20),
        mock_max_qty: env_parse("MOCK_MAX_QTY", 1_000),
        clients_file: cli.clients_file.or_else(|| env_opt("CLIENTS_FILE")),
        registry_url: env_opt("REGISTRY_URL"),
        holdings_file: env_opt("HOLDINGS_FILE"),
        feed_mode,
        pl_ws_url: env_opt("PL_WS_URL").unwrap_or_else(|| "ws://localhost:8000/ws/pl".to_string()),
    };

    let defaults = DispatchLimits::default();
    let limits = DispatchLimits {
        task_timeout: task_timeout(env_parse("TASK_TIMEOUT_MS", 5_000u64)),
        max_in_flight: env_parse("MAX_IN_FLIGHT", defaults.max_in_flight).max(1),
        clear_policy: env_opt("CLEAR_POLICY")
            .and_then(|s| ClearPolicy::parse(&s))
            .unwrap_or(defaults.clear_policy),
        exit_trade_type: env_opt("EXIT_TRADE_TYPE")
            .and_then(|s| TradeType::parse(&s))
            .unwrap_or(defaults.exit_trade_type),
    };

    let rd = ReconnectCfg::default();
    let reconnect = ReconnectCfg {
        base_ms: env_parse("RECONNECT_BASE_MS", rd.base_ms),
        max_shift: env_parse("RECONNECT_MAX_SHIFT", rd.max_shift),
        jitter_ms: rd.jitter_ms,
        alert_after: env_parse("RECONNECT_ALERT_AFTER", rd.alert_after),
    };

    (args, limits, reconnect)
}
