// ===============================
// src/main.rs
// ===============================
/*
 # stage quantities, fire one round
 curl -s -X PUT localhost:9899/quantities/c1 -d '{"quantity":10}'
 curl -s -X PUT localhost:9899/quantities/c3 -d '{"quantity":5}'
 curl -s -X POST localhost:9899/execute

 # exit a token for everyone who holds it, minus one opt-out
 curl -s 'localhost:9899/tokens/RELIANCE/holders?exchange=NSE'
 curl -s -X POST localhost:9899/tokens/RELIANCE/selection -d '{"exchange":"NSE","client_id":"c2","selected":false}'
 curl -s -X POST localhost:9899/exit -d '{"token_symbol":"RELIANCE","token_exchange":"NSE"}'

 # live P/L
 curl -s localhost:9899/pl
 curl -sN localhost:9899/pl/stream
 curl -s localhost:9899/metrics | egrep '^(rounds|order_results|pl_)'
*/
mod api;
mod config;
mod desk;
mod domain;
mod executor;
mod exit;
mod feed;
mod gateway;      // Brokerage trait + mock broker
mod gateway_rest; // live brokerage REST adapter
mod holdings;
mod metrics;
mod pnl;
mod posttrade;
mod recorder;
mod registry;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::{select, sync::broadcast, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{BrokerMode, FeedMode};
use crate::desk::Desk;
use crate::domain::Event;
use crate::executor::BulkExecutor;
use crate::exit::TokenExitCoordinator;
use crate::gateway::{Brokerage, MockBroker};
use crate::gateway_rest::RestBroker;
use crate::holdings::{HoldingsResolver, InMemoryHoldings, RestHoldings};
use crate::pnl::PlAggregator;
use crate::registry::{ClientRegistry, InMemoryRegistry, RestRegistry};

const MOCK_PL_EVERY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let (args, limits, reconnect) = config::load(config::Cli::parse());

    // ---- Metrics + startup info ----
    metrics::init();
    metrics::CONFIG_BROKER_MODE.with_label_values(&[args.broker_mode.as_str()]).set(1);
    metrics::CONFIG_FEED_MODE.with_label_values(&[args.feed_mode.as_str()]).set(1);
    metrics::CONFIG_MAX_IN_FLIGHT.set(limits.max_in_flight as i64);
    info!(
        broker_mode = args.broker_mode.as_str(),
        feed_mode = args.feed_mode.as_str(),
        api_port = args.api_port,
        max_in_flight = limits.max_in_flight,
        task_timeout_ms = limits.task_timeout.as_millis() as u64,
        clear_policy = ?limits.clear_policy,
        exit_trade_type = limits.exit_trade_type.as_str(),
        "startup config"
    );

    let http = reqwest::Client::builder()
        .timeout(limits.task_timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!(?e, "http client builder failed, using defaults");
            reqwest::Client::new()
        });

    // ---- Collaborators ----
    let registry: Arc<dyn ClientRegistry> = match (&args.registry_url, &args.clients_file) {
        (Some(url), _) => Arc::new(RestRegistry::new(http.clone(), url)),
        (None, Some(path)) => match InMemoryRegistry::from_file(path) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                error!(error = %e, "client list unreadable, starting with no clients");
                Arc::new(InMemoryRegistry::default())
            }
        },
        (None, None) => {
            warn!("no CLIENTS_FILE or REGISTRY_URL, starting with no clients");
            Arc::new(InMemoryRegistry::default())
        }
    };

    let broker: Arc<dyn Brokerage> = match args.broker_mode {
        BrokerMode::Mock => Arc::new(MockBroker::new(args.mock_fill_ms, args.mock_max_qty)),
        BrokerMode::Rest => {
            let creds = match args.broker_credentials_file.as_deref().map(gateway_rest::load_credentials) {
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    error!(error = %e, "broker credentials unreadable; every order will be rejected");
                    Vec::new()
                }
                None => {
                    warn!("BROKER_CREDENTIALS_FILE not set; every order will be rejected");
                    Vec::new()
                }
            };
            info!(clients = creds.len(), base = %args.broker_rest_url, "REST brokerage");
            Arc::new(RestBroker::new(
                http.clone(),
                &args.broker_rest_url,
                args.broker_password.clone(),
                args.broker_two_fa.clone(),
                creds,
            ))
        }
    };

    let holdings: Arc<dyn HoldingsResolver> = match (&args.holdings_file, &args.registry_url) {
        (Some(path), _) => match InMemoryHoldings::from_file(path) {
            Ok(h) => Arc::new(h),
            Err(e) => {
                error!(error = %e, "holdings file unreadable, exits will find no holders");
                Arc::new(InMemoryHoldings::new())
            }
        },
        (None, Some(url)) => Arc::new(RestHoldings::new(http.clone(), url)),
        (None, None) => Arc::new(InMemoryHoldings::new()),
    };

    // ---- Buses + core ----
    let (event_tx, _event_rx) = broadcast::channel::<Event>(8192);
    let pl = Arc::new(PlAggregator::new(4096));
    let executor = Arc::new(BulkExecutor::new(broker, registry.clone(), limits.clone(), event_tx.clone()));
    let exits = TokenExitCoordinator::new(holdings, executor.clone());
    let desk = Arc::new(Desk::new(executor, exits, pl.clone(), event_tx.clone()));

    // ---- Post-trade log + journal ----
    tokio::spawn(posttrade::run(event_tx.subscribe()));
    if let Some(path) = args.record_file.clone() {
        tokio::spawn(recorder::run(event_tx.subscribe(), path));
    }

    // ---- P/L feed ----
    match args.feed_mode {
        FeedMode::Off => info!("P/L feed disabled"),
        FeedMode::Mock => match feed::StreamGuard::claim() {
            Ok(guard) => {
                let ids = match registry.list_clients().await {
                    Ok(clients) => clients.into_iter().map(|c| c.id).collect(),
                    Err(e) => {
                        warn!(error = %e, "no client list for mock P/L");
                        Vec::new()
                    }
                };
                tokio::spawn(feed::run_mock(pl.clone(), ids, MOCK_PL_EVERY, guard));
            }
            Err(e) => error!(error = %e, "mock P/L feed not started"),
        },
        FeedMode::Ws => match (feed::parse_url(&args.pl_ws_url), feed::StreamGuard::claim()) {
            (Ok(url), Ok(guard)) => {
                tokio::spawn(feed::run_ws(url, pl.clone(), reconnect, guard));
            }
            (Err(e), _) | (_, Err(e)) => error!(error = %e, "P/L stream not started"),
        },
    }

    // ---- API ----
    let addr = SocketAddr::from(([0, 0, 0, 0], args.api_port));
    let api = api::spawn_api(addr, desk.clone());

    // ---- Heartbeat ----
    let mut heartbeat = tokio::time::interval(Duration::from_secs(5));
    loop {
        select! {
            _ = heartbeat.tick() => {
                info!(pl_clients = desk.pl_snapshot().len(), staged = desk.quantities().await.len(), "heartbeat");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
        if api.is_finished() {
            error!("api task exited, shutting down");
            break;
        }
    }
}
