// ===============================
// src/api.rs (HTTP/JSON surface over the desk)
// ===============================
//
//   GET   /intent                      PATCH /intent
//   GET   /quantities                  PUT   /quantities/{client_id}
//   POST  /execute                     GET   /clients
//   GET   /tokens/{symbol}/holders?exchange=NSE (or token_exchange=NSE)
//   POST  /tokens/{symbol}/selection   POST  /exit
//   GET   /pl   GET /pl/{client_id}    GET   /pl/stream (NDJSON)
//   GET   /metrics
//
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::{to_bytes, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::desk::{Desk, DeskError};
use crate::domain::{ClientId, PlTick, TradeIntentPatch};
use crate::executor::DispatchError;
use crate::exit::ExitError;
use crate::holdings::HoldingsError;
use crate::metrics::encode_metrics;
use crate::registry::RegistryError;

const DEFAULT_EXCHANGE: &str = "NSE";

#[derive(Debug, Deserialize)]
struct QuantityBody {
    quantity: i64,
}

#[derive(Debug, Deserialize)]
struct SelectionBody {
    #[serde(default)]
    exchange: Option<String>,
    client_id: ClientId,
    selected: bool,
}

#[derive(Debug, Deserialize)]
struct ExitBody {
    token_symbol: String,
    #[serde(default)]
    token_exchange: Option<String>,
    #[serde(default)]
    clients_to_exit: Option<Vec<ClientId>>,
}

pub fn spawn_api(addr: SocketAddr, desk: Arc<Desk>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let desk = desk.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let desk = desk.clone();
                    async move { Ok::<_, Infallible>(route(req, desk).await) }
                }))
            }
        });
        let server = match Server::try_bind(&addr) {
            Ok(b) => b.serve(make_svc),
            Err(e) => {
                error!(error = %e, %addr, "api bind failed");
                return;
            }
        };
        info!(%addr, "desk api listening");
        if let Err(e) = server.await {
            error!(error = %e, %addr, "api server terminated");
        }
    })
}

pub async fn route(req: Request<Body>, desk: Arc<Desk>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().trim_end_matches('/').to_string();
    let query = parts.uri.query().unwrap_or("").to_string();
    let body = match to_bytes(body).await {
        Ok(b) => b,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("failed to read request body: {e}")),
    };
    let segs: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string()))
        .collect();
    let segs: Vec<&str> = segs.iter().map(String::as_str).collect();

    match (&parts.method, segs.as_slice()) {
        (&Method::GET, ["intent"]) => ok(&desk.trade_intent().await),
        (&Method::PATCH, ["intent"]) => match parse_body::<TradeIntentPatch>(&body) {
            Ok(patch) => ok(&desk.set_trade_intent(patch).await),
            Err(rsp) => rsp,
        },
        (&Method::GET, ["quantities"]) => ok(&desk.quantities().await),
        (&Method::PUT, ["quantities", id]) => match parse_body::<QuantityBody>(&body) {
            Ok(b) => match desk.set_quantity((*id).into(), b.quantity).await {
                Ok(()) => ok(&desk.quantities().await),
                Err(e) => desk_error(e),
            },
            Err(rsp) => rsp,
        },
        (&Method::POST, ["execute"]) => match desk.execute_all().await {
            Ok(report) => ok(&report),
            Err(e) => desk_error(e),
        },
        (&Method::GET, ["clients"]) => match desk.clients().await {
            Ok(clients) => ok(&clients),
            Err(e) => desk_error(e),
        },
        (&Method::GET, ["tokens", symbol, "holders"]) => {
            let exchange = query_param(&query, "exchange")
                .or_else(|| query_param(&query, "token_exchange"))
                .unwrap_or_else(|| DEFAULT_EXCHANGE.to_string());
            match desk.holders(symbol, &exchange).await {
                Ok(sel) => ok(&sel),
                Err(e) => desk_error(e),
            }
        }
        (&Method::POST, ["tokens", symbol, "selection"]) => match parse_body::<SelectionBody>(&body) {
            Ok(b) => {
                let exchange = b.exchange.unwrap_or_else(|| DEFAULT_EXCHANGE.to_string());
                match desk.set_exit_selected(symbol, &exchange, &b.client_id, b.selected).await {
                    Ok(sel) => ok(&sel),
                    Err(e) => desk_error(e),
                }
            }
            Err(rsp) => rsp,
        },
        (&Method::POST, ["exit"]) => match parse_body::<ExitBody>(&body) {
            Ok(b) => {
                let exchange = b.token_exchange.unwrap_or_else(|| DEFAULT_EXCHANGE.to_string());
                match desk.exit_token(&b.token_symbol, &exchange, b.clients_to_exit).await {
                    Ok(report) => ok(&report),
                    Err(e) => desk_error(e),
                }
            }
            Err(rsp) => rsp,
        },
        (&Method::GET, ["pl"]) => {
            if query_param(&query, "detail").is_some() {
                ok(&desk.pl_detailed())
            } else {
                ok(&desk.pl_snapshot())
            }
        }
        (&Method::GET, ["pl", "stream"]) => pl_stream(&desk),
        (&Method::GET, ["pl", id]) => {
            let id = ClientId::from(*id);
            match desk.pl_latest(&id) {
                Some(pnl) => ok(&PlTick { client_id: id, pnl }),
                None => error_response(StatusCode::NOT_FOUND, format!("no P/L for {id}")),
            }
        }
        (&Method::GET, ["metrics"]) => {
            let mut rsp = Response::new(Body::from(encode_metrics()));
            rsp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
            rsp
        }
        _ => error_response(StatusCode::NOT_FOUND, "endpoint not found"),
    }
}

/// Current snapshot first, then every merged tick as one JSON line.
fn pl_stream(desk: &Desk) -> Response<Body> {
    let (mut tx, body) = Body::channel();
    let mut rx = desk.subscribe_pl();
    let initial: Vec<PlTick> =
        desk.pl_snapshot().into_iter().map(|(client_id, pnl)| PlTick { client_id, pnl }).collect();
    tokio::spawn(async move {
        for tick in initial {
            if tx.send_data(ndjson(&tick)).await.is_err() {
                return;
            }
        }
        loop {
            match rx.recv().await {
                Ok(tick) => {
                    if tx.send_data(ndjson(&tick)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "P/L stream subscriber lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    let mut rsp = Response::new(body);
    rsp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"));
    rsp
}

fn ndjson<T: Serialize>(v: &T) -> Bytes {
    let mut line = serde_json::to_vec(v).unwrap_or_default();
    line.push(b'\n');
    Bytes::from(line)
}

fn desk_error(e: DeskError) -> Response<Body> {
    let status = match &e {
        DeskError::Session(_) => StatusCode::BAD_REQUEST,
        DeskError::Dispatch(DispatchError::NoOrdersSelected)
        | DeskError::Exit(ExitError::Dispatch(DispatchError::NoOrdersSelected)) => StatusCode::UNPROCESSABLE_ENTITY,
        DeskError::Exit(ExitError::Holdings(HoldingsError::UnknownToken(..)))
        | DeskError::Exit(ExitError::UnknownHolder(_))
        | DeskError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
        DeskError::Exit(ExitError::NotLoaded(..)) => StatusCode::CONFLICT,
        DeskError::Exit(ExitError::Holdings(HoldingsError::Source(_)))
        | DeskError::Registry(RegistryError::Source(_)) => StatusCode::BAD_GATEWAY,
        DeskError::RoundAborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response<Body>> {
    serde_json::from_slice(body).map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("invalid body: {e}")))
}

fn query_param(query: &str, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn ok<T: Serialize>(v: &T) -> Response<Body> {
    match serde_json::to_vec(v) {
        Ok(buf) => json_response(StatusCode::OK, buf),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("encode failed: {e}")),
    }
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response<Body> {
    let body = json!({ "error": msg.into() }).to_string().into_bytes();
    json_response(status, body)
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    let mut rsp = Response::new(Body::from(body));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    rsp
}
