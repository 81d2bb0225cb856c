// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Dispatch --------
pub static ROUNDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("rounds_total", "completed dispatch rounds"), &["kind"]).unwrap()
});

pub static ROUNDS_EMPTY: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("rounds_no_orders_total", "rounds refused with no orders selected").unwrap()
});

pub static ORDERS_DISPATCHED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("orders_dispatched_total", "per-client order tasks dispatched").unwrap());

pub static ORDER_RESULTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("order_results_total", "per-client order outcomes"),
        &["outcome", "kind"],
    )
    .unwrap()
});

pub static ORDERS_IN_FLIGHT: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("orders_in_flight", "broker calls currently running").unwrap());

// Round wall time (milliseconds)
pub static ROUND_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("round_latency_ms", "Time from freeze to report (ms)")
            .buckets(vec![5.0, 25.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0]),
    )
    .unwrap()
});

// -------- P/L feed --------
pub static PL_TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("pl_ticks_total", "P/L ticks merged").unwrap());

pub static PL_MALFORMED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("pl_malformed_total", "P/L frames dropped as malformed").unwrap());

pub static PL_CLIENTS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("pl_clients", "clients present in the P/L snapshot").unwrap());

pub static PL_WS_CONNECTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("pl_ws_connected", "1 if the P/L stream is connected, 0 otherwise").unwrap());

pub static PL_WS_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("pl_ws_reconnects_total", "P/L stream reconnect attempts").unwrap());

pub static PL_LAST_EVENT_TS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("pl_last_event_ts", "Unix seconds of the last merged P/L tick").unwrap()
});

// ---- Config visibility ----
pub static CONFIG_BROKER_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_broker_mode", "broker mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_feed_mode", "P/L feed mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_MAX_IN_FLIGHT: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("config_max_in_flight", "dispatch worker-pool bound").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(ROUNDS.clone())),
        REGISTRY.register(Box::new(ROUNDS_EMPTY.clone())),
        REGISTRY.register(Box::new(ORDERS_DISPATCHED.clone())),
        REGISTRY.register(Box::new(ORDER_RESULTS.clone())),
        REGISTRY.register(Box::new(ORDERS_IN_FLIGHT.clone())),
        REGISTRY.register(Box::new(ROUND_LATENCY.clone())),
        // P/L feed
        REGISTRY.register(Box::new(PL_TICKS.clone())),
        REGISTRY.register(Box::new(PL_MALFORMED.clone())),
        REGISTRY.register(Box::new(PL_CLIENTS.clone())),
        REGISTRY.register(Box::new(PL_WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(PL_WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(PL_LAST_EVENT_TS.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_BROKER_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_MAX_IN_FLIGHT.clone())),
    ] {
        if let Err(e) = m {
            tracing::warn!(?e, "metric registration failed");
        }
    }
}

/// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}
