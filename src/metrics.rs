// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::{info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static TICKS_BY_SYMBOL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticks_total_by_symbol", "quote ticks applied per symbol"),
        &["symbol"],
    )
    .expect("metric")
});

pub static DROPPED_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("stream_dropped_messages_total", "push frames dropped as unparsable or unknown"),
        &["stream"],
    )
    .expect("metric")
});

// -------- Account stream --------
pub static ACCOUNT_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("account_events_total", "account stream events applied (label: type)"),
        &["type"],
    )
    .expect("metric")
});

pub static MARGIN_ALERTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("margin_alerts_total", "margin alerts received").expect("metric"));

pub static POSITIONS_OPEN: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("positions_open", "positions currently shown").expect("metric"));

// -------- Stream health --------
pub static WS_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("ws_connected", "1 if the push stream is connected, 0 otherwise"),
        &["stream"],
    )
    .expect("metric")
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_reconnects_total", "reconnect attempts per push stream"),
        &["stream"],
    )
    .expect("metric")
});

// -------- Gateway / orders / capital --------
pub static TOKEN_RENEWALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("token_renewals_total", "access token renewals (label: result)"),
        &["result"],
    )
    .expect("metric")
});

pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "order submissions by outcome"),
        &["outcome"],
    )
    .expect("metric")
});

pub static CAPITAL_REFRESH: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("capital_refresh_total", "capital summary refreshes (label: result)"),
        &["result"],
    )
    .expect("metric")
});

// ---- Config visibility ----
pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "subscribed symbols (label: symbol)"),
        &["symbol"],
    )
    .expect("metric")
});

pub fn init() {
    // Register all metrics to the custom registry; a second call is a no-op
    for m in [
        REGISTRY.register(Box::new(TICKS_BY_SYMBOL.clone())),
        REGISTRY.register(Box::new(DROPPED_MESSAGES.clone())),
        REGISTRY.register(Box::new(ACCOUNT_EVENTS.clone())),
        REGISTRY.register(Box::new(MARGIN_ALERTS.clone())),
        REGISTRY.register(Box::new(POSITIONS_OPEN.clone())),
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(TOKEN_RENEWALS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(CAPITAL_REFRESH.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let resp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") | (&Method::GET, "/metrics") => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()),
    };
    Ok(resp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serve `/metrics` until the process exits. Port 0 disables the endpoint.
pub async fn serve_metrics(port: u16) {
    if port == 0 {
        return;
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            warn!(%addr, error = %e, "metrics bind failed, endpoint disabled");
            return;
        }
    };
    info!("metrics listening on http://{addr}/metrics");
    if let Err(e) = server.await {
        warn!(error = %e, "metrics server stopped");
    }
}
